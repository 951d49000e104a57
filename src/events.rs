use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Info,
    Error,
}

/// A dismissible message for the notification bar. `undoable` notifications
/// offer an "Undo" button wired to `NoteActions::undo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub undoable: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn info(message: impl Into<String>, undoable: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: NotificationKind::Info,
            message: message.into(),
            undoable,
            created_at: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: NotificationKind::Error,
            message: message.into(),
            undoable: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RealtimeStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EngineEvent {
    NotesChanged { version: u64, action: String },
    LabelsChanged { version: u64 },
    Notification(Notification),
    NotificationDismissed { id: Uuid },
    UnloadGuard { active: bool },
    LayoutReload,
    Realtime(RealtimeStatus),
}

/// Broadcasts engine events to every subscriber (views, render controller,
/// tests). Sending never blocks; slow subscribers miss old events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn notify(&self, notification: Notification) {
        self.emit(EngineEvent::Notification(notification));
    }
}
