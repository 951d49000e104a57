pub mod merge;
pub mod sse;

use crate::api::{ByteStream, NotesApi};
use crate::errors::AppResult;
use crate::events::{EngineEvent, RealtimeStatus};
use crate::labels::LabelAction;
use crate::models::ClientId;
use crate::store::{NoteStore, Transition};
use crate::sync;
use futures_util::StreamExt;
use merge::Reconciliation;
use sse::SseMessage;
use std::sync::Arc;
use tokio::sync::watch;

enum StreamEnd {
    Offline,
    Closed,
    Shutdown,
}

/// Keeps the server change stream open while the client is online and folds
/// each pushed batch into the store.
pub struct RealtimeChannel {
    store: Arc<NoteStore>,
    api: Arc<dyn NotesApi>,
    client_id: ClientId,
}

impl RealtimeChannel {
    pub fn new(store: Arc<NoteStore>, api: Arc<dyn NotesApi>, client_id: ClientId) -> Self {
        Self { store, api, client_id }
    }

    /// Runs until the `online` sender is dropped. Every connection after the
    /// first is preceded by a full refetch, since pushes missed while
    /// disconnected are not replayed.
    pub async fn run(self, mut online: watch::Receiver<bool>) {
        let mut connected_before = false;
        loop {
            if online.wait_for(|online| *online).await.is_err() {
                return;
            }
            self.status(RealtimeStatus::Connecting);
            if connected_before {
                if let Err(error) = sync::refetch(&self.store, self.api.as_ref()).await {
                    tracing::warn!(error = %error, "refetch before reconnect failed");
                }
            }
            let stream = match self.api.open_stream(&self.client_id).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::warn!(error = %error, "could not open change stream");
                    self.status(RealtimeStatus::Disconnected);
                    if !wait_for_reconnect(&mut online).await {
                        return;
                    }
                    continue;
                }
            };
            connected_before = true;
            tracing::info!(client_id = %self.client_id, "change stream connected");
            self.status(RealtimeStatus::Connected);

            let end = self.consume(stream, &mut online).await;
            self.status(RealtimeStatus::Disconnected);
            match end {
                StreamEnd::Offline => {}
                StreamEnd::Closed => {
                    if !wait_for_reconnect(&mut online).await {
                        return;
                    }
                }
                StreamEnd::Shutdown => return,
            }
        }
    }

    async fn consume(&self, stream: ByteStream, online: &mut watch::Receiver<bool>) -> StreamEnd {
        let mut messages = sse::messages(stream);
        loop {
            tokio::select! {
                message = messages.next() => match message {
                    Some(Ok(message)) => self.handle_message(&message),
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "change stream failed");
                        return StreamEnd::Closed;
                    }
                    None => {
                        tracing::info!("change stream closed by server");
                        return StreamEnd::Closed;
                    }
                },
                changed = online.changed() => match changed {
                    Ok(()) => {
                        if !*online.borrow_and_update() {
                            tracing::info!("went offline, closing change stream");
                            return StreamEnd::Offline;
                        }
                    }
                    Err(_) => return StreamEnd::Shutdown,
                },
            }
        }
    }

    fn handle_message(&self, message: &SseMessage) {
        if message.data.trim().is_empty() {
            return;
        }
        match self.apply_batch(&message.data) {
            Ok(outcome) if outcome.suppressed > 0 => {
                tracing::debug!(suppressed = outcome.suppressed, "ignored own changes from stream");
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(error = %error, "could not apply pushed changes"),
        }
    }

    /// Reconciles one pushed payload and applies the result in the same
    /// store transaction, so local edits never land in between.
    pub fn apply_batch(&self, payload: &str) -> AppResult<Reconciliation> {
        let events = merge::parse_batch(payload)?;
        self.store.transact(|snapshot| {
            let outcome = merge::reconcile(&events, &snapshot.notes, &self.client_id);
            let mut transition = Transition::notes(outcome.actions.clone());
            if let Some(labels) = outcome.labels.clone() {
                transition.labels.push(LabelAction::SetLabels { labels });
            }
            Ok((transition, outcome))
        })
    }

    fn status(&self, status: RealtimeStatus) {
        self.store.events().emit(EngineEvent::Realtime(status));
    }
}

/// Waits for a change of the online flag that leaves it set. Returns false
/// when the sender is gone.
async fn wait_for_reconnect(online: &mut watch::Receiver<bool>) -> bool {
    loop {
        if online.changed().await.is_err() {
            return false;
        }
        if *online.borrow_and_update() {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RealtimeChannel;
    use crate::api::{ByteStream, Mutation, NotesApi};
    use crate::errors::{AppError, AppResult};
    use crate::events::{EngineEvent, EventBus, RealtimeStatus};
    use crate::media::ImageUpload;
    use crate::mirror::LocalCacheMirror;
    use crate::models::{ClientId, FetchNotesResponse, Note, UploadedImage};
    use crate::store::NoteStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{broadcast, watch};
    use uuid::Uuid;

    struct StreamApi {
        streams: Mutex<VecDeque<Vec<Vec<u8>>>>,
        server_note: Note,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl NotesApi for StreamApi {
        async fn fetch_notes(&self) -> AppResult<FetchNotesResponse> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(FetchNotesResponse {
                data: vec![self.server_note.clone()],
                order: vec![self.server_note.uuid],
                labels: Vec::new(),
            })
        }

        async fn send(&self, _mutation: &Mutation) -> AppResult<()> {
            Ok(())
        }

        async fn copy_notes(&self, _notes: &[Note], _client_id: &ClientId) -> AppResult<Vec<Note>> {
            Err(AppError::Internal("unused".to_string()))
        }

        async fn upload_image(&self, _note_uuid: Uuid, _upload: &ImageUpload) -> AppResult<UploadedImage> {
            Err(AppError::Internal("unused".to_string()))
        }

        async fn open_stream(&self, _client_id: &ClientId) -> AppResult<ByteStream> {
            let next = self.streams.lock().expect("streams").pop_front();
            match next {
                Some(chunks) => Ok(Box::pin(futures_util::stream::iter(chunks.into_iter().map(Ok::<Vec<u8>, AppError>)))),
                None => Ok(Box::pin(futures_util::stream::pending::<AppResult<Vec<u8>>>())),
            }
        }
    }

    async fn wait_for_status(events: &mut broadcast::Receiver<EngineEvent>, wanted: RealtimeStatus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(EngineEvent::Realtime(status)) = events.recv().await {
                    if status == wanted {
                        return;
                    }
                }
            }
        })
        .await
        .expect("status event");
    }

    #[tokio::test]
    async fn applies_pushes_and_refetches_after_reconnect() {
        let pushed = Note::new(Uuid::new_v4(), None);
        let payload = json!([{
            "type": "note",
            "operationType": "insert",
            "documentKey": { "uuid": pushed.uuid },
            "fullDocument": pushed,
        }]);
        let frame = format!(": heartbeat\n\ndata: {}\n\n", payload);
        let bytes = frame.into_bytes();
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        let server_note = Note::new(Uuid::new_v4(), None);
        let api = Arc::new(StreamApi {
            streams: Mutex::new(VecDeque::from(vec![vec![head.to_vec(), tail.to_vec()]])),
            server_note: server_note.clone(),
            fetches: AtomicUsize::new(0),
        });
        let store = Arc::new(NoteStore::new(LocalCacheMirror::disabled(), EventBus::new()));
        let mut events = store.events().subscribe();
        let channel = RealtimeChannel::new(store.clone(), api.clone(), ClientId::new("tab-1"));

        let (online, receiver) = watch::channel(true);
        let task = tokio::spawn(channel.run(receiver));

        wait_for_status(&mut events, RealtimeStatus::Connected).await;
        wait_for_status(&mut events, RealtimeStatus::Disconnected).await;
        assert!(store.notes().expect("notes").contains(&pushed.uuid));
        assert_eq!(api.fetches.load(Ordering::SeqCst), 0);

        online.send(false).expect("offline");
        online.send(true).expect("online");
        wait_for_status(&mut events, RealtimeStatus::Connected).await;
        assert_eq!(api.fetches.load(Ordering::SeqCst), 1);
        let notes = store.notes().expect("notes");
        assert_eq!(*notes.order, vec![server_note.uuid]);

        drop(online);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("channel stops")
            .expect("join");
    }

    #[tokio::test]
    async fn going_offline_tears_down_the_stream() {
        let api = Arc::new(StreamApi {
            streams: Mutex::new(VecDeque::new()),
            server_note: Note::new(Uuid::new_v4(), None),
            fetches: AtomicUsize::new(0),
        });
        let store = Arc::new(NoteStore::new(LocalCacheMirror::disabled(), EventBus::new()));
        let mut events = store.events().subscribe();
        let channel = RealtimeChannel::new(store.clone(), api.clone(), ClientId::new("tab-1"));

        let (online, receiver) = watch::channel(false);
        let task = tokio::spawn(channel.run(receiver));
        online.send(true).expect("online");
        wait_for_status(&mut events, RealtimeStatus::Connected).await;
        online.send(false).expect("offline");
        wait_for_status(&mut events, RealtimeStatus::Disconnected).await;

        task.abort();
    }

    #[test]
    fn own_label_changes_are_not_reapplied() {
        let store = Arc::new(NoteStore::new(LocalCacheMirror::disabled(), EventBus::new()));
        let api = Arc::new(StreamApi {
            streams: Mutex::new(VecDeque::new()),
            server_note: Note::new(Uuid::new_v4(), None),
            fetches: AtomicUsize::new(0),
        });
        let channel = RealtimeChannel::new(store.clone(), api, ClientId::new("tab-1"));
        let payload = json!({
            "type": "labels",
            "operationType": "update",
            "updateDescription": { "updatedFields": { "labels": [], "labelsLastModifiedBy": "tab-1" } }
        });
        let outcome = channel.apply_batch(&payload.to_string()).expect("apply");
        assert_eq!(outcome.suppressed, 1);
        assert_eq!(store.snapshot().expect("snapshot").version, 0);
    }
}
