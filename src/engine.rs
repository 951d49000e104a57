use crate::api::{HttpNotesApi, NotesApi};
use crate::config::EngineConfig;
use crate::db::LocalCache;
use crate::errors::{AppError, AppResult};
use crate::events::{EngineEvent, EventBus, Notification};
use crate::mirror::LocalCacheMirror;
use crate::note_actions::NoteActions;
use crate::realtime::RealtimeChannel;
use crate::render::masonry::MasonryLayout;
use crate::render::{BatchRenderController, BatchSettings};
use crate::session::ClientSession;
use crate::store::{NoteStore, StoreSnapshot};
use crate::sync;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Wires the cache, store, orchestrator and realtime channel for one signed
/// in user. Views talk to the engine; everything else is internal plumbing.
pub struct NotesEngine {
    config: EngineConfig,
    session: ClientSession,
    api: Arc<dyn NotesApi>,
    store: Arc<NoteStore>,
    actions: NoteActions,
    online: watch::Sender<bool>,
    realtime_task: Mutex<Option<JoinHandle<()>>>,
}

impl NotesEngine {
    pub fn new(config: EngineConfig, api: Arc<dyn NotesApi>, session: ClientSession) -> AppResult<Arc<Self>> {
        config.validate()?;
        let cache = match config.cache_dir.as_deref() {
            Some(dir) => match LocalCache::open_for_user(dir, session.cache_key()) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(error) => {
                    tracing::warn!(error = %error, dir = %dir.display(), "local cache unavailable, continuing without it");
                    None
                }
            },
            None => None,
        };
        let mirror = LocalCacheMirror::new(cache, config.order_debounce());
        let store = Arc::new(NoteStore::new(mirror, EventBus::new()));
        let actions = NoteActions::new(store.clone(), api.clone(), session.clone());
        let (online, _) = watch::channel(false);

        tracing::info!(
            client_id = %session.client_id(),
            user = %session.user().id,
            "notes engine created"
        );
        Ok(Arc::new(Self {
            config,
            session,
            api,
            store,
            actions,
            online,
            realtime_task: Mutex::new(None),
        }))
    }

    pub fn with_http(config: EngineConfig, session: ClientSession) -> AppResult<Arc<Self>> {
        let api: Arc<dyn NotesApi> = Arc::new(HttpNotesApi::new(&config)?);
        Self::new(config, api, session)
    }

    /// Cold start: show whatever the cache holds, replace it with the server
    /// state when reachable, then open the change stream.
    pub async fn start(&self) -> AppResult<()> {
        let hydrated = sync::hydrate_from_cache(&self.store)?;
        if let Err(error) = sync::refetch(&self.store, self.api.as_ref()).await {
            tracing::warn!(error = %error, hydrated, "initial fetch failed");
            if !hydrated {
                self.store
                    .events()
                    .notify(Notification::error("Could not load notes. Check your connection."));
            }
        }
        self.start_realtime()?;
        self.set_online(true);
        Ok(())
    }

    fn start_realtime(&self) -> AppResult<()> {
        let mut task = self
            .realtime_task
            .lock()
            .map_err(|_| AppError::Internal("realtime task mutex poisoned".to_string()))?;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        let channel = RealtimeChannel::new(self.store.clone(), self.api.clone(), self.session.client_id().clone());
        *task = Some(tokio::spawn(channel.run(self.online.subscribe())));
        Ok(())
    }

    /// Network reachability as reported by the host.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub async fn refetch(&self) -> AppResult<()> {
        sync::refetch(&self.store, self.api.as_ref()).await?;
        self.reload_layout();
        Ok(())
    }

    pub fn reload_layout(&self) {
        self.store.events().emit(EngineEvent::LayoutReload);
    }

    /// Closes the change stream and writes any pending order to the cache.
    pub fn stop(&self) {
        match self.realtime_task.lock() {
            Ok(mut task) => {
                if let Some(handle) = task.take() {
                    handle.abort();
                }
            }
            Err(_) => tracing::warn!("realtime task mutex poisoned"),
        }
        self.store.mirror().flush();
        tracing::info!(client_id = %self.session.client_id(), "notes engine stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.store.events().subscribe()
    }

    pub fn snapshot(&self) -> AppResult<StoreSnapshot> {
        self.store.snapshot()
    }

    pub fn actions(&self) -> &NoteActions {
        &self.actions
    }

    pub fn store(&self) -> &Arc<NoteStore> {
        &self.store
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A fresh controller for one note list view, already reset against the
    /// current state.
    pub fn render_controller(&self) -> AppResult<BatchRenderController> {
        let mut controller = BatchRenderController::new(BatchSettings::from_config(&self.config));
        controller.reset(&self.store.notes()?);
        Ok(controller)
    }

    pub fn masonry(&self) -> MasonryLayout {
        MasonryLayout::from_config(&self.config)
    }
}

impl Drop for NotesEngine {
    fn drop(&mut self) {
        if let Ok(mut task) = self.realtime_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
