use async_trait::async_trait;
use keepnotes_client_lib::api::ByteStream;
use keepnotes_client_lib::media::ImageUpload;
use keepnotes_client_lib::models::{FetchNotesResponse, UploadedImage};
use keepnotes_client_lib::{
    AppError, AppResult, ClientId, ClientSession, EngineConfig, EngineEvent, Mutation, MutationKind, Note,
    NoteRequest, NotesApi, NotesEngine, NotificationKind, RealtimeStatus, UserRef,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

struct FakeServer {
    state: Mutex<FetchNotesResponse>,
    offline: AtomicBool,
    sent: Mutex<Vec<Mutation>>,
    pushes: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl FakeServer {
    fn new(notes: Vec<Note>) -> Arc<Self> {
        let order = notes.iter().map(|note| note.uuid).collect();
        Arc::new(Self {
            state: Mutex::new(FetchNotesResponse {
                data: notes,
                order,
                labels: Vec::new(),
            }),
            offline: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            pushes: Mutex::new(None),
        })
    }

    fn with_pushes(self: &Arc<Self>) -> mpsc::UnboundedSender<Vec<u8>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.pushes.lock().expect("pushes") = Some(receiver);
        sender
    }

    fn sent(&self) -> Vec<Mutation> {
        self.sent.lock().expect("sent").clone()
    }

    fn check_online(&self) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Network("server unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotesApi for FakeServer {
    async fn fetch_notes(&self) -> AppResult<FetchNotesResponse> {
        self.check_online()?;
        Ok(self.state.lock().expect("state").clone())
    }

    async fn send(&self, mutation: &Mutation) -> AppResult<()> {
        self.check_online()?;
        self.sent.lock().expect("sent").push(mutation.clone());
        Ok(())
    }

    async fn copy_notes(&self, notes: &[Note], _client_id: &ClientId) -> AppResult<Vec<Note>> {
        self.check_online()?;
        Ok(notes.to_vec())
    }

    async fn upload_image(&self, _note_uuid: Uuid, upload: &ImageUpload) -> AppResult<UploadedImage> {
        self.check_online()?;
        Ok(UploadedImage {
            url: format!("https://images.example.test/{}", upload.uuid),
        })
    }

    async fn open_stream(&self, _client_id: &ClientId) -> AppResult<ByteStream> {
        self.check_online()?;
        let receiver = self.pushes.lock().expect("pushes").take();
        match receiver {
            Some(receiver) => Ok(Box::pin(futures_util::stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|bytes| (Ok::<Vec<u8>, AppError>(bytes), receiver))
            }))),
            None => Ok(Box::pin(futures_util::stream::pending::<AppResult<Vec<u8>>>())),
        }
    }
}

fn user() -> UserRef {
    UserRef {
        id: "user-1".to_string(),
        display_name: "Ada".to_string(),
        username: "ada".to_string(),
        image: None,
    }
}

fn config(cache_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        cache_dir: Some(cache_dir.to_path_buf()),
        order_debounce_ms: 0,
        ..EngineConfig::default()
    }
}

fn titled(title: &str) -> Note {
    let mut note = Note::new(Uuid::new_v4(), Some(user()));
    note.title = title.to_string();
    note
}

async fn next_matching<F>(events: &mut broadcast::Receiver<EngineEvent>, mut wanted: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event")
}

#[tokio::test]
async fn trash_then_undo_restores_position_and_tells_the_server() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notes = vec![titled("one"), titled("two"), titled("three")];
    let ids = notes.iter().map(|note| note.uuid).collect::<Vec<_>>();
    let server = FakeServer::new(notes);
    let engine = NotesEngine::new(config(dir.path()), server.clone(), ClientSession::new(user())).expect("engine");
    let mut events = engine.subscribe();
    engine.start().await.expect("start");

    engine
        .actions()
        .perform(NoteRequest::ToggleTrash { uuid: ids[1] })
        .await
        .expect("trash");
    let snapshot = engine.snapshot().expect("snapshot");
    assert_eq!(*snapshot.notes.order, vec![ids[1], ids[0], ids[2]]);
    assert!(snapshot.notes.get(&ids[1]).expect("note").is_trash);
    let notice = next_matching(&mut events, |event| matches!(event, EngineEvent::Notification(_))).await;
    match notice {
        EngineEvent::Notification(notification) => {
            assert!(notification.undoable);
            assert_eq!(notification.kind, NotificationKind::Info);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(engine.actions().undo().await.expect("undo"));
    let snapshot = engine.snapshot().expect("snapshot");
    assert_eq!(*snapshot.notes.order, ids);
    assert!(!snapshot.notes.get(&ids[1]).expect("note").is_trash);

    let sent = server.sent();
    let client_id = engine.session().client_id().clone();
    assert!(sent.iter().all(|mutation| mutation.client_id == client_id));
    let trash_writes = sent
        .iter()
        .filter(|mutation| mutation.kind == MutationKind::UpdateNotes && mutation.note_uuids == vec![ids[1]])
        .map(|mutation| mutation.value["isTrash"].clone())
        .collect::<Vec<_>>();
    assert_eq!(trash_writes, vec![json!(true), json!(false)]);

    engine.stop();
}

#[tokio::test]
async fn offline_restart_hydrates_from_the_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notes = vec![titled("groceries"), titled("ideas")];
    let ids = notes.iter().map(|note| note.uuid).collect::<Vec<_>>();
    let server = FakeServer::new(notes);

    {
        let engine =
            NotesEngine::new(config(dir.path()), server.clone(), ClientSession::new(user())).expect("engine");
        engine.start().await.expect("start");
        engine
            .actions()
            .perform(NoteRequest::TogglePin { uuid: ids[1] })
            .await
            .expect("pin");
        engine
            .actions()
            .perform(NoteRequest::EditText {
                uuid: ids[0],
                title: Some("groceries for sunday".to_string()),
                content: None,
            })
            .await
            .expect("edit");
        engine.stop();
    }

    server.offline.store(true, Ordering::SeqCst);
    let engine = NotesEngine::new(config(dir.path()), server.clone(), ClientSession::new(user())).expect("engine");
    let mut events = engine.subscribe();
    engine.start().await.expect("start offline");

    let snapshot = engine.snapshot().expect("snapshot");
    assert_eq!(snapshot.notes.len(), 2);
    assert!(snapshot.notes.get(&ids[1]).expect("pinned").is_pinned);
    assert_eq!(snapshot.notes.get(&ids[0]).expect("edited").title, "groceries for sunday");
    next_matching(&mut events, |event| {
        matches!(event, EngineEvent::Realtime(RealtimeStatus::Disconnected))
    })
    .await;

    let failed = engine
        .actions()
        .perform(NoteRequest::ToggleArchive { uuid: ids[0] })
        .await;
    assert!(failed.is_ok());
    assert!(engine.snapshot().expect("snapshot").notes.get(&ids[0]).expect("note").is_archived);
    let notice = next_matching(&mut events, |event| {
        matches!(event, EngineEvent::Notification(notification) if notification.kind == NotificationKind::Error)
    })
    .await;
    assert!(matches!(notice, EngineEvent::Notification(_)));

    engine.stop();
}

#[tokio::test]
async fn pushed_changes_from_other_clients_are_merged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let local = titled("shared list");
    let server = FakeServer::new(vec![local.clone()]);
    let pushes = server.with_pushes();
    let session = ClientSession::with_client_id(user(), ClientId::new("tab-web"));
    let engine = NotesEngine::new(config(dir.path()), server.clone(), session).expect("engine");
    let mut events = engine.subscribe();
    engine.start().await.expect("start");
    next_matching(&mut events, |event| {
        matches!(event, EngineEvent::Realtime(RealtimeStatus::Connected))
    })
    .await;

    let own = engine.session().client_id().as_str().to_string();
    assert_eq!(own, "tab-web");
    let payload = json!([
        {
            "type": "note",
            "operationType": "update",
            "documentKey": { "_id": "n1", "uuid": local.uuid },
            "updateDescription": { "updatedFields": { "title": "from my phone", "lastModifiedBy": "phone" } }
        },
        {
            "type": "settings",
            "operationType": "update",
            "documentKey": { "_id": "s1" },
            "fullDocument": { "noteUUID": local.uuid, "isPinned": true, "settingsLastModifiedBy": own }
        }
    ]);
    pushes
        .send(format!("data: {}\n\n", payload).into_bytes())
        .expect("push");

    next_matching(&mut events, |event| matches!(event, EngineEvent::NotesChanged { .. })).await;
    let note = engine
        .snapshot()
        .expect("snapshot")
        .notes
        .get(&local.uuid)
        .cloned()
        .expect("note");
    assert_eq!(note.title, "from my phone");
    assert!(!note.is_pinned);
    assert_eq!(note.creator, Some(user()));

    engine.stop();
}
