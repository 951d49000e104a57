use crate::errors::{AppError, AppResult};
use crate::events::{EngineEvent, EventBus};
use crate::labels::{reduce_labels, LabelAction, LabelState};
use crate::mirror::LocalCacheMirror;
use crate::models::{Label, Note, NoteState};
use crate::reducer::{reduce, NoteAction};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub notes: NoteState,
    pub labels: LabelState,
    pub version: u64,
}

/// Label and note actions applied as one unit, labels first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub labels: Vec<LabelAction>,
    pub notes: Vec<NoteAction>,
}

impl Transition {
    pub fn notes(actions: Vec<NoteAction>) -> Self {
        Self {
            notes: actions,
            ..Self::default()
        }
    }

    pub fn labels(actions: Vec<LabelAction>) -> Self {
        Self {
            labels: actions,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    notes: NoteState,
    labels: LabelState,
    version: u64,
}

impl StoreState {
    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            notes: self.notes.clone(),
            labels: self.labels.clone(),
            version: self.version,
        }
    }
}

/// Single dispatch point for the in-memory state. Transitions are planned
/// and reduced under the write lock; cache writes and events follow once
/// the lock is released. Readers get `Arc`-shared snapshots.
pub struct NoteStore {
    state: RwLock<StoreState>,
    mirror: LocalCacheMirror,
    events: EventBus,
}

impl NoteStore {
    pub fn new(mirror: LocalCacheMirror, events: EventBus) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            mirror,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn mirror(&self) -> &LocalCacheMirror {
        &self.mirror
    }

    fn write(&self) -> AppResult<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| AppError::Internal("store lock poisoned".to_string()))
    }

    pub fn snapshot(&self) -> AppResult<StoreSnapshot> {
        let state = self
            .state
            .read()
            .map_err(|_| AppError::Internal("store lock poisoned".to_string()))?;
        Ok(state.snapshot())
    }

    pub fn notes(&self) -> AppResult<NoteState> {
        Ok(self.snapshot()?.notes)
    }

    pub fn labels(&self) -> AppResult<LabelState> {
        Ok(self.snapshot()?.labels)
    }

    /// Applies one note action. Returns whether the state changed.
    pub fn dispatch(&self, action: &NoteAction) -> AppResult<bool> {
        let ((), changed) = self.run(|_| Ok((Transition::notes(vec![action.clone()]), ())))?;
        Ok(changed)
    }

    pub fn dispatch_all(&self, actions: &[NoteAction]) -> AppResult<bool> {
        let ((), changed) = self.run(|_| Ok((Transition::notes(actions.to_vec()), ())))?;
        Ok(changed)
    }

    pub fn dispatch_labels(&self, action: &LabelAction) -> AppResult<bool> {
        let ((), changed) = self.run(|_| Ok((Transition::labels(vec![action.clone()]), ())))?;
        Ok(changed)
    }

    /// Plans a transition against the current state and applies it without
    /// releasing the write lock in between, so nothing else can land between
    /// reading the state and changing it. `plan` must not call back into the
    /// store.
    pub fn transact<R, F>(&self, plan: F) -> AppResult<R>
    where
        F: FnOnce(&StoreSnapshot) -> AppResult<(Transition, R)>,
    {
        Ok(self.run(plan)?.0)
    }

    fn run<R, F>(&self, plan: F) -> AppResult<(R, bool)>
    where
        F: FnOnce(&StoreSnapshot) -> AppResult<(Transition, R)>,
    {
        let mut emitted = Vec::new();
        let (result, batch) = {
            let mut state = self.write()?;
            let (transition, result) = plan(&state.snapshot())?;
            let mut batch = self.mirror.batch()?;
            for action in &transition.labels {
                let after = reduce_labels(&state.labels, action);
                if Arc::ptr_eq(&state.labels, &after) {
                    continue;
                }
                batch.labels(action, &state.labels, &after);
                state.labels = after;
                state.version += 1;
                emitted.push(EngineEvent::LabelsChanged { version: state.version });
            }
            for action in &transition.notes {
                let after = reduce(&state.notes, action);
                let unchanged =
                    Arc::ptr_eq(&state.notes.notes, &after.notes) && Arc::ptr_eq(&state.notes.order, &after.order);
                if unchanged {
                    continue;
                }
                batch.notes(action, &state.notes, &after);
                state.notes = after;
                state.version += 1;
                tracing::debug!(action = action.name(), version = state.version, "note state changed");
                emitted.push(EngineEvent::NotesChanged {
                    version: state.version,
                    action: action.name().to_string(),
                });
            }
            (result, batch)
        };
        batch.commit();
        let changed = !emitted.is_empty();
        for event in emitted {
            self.events.emit(event);
        }
        Ok((result, changed))
    }

    /// Replaces notes, order and labels in one step. With `persist` the cache
    /// is rewritten in a single transaction; without it (cold start from the
    /// cache itself) nothing is written back.
    pub fn replace_all(&self, notes: Vec<Note>, order: Vec<Uuid>, labels: Vec<Label>, persist: bool) -> AppResult<()> {
        let notes_action = NoteAction::SetInitialData { notes, order };
        let (version, batch) = {
            let mut state = self.write()?;
            let next_notes = reduce(&state.notes, &notes_action);
            let next_labels = reduce_labels(&state.labels, &LabelAction::SetLabels { labels });
            let mut batch = self.mirror.batch()?;
            if persist {
                batch.replace_all(&next_notes, &next_labels);
            }
            state.notes = next_notes;
            state.labels = next_labels;
            state.version += 1;
            (state.version, batch)
        };
        batch.commit();
        self.events.emit(EngineEvent::NotesChanged {
            version,
            action: notes_action.name().to_string(),
        });
        self.events.emit(EngineEvent::LabelsChanged { version });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{NoteStore, Transition};
    use crate::errors::AppError;
    use crate::events::{EngineEvent, EventBus};
    use crate::labels::LabelAction;
    use crate::mirror::LocalCacheMirror;
    use crate::models::{Label, Note, NoteColor};
    use crate::reducer::NoteAction;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn store() -> NoteStore {
        NoteStore::new(LocalCacheMirror::disabled(), EventBus::new())
    }

    #[test]
    fn dispatch_bumps_version_and_emits() {
        let store = store();
        let mut events = store.events().subscribe();
        let note = Note::new(Uuid::new_v4(), None);
        assert!(store.dispatch(&NoteAction::AddNote { note }).expect("dispatch"));
        assert_eq!(store.snapshot().expect("snapshot").version, 1);
        match events.try_recv().expect("event") {
            EngineEvent::NotesChanged { version, action } => {
                assert_eq!(version, 1);
                assert_eq!(action, "ADD_NOTE");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn no_op_dispatch_is_silent() {
        let store = store();
        let mut events = store.events().subscribe();
        let changed = store
            .dispatch(&NoteAction::TrashNote { uuid: Uuid::new_v4() })
            .expect("dispatch");
        assert!(!changed);
        assert_eq!(store.snapshot().expect("snapshot").version, 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn snapshots_are_stable_across_dispatches() {
        let store = store();
        let note = Note::new(Uuid::new_v4(), None);
        let uuid = note.uuid;
        store.dispatch(&NoteAction::AddNote { note }).expect("add");
        let before = store.notes().expect("notes");
        store.dispatch(&NoteAction::TrashNote { uuid }).expect("trash");
        assert!(!before.get(&uuid).expect("note").is_trash);
        assert!(store.notes().expect("notes").get(&uuid).expect("note").is_trash);
    }

    #[test]
    fn replace_all_swaps_notes_and_labels_together() {
        let store = store();
        let mut events = store.events().subscribe();
        let note = Note::new(Uuid::new_v4(), None);
        let label = Label::new("Work", NoteColor::Default);
        store
            .replace_all(vec![note.clone()], vec![note.uuid], vec![label.clone()], true)
            .expect("replace");
        let snapshot = store.snapshot().expect("snapshot");
        assert_eq!(*snapshot.notes.order, vec![note.uuid]);
        assert!(snapshot.labels.contains_key(&label.uuid));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::NotesChanged { .. })));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::LabelsChanged { .. })));
    }

    #[test]
    fn label_dispatch_updates_label_map() {
        let store = store();
        let label = Label::new("Ideas", NoteColor::Fog);
        store
            .dispatch_labels(&LabelAction::CreateLabel { label: label.clone() })
            .expect("create");
        assert_eq!(store.labels().expect("labels").get(&label.uuid), Some(&label));
    }

    #[test]
    fn transact_plans_against_the_state_it_changes() {
        let store = store();
        let notes = (0..3).map(|_| Note::new(Uuid::new_v4(), None)).collect::<Vec<_>>();
        let ids = notes.iter().map(|note| note.uuid).collect::<Vec<_>>();
        store.replace_all(notes, ids.clone(), Vec::new(), false).expect("seed");
        let moved = AtomicBool::new(false);

        let planned_index = std::thread::scope(|scope| {
            store
                .transact(|snapshot| {
                    scope.spawn(|| {
                        store
                            .dispatch(&NoteAction::Dnd {
                                initial_index: 2,
                                final_index: 0,
                            })
                            .expect("move");
                        moved.store(true, Ordering::SeqCst);
                    });
                    std::thread::sleep(Duration::from_millis(50));
                    assert!(!moved.load(Ordering::SeqCst));
                    let index = snapshot.notes.index_of(&ids[1]).expect("indexed");
                    Ok((Transition::notes(vec![NoteAction::TrashNote { uuid: ids[1] }]), index))
                })
                .expect("transact")
        });

        assert_eq!(planned_index, 1);
        assert!(moved.load(Ordering::SeqCst));
        let state = store.notes().expect("notes");
        assert!(state.get(&ids[1]).expect("note").is_trash);
        assert_eq!(*state.order, vec![ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn failed_plan_changes_nothing() {
        let store = store();
        let mut events = store.events().subscribe();
        let result: Result<(), AppError> =
            store.transact(|_| Err(AppError::Validation("nothing to do".to_string())));
        assert!(result.is_err());
        assert_eq!(store.snapshot().expect("snapshot").version, 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn transact_applies_labels_then_notes_with_one_version_each() {
        let store = store();
        let mut events = store.events().subscribe();
        let label = Label::new("Work", NoteColor::Default);
        let note = Note::new(Uuid::new_v4(), None);
        let uuid = note.uuid;
        store
            .transact(|_| {
                let transition = Transition {
                    labels: vec![LabelAction::CreateLabel { label: label.clone() }],
                    notes: vec![
                        NoteAction::AddNote { note },
                        NoteAction::AddLabel {
                            uuid,
                            label_uuid: label.uuid,
                        },
                    ],
                };
                Ok((transition, ()))
            })
            .expect("transact");
        let snapshot = store.snapshot().expect("snapshot");
        assert_eq!(snapshot.version, 3);
        assert!(snapshot.notes.get(&uuid).expect("note").labels.contains(&label.uuid));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::LabelsChanged { version: 1 })));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::NotesChanged { version: 2, .. })));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::NotesChanged { version: 3, .. })));
    }
}
