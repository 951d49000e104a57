use crate::db::LocalCache;
use crate::errors::{AppError, AppResult};
use crate::labels::{LabelAction, LabelState};
use crate::models::{Label, Note, NoteState};
use crate::reducer::{LabelAssignment, NoteAction};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// A single write against the local cache derived from a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    ReplaceAll { notes: Vec<Note>, order: Vec<Uuid>, labels: Vec<Label> },
    ReplaceNotes { notes: Vec<Note>, order: Vec<Uuid> },
    PutNotes(Vec<Note>),
    DeleteNotes(Vec<Uuid>),
    PutOrder(Vec<Uuid>),
    ReplaceLabels(Vec<Label>),
    PutLabel(Label),
    DeleteLabel(Uuid),
}

enum Touched {
    Notes(Vec<Uuid>),
    All,
}

/// Derives the cache writes for one note transition. Order changes come
/// last so the caller can route them through the debouncer.
pub fn plan_note_ops(action: &NoteAction, before: &NoteState, after: &NoteState) -> Vec<CacheOp> {
    let notes_changed = !Arc::ptr_eq(&before.notes, &after.notes);
    let order_changed = !Arc::ptr_eq(&before.order, &after.order) && before.order != after.order;
    if !notes_changed && !order_changed {
        return Vec::new();
    }
    if let NoteAction::SetInitialData { .. } = action {
        return vec![CacheOp::ReplaceNotes {
            notes: after.notes.values().cloned().collect(),
            order: after.order.to_vec(),
        }];
    }

    let mut ops = Vec::new();
    if notes_changed {
        let candidates = match touched(action) {
            Touched::Notes(uuids) => uuids,
            Touched::All => before.notes.keys().chain(after.notes.keys()).copied().collect(),
        };
        let mut seen = HashSet::new();
        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for uuid in candidates {
            if !seen.insert(uuid) {
                continue;
            }
            match (before.get(&uuid), after.get(&uuid)) {
                (previous, Some(next)) if previous != Some(next) => puts.push(next.clone()),
                (Some(_), None) => deletes.push(uuid),
                _ => {}
            }
        }
        if !puts.is_empty() {
            ops.push(CacheOp::PutNotes(puts));
        }
        if !deletes.is_empty() {
            ops.push(CacheOp::DeleteNotes(deletes));
        }
    }
    if order_changed {
        ops.push(CacheOp::PutOrder(after.order.to_vec()));
    }
    ops
}

fn touched(action: &NoteAction) -> Touched {
    let uuids = match action {
        NoteAction::AddNote { note } => vec![note.uuid],
        NoteAction::AddNotes { notes } | NoteAction::UpdateNotes { notes } | NoteAction::BatchCopyNote { notes } => {
            notes.iter().map(|note| note.uuid).collect()
        }
        NoteAction::PinNote { uuid }
        | NoteAction::ArchiveNote { uuid }
        | NoteAction::TrashNote { uuid }
        | NoteAction::UndoPin { uuid, .. }
        | NoteAction::UndoArchive { uuid, .. }
        | NoteAction::UndoTrash { uuid, .. }
        | NoteAction::DeleteNote { uuid }
        | NoteAction::UndoCopy { uuid }
        | NoteAction::UpdateColor { uuid, .. }
        | NoteAction::UpdateBackground { uuid, .. }
        | NoteAction::AddLabel { uuid, .. }
        | NoteAction::RemoveLabel { uuid, .. }
        | NoteAction::UpdateNoteLabels { uuid, .. }
        | NoteAction::UpdateText { uuid, .. }
        | NoteAction::UpdateImages { uuid, .. }
        | NoteAction::DeleteImages { uuid, .. }
        | NoteAction::AddImages { uuid, .. }
        | NoteAction::UpdateCollaborators { uuid, .. }
        | NoteAction::AddCheckbox { uuid, .. }
        | NoteAction::CheckboxState { uuid, .. }
        | NoteAction::DeleteCheckbox { uuid, .. }
        | NoteAction::DeleteChecked { uuid }
        | NoteAction::UncheckAll { uuid }
        | NoteAction::CheckboxVisibility { uuid, .. }
        | NoteAction::ExpandItems { uuid, .. } => vec![*uuid],
        NoteAction::BatchArchive { selected, .. }
        | NoteAction::BatchTrash { selected, .. }
        | NoteAction::BatchPin { selected, .. }
        | NoteAction::UndoBatchArchive { selected }
        | NoteAction::UndoBatchTrash { selected }
        | NoteAction::UndoBatchPin { selected } => selected.iter().map(|entry| entry.uuid).collect(),
        NoteAction::BatchDeleteNotes { uuids }
        | NoteAction::UndoBatchCopy { uuids }
        | NoteAction::BatchUpdateColor { uuids, .. }
        | NoteAction::BatchUpdateBackground { uuids, .. }
        | NoteAction::BatchRemoveLabel { uuids, .. }
        | NoteAction::BatchAddLabel(LabelAssignment::Shared { uuids, .. }) => uuids.clone(),
        NoteAction::BatchAddLabel(LabelAssignment::Unshared { labels }) => labels.keys().copied().collect(),
        NoteAction::SetInitialData { .. }
        | NoteAction::DeleteById { .. }
        | NoteAction::EmptyTrash
        | NoteAction::RemoveLabelFromNotes { .. }
        | NoteAction::SetOrder { .. }
        | NoteAction::Dnd { .. } => return Touched::All,
    };
    Touched::Notes(uuids)
}

pub fn plan_label_ops(action: &LabelAction, before: &LabelState, after: &LabelState) -> Vec<CacheOp> {
    if Arc::ptr_eq(before, after) {
        return Vec::new();
    }
    match action {
        LabelAction::SetLabels { .. } => vec![CacheOp::ReplaceLabels(after.values().cloned().collect())],
        LabelAction::DeleteLabel { uuid } => vec![CacheOp::DeleteLabel(*uuid)],
        LabelAction::CreateLabel { label } => after
            .get(&label.uuid)
            .map(|label| vec![CacheOp::PutLabel(label.clone())])
            .unwrap_or_default(),
        LabelAction::RenameLabel { uuid, .. }
        | LabelAction::UpdateLabelColor { uuid, .. }
        | LabelAction::PinLabel { uuid, .. }
        | LabelAction::UpdateLabelImage { uuid, .. } => after
            .get(uuid)
            .map(|label| vec![CacheOp::PutLabel(label.clone())])
            .unwrap_or_default(),
    }
}

/// Keeps the local cache eventually consistent with the in-memory state.
/// Note and label writes happen immediately; order writes are coalesced.
/// Cache failures are logged and never reach the caller.
pub struct LocalCacheMirror {
    cache: Option<Arc<LocalCache>>,
    order_writer: DebouncedOrderWriter,
    gate: Mutex<()>,
}

/// Cache writes planned while the store lock is held. The batch owns the
/// mirror's write gate, so batches commit in planning order even after the
/// store lock has been released.
#[must_use]
pub struct MirrorBatch<'a> {
    mirror: &'a LocalCacheMirror,
    ops: Vec<CacheOp>,
    _gate: MutexGuard<'a, ()>,
}

impl MirrorBatch<'_> {
    pub fn notes(&mut self, action: &NoteAction, before: &NoteState, after: &NoteState) {
        self.ops.extend(plan_note_ops(action, before, after));
    }

    pub fn labels(&mut self, action: &LabelAction, before: &LabelState, after: &LabelState) {
        self.ops.extend(plan_label_ops(action, before, after));
    }

    /// Cold sync: notes, order and labels replaced in one transaction.
    pub fn replace_all(&mut self, notes: &NoteState, labels: &LabelState) {
        let notes = notes.ordered_notes().cloned().collect::<Vec<_>>();
        let order = notes.iter().map(|note| note.uuid).collect::<Vec<_>>();
        self.ops.push(CacheOp::ReplaceAll {
            notes,
            order,
            labels: labels.values().cloned().collect(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn commit(self) {
        let MirrorBatch { mirror, ops, _gate } = self;
        for op in ops {
            mirror.execute(op);
        }
    }
}

impl LocalCacheMirror {
    pub fn new(cache: Option<Arc<LocalCache>>, order_debounce: Duration) -> Self {
        let order_writer = DebouncedOrderWriter::new(cache.clone(), order_debounce);
        Self {
            cache,
            order_writer,
            gate: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn cache(&self) -> Option<&Arc<LocalCache>> {
        self.cache.as_ref()
    }

    /// Opens a batch, waiting for any earlier batch to finish committing.
    pub fn batch(&self) -> AppResult<MirrorBatch<'_>> {
        let gate = self
            .gate
            .lock()
            .map_err(|_| AppError::Internal("cache write gate poisoned".to_string()))?;
        Ok(MirrorBatch {
            mirror: self,
            ops: Vec::new(),
            _gate: gate,
        })
    }

    pub fn flush(&self) {
        self.order_writer.flush();
    }

    fn execute(&self, op: CacheOp) {
        if let CacheOp::PutOrder(order) = op {
            self.order_writer.schedule(order);
            return;
        }
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let result = match &op {
            CacheOp::ReplaceAll { notes, order, labels } => {
                self.order_writer.cancel();
                cache.replace_all(notes, order, labels)
            }
            CacheOp::ReplaceNotes { notes, order } => {
                self.order_writer.cancel();
                cache.replace_notes(notes, order)
            }
            CacheOp::PutNotes(notes) => cache.put_notes(notes),
            CacheOp::DeleteNotes(uuids) => cache.delete_notes(uuids).map(|_| ()),
            CacheOp::ReplaceLabels(labels) => cache.replace_labels(labels),
            CacheOp::PutLabel(label) => cache.put_label(label),
            CacheOp::DeleteLabel(uuid) => cache.delete_label(uuid).map(|_| ()),
            CacheOp::PutOrder(_) => Ok(()),
        };
        if let Err(error) = result {
            tracing::warn!(error = %error, op = op_name(&op), "local cache write failed");
        }
    }
}

fn op_name(op: &CacheOp) -> &'static str {
    match op {
        CacheOp::ReplaceAll { .. } => "replace_all",
        CacheOp::ReplaceNotes { .. } => "replace_notes",
        CacheOp::PutNotes(_) => "put_notes",
        CacheOp::DeleteNotes(_) => "delete_notes",
        CacheOp::PutOrder(_) => "put_order",
        CacheOp::ReplaceLabels(_) => "replace_labels",
        CacheOp::PutLabel(_) => "put_label",
        CacheOp::DeleteLabel(_) => "delete_label",
    }
}

#[derive(Default)]
struct PendingOrder {
    generation: u64,
    order: Option<Vec<Uuid>>,
}

struct OrderWriterInner {
    cache: Option<Arc<LocalCache>>,
    pending: Mutex<PendingOrder>,
    notify: Notify,
    shutdown: AtomicBool,
    delay: Duration,
}

impl OrderWriterInner {
    fn take_if(&self, generation: Option<u64>) -> Option<Vec<Uuid>> {
        let mut pending = self.pending.lock().ok()?;
        if generation.is_some_and(|expected| expected != pending.generation) {
            return None;
        }
        pending.order.take()
    }

    fn write(&self, order: &[Uuid]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(error) = cache.put_order(order) {
            tracing::warn!(error = %error, "debounced order write failed");
        }
    }
}

/// Coalesces order writes: only the last order scheduled within the delay
/// window is written. Without a tokio runtime writes happen inline.
pub struct DebouncedOrderWriter {
    inner: Arc<OrderWriterInner>,
    background: bool,
}

impl DebouncedOrderWriter {
    pub fn new(cache: Option<Arc<LocalCache>>, delay: Duration) -> Self {
        let inner = Arc::new(OrderWriterInner {
            cache,
            pending: Mutex::new(PendingOrder::default()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            delay,
        });
        let background = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !delay.is_zero() => {
                handle.spawn(run_order_writer(Arc::clone(&inner)));
                true
            }
            _ => false,
        };
        Self { inner, background }
    }

    pub fn schedule(&self, order: Vec<Uuid>) {
        if !self.background {
            self.inner.write(&order);
            return;
        }
        match self.inner.pending.lock() {
            Ok(mut pending) => {
                pending.generation = pending.generation.wrapping_add(1);
                pending.order = Some(order);
            }
            Err(_) => {
                tracing::warn!("order writer mutex poisoned, writing inline");
                self.inner.write(&order);
                return;
            }
        }
        self.inner.notify.notify_one();
    }

    pub fn has_pending(&self) -> bool {
        self.inner
            .pending
            .lock()
            .map(|pending| pending.order.is_some())
            .unwrap_or(false)
    }

    /// Writes the pending order now instead of waiting for the window.
    pub fn flush(&self) {
        if let Some(order) = self.inner.take_if(None) {
            self.inner.write(&order);
        }
    }

    /// Drops the pending order without writing it.
    pub fn cancel(&self) {
        let _ = self.inner.take_if(None);
    }
}

impl Drop for DebouncedOrderWriter {
    fn drop(&mut self) {
        self.flush();
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }
}

async fn run_order_writer(inner: Arc<OrderWriterInner>) {
    loop {
        inner.notify.notified().await;
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        loop {
            let generation = match inner.pending.lock() {
                Ok(pending) => pending.generation,
                Err(_) => break,
            };
            tokio::time::sleep(inner.delay).await;
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let still_latest = inner
                .pending
                .lock()
                .map(|pending| pending.generation == generation)
                .unwrap_or(false);
            if still_latest {
                if let Some(order) = inner.take_if(Some(generation)) {
                    inner.write(&order);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{plan_note_ops, CacheOp, DebouncedOrderWriter, LocalCacheMirror};
    use crate::db::LocalCache;
    use crate::labels::{reduce_labels, LabelAction, LabelState};
    use crate::models::{Label, Note, NoteColor, NoteState};
    use crate::reducer::{reduce, NoteAction};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn seeded(count: usize) -> NoteState {
        let notes = (0..count).map(|_| Note::new(Uuid::new_v4(), None)).collect::<Vec<_>>();
        let order = notes.iter().map(|note| note.uuid).collect();
        reduce(&NoteState::default(), &NoteAction::SetInitialData { notes, order })
    }

    fn open_cache() -> (tempfile::TempDir, Arc<LocalCache>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open_for_user(dir.path(), "tester").expect("cache");
        (dir, Arc::new(cache))
    }

    #[test]
    fn trash_plans_one_upsert_and_an_order_write() {
        let state = seeded(3);
        let target = state.order[1];
        let action = NoteAction::TrashNote { uuid: target };
        let next = reduce(&state, &action);
        let ops = plan_note_ops(&action, &state, &next);
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            CacheOp::PutNotes(notes) => {
                assert_eq!(notes.len(), 1);
                assert!(notes[0].is_trash);
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(ops[1], CacheOp::PutOrder(next.order.to_vec()));
    }

    #[test]
    fn no_op_transitions_plan_nothing() {
        let state = seeded(2);
        let action = NoteAction::PinNote { uuid: Uuid::new_v4() };
        let next = reduce(&state, &action);
        assert!(plan_note_ops(&action, &state, &next).is_empty());
    }

    #[test]
    fn empty_trash_plans_deletes_for_every_trashed_note() {
        let state = seeded(3);
        let first = state.order[0];
        let trashed = reduce(&state, &NoteAction::TrashNote { uuid: first });
        let emptied = reduce(&trashed, &NoteAction::EmptyTrash);
        let ops = plan_note_ops(&NoteAction::EmptyTrash, &trashed, &emptied);
        assert!(ops.contains(&CacheOp::DeleteNotes(vec![first])));
    }

    #[test]
    fn mirrored_transitions_reload_identically() {
        let (_dir, cache) = open_cache();
        let mirror = LocalCacheMirror::new(Some(Arc::clone(&cache)), Duration::ZERO);
        let empty = NoteState::default();
        let state = seeded(3);
        let init = NoteAction::SetInitialData {
            notes: state.notes.values().cloned().collect(),
            order: state.order.to_vec(),
        };
        let mut current = reduce(&empty, &init);
        let mut batch = mirror.batch().expect("batch");
        batch.notes(&init, &empty, &current);
        batch.commit();

        let actions = vec![
            NoteAction::ArchiveNote { uuid: current.order[2] },
            NoteAction::UpdateColor {
                uuid: current.order[1],
                color: NoteColor::Peach,
            },
            NoteAction::DeleteNote { uuid: current.order[1] },
        ];
        for action in actions {
            let next = reduce(&current, &action);
            let mut batch = mirror.batch().expect("batch");
            batch.notes(&action, &current, &next);
            batch.commit();
            current = next;
        }
        mirror.flush();

        let loaded = cache.load().expect("load");
        let reloaded = reduce(
            &NoteState::default(),
            &NoteAction::SetInitialData {
                notes: loaded.notes,
                order: loaded.order,
            },
        );
        assert_eq!(reloaded, current);
    }

    #[test]
    fn label_transitions_are_mirrored() {
        let (_dir, cache) = open_cache();
        let mirror = LocalCacheMirror::new(Some(Arc::clone(&cache)), Duration::ZERO);
        let empty = LabelState::default();
        let label = Label::new("Errands", NoteColor::Default);
        let create = LabelAction::CreateLabel { label: label.clone() };
        let created = reduce_labels(&empty, &create);
        let mut batch = mirror.batch().expect("batch");
        batch.labels(&create, &empty, &created);
        batch.commit();
        assert_eq!(cache.load().expect("load").labels, vec![label.clone()]);

        let delete = LabelAction::DeleteLabel { uuid: label.uuid };
        let deleted = reduce_labels(&created, &delete);
        let mut batch = mirror.batch().expect("batch");
        batch.labels(&delete, &created, &deleted);
        batch.commit();
        assert!(cache.load().expect("load").labels.is_empty());
    }

    #[tokio::test]
    async fn order_writes_are_coalesced() {
        let (_dir, cache) = open_cache();
        let writer = DebouncedOrderWriter::new(Some(Arc::clone(&cache)), Duration::from_millis(40));
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        writer.schedule(vec![a, b, c]);
        writer.schedule(vec![c, b, a]);
        writer.schedule(vec![b, c, a]);
        assert!(writer.has_pending());
        assert!(cache.load().expect("load").order.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.has_pending());
        assert_eq!(cache.load().expect("load").order, vec![b, c, a]);
    }

    #[tokio::test]
    async fn flush_writes_the_pending_order_immediately() {
        let (_dir, cache) = open_cache();
        let writer = DebouncedOrderWriter::new(Some(Arc::clone(&cache)), Duration::from_secs(30));
        let order = vec![Uuid::new_v4(), Uuid::new_v4()];
        writer.schedule(order.clone());
        writer.flush();
        assert_eq!(cache.load().expect("load").order, order);
    }

    #[test]
    fn mirror_without_cache_is_silent() {
        let mirror = LocalCacheMirror::disabled();
        let state = seeded(1);
        let action = NoteAction::TrashNote { uuid: state.order[0] };
        let next = reduce(&state, &action);
        let mut batch = mirror.batch().expect("batch");
        batch.notes(&action, &state, &next);
        assert!(!batch.is_empty());
        batch.commit();
        mirror.flush();
    }

    #[test]
    fn batches_commit_one_at_a_time() {
        let (_dir, cache) = open_cache();
        let mirror = Arc::new(LocalCacheMirror::new(Some(Arc::clone(&cache)), Duration::ZERO));
        let state = seeded(2);
        let init = NoteAction::SetInitialData {
            notes: state.notes.values().cloned().collect(),
            order: state.order.to_vec(),
        };
        let first = mirror.batch().expect("first batch");
        let waiting = {
            let mirror = Arc::clone(&mirror);
            let state = state.clone();
            std::thread::spawn(move || {
                let mut batch = mirror.batch().expect("second batch");
                batch.notes(&init, &NoteState::default(), &state);
                batch.commit();
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.load().expect("load").notes.is_empty());
        first.commit();
        waiting.join().expect("join");
        mirror.flush();
        assert_eq!(cache.load().expect("load").notes.len(), 2);
    }
}
