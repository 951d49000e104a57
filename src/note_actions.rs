use crate::api::{note_patch, Mutation, MutationKind, NoteField, NotesApi};
use crate::copy::duplicate_note;
use crate::errors::{AppError, AppResult};
use crate::events::{EngineEvent, EventBus, Notification};
use crate::labels::{find_by_name, validate_label_name, LabelAction};
use crate::media::{is_placeholder_url, validate_image_upload, ImageUpload};
use crate::models::{Checkbox, Label, Note, NoteBackground, NoteColor, NoteImage, UserRef};
use crate::reducer::{LabelAssignment, NoteAction, SelectedNote};
use crate::session::ClientSession;
use crate::store::{NoteStore, StoreSnapshot, Transition};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A user intent. Each request becomes one optimistic step: reducer actions,
/// label actions and the server writes that follow them.
#[derive(Debug, Clone, PartialEq)]
pub enum NoteRequest {
    CreateNote { note: Note },
    TogglePin { uuid: Uuid },
    ToggleArchive { uuid: Uuid },
    ToggleTrash { uuid: Uuid },
    BatchPin { uuids: Vec<Uuid>, pin: bool },
    BatchArchive { uuids: Vec<Uuid>, archive: bool },
    BatchTrash { uuids: Vec<Uuid>, trash: bool },
    DeleteForever { uuids: Vec<Uuid> },
    EmptyTrash,
    SetColor { uuids: Vec<Uuid>, color: NoteColor },
    SetBackground { uuids: Vec<Uuid>, background: NoteBackground },
    EditText { uuid: Uuid, title: Option<String>, content: Option<String> },
    AddCheckbox { uuid: Uuid, content: String, parent: Option<Uuid> },
    SetCheckbox { uuid: Uuid, checkbox_uuid: Uuid, value: bool },
    DeleteCheckbox { uuid: Uuid, checkbox_uuid: Uuid },
    DeleteChecked { uuid: Uuid },
    UncheckAll { uuid: Uuid },
    SetCheckboxVisibility { uuid: Uuid, value: bool },
    SetExpandCompleted { uuid: Uuid, value: bool },
    AddLabelToNote { uuid: Uuid, label_uuid: Uuid },
    RemoveLabelFromNote { uuid: Uuid, label_uuid: Uuid },
    /// Applies a label by name to a selection, creating the label when no
    /// label has that name. If every selected note already carries it, the
    /// label is removed instead.
    ToggleLabelOnSelection { uuids: Vec<Uuid>, name: String },
    CreateLabel { name: String, color: NoteColor },
    RenameLabel { uuid: Uuid, name: String },
    SetLabelColor { uuid: Uuid, color: NoteColor },
    PinLabel { uuid: Uuid, value: bool },
    DeleteLabel { uuid: Uuid },
    RemoveImages { uuid: Uuid, image_uuids: Vec<Uuid> },
    SetCollaborators { uuid: Uuid, collaborators: Vec<UserRef> },
    MoveNote { initial_index: usize, final_index: usize },
    Copy { uuids: Vec<Uuid> },
}

/// Server writes derived from the state after a step has been applied, so
/// undo and redo send whatever the restored state holds.
#[derive(Debug, Clone, PartialEq)]
enum SyncPlan {
    Create(Vec<Uuid>),
    Fields(Vec<Uuid>, Vec<NoteField>),
    Order,
    Delete(Vec<Uuid>),
    EmptyTrash(Vec<Uuid>),
    Copy(Vec<Uuid>),
    UpsertLabel(Uuid, MutationKind),
    DeleteLabel(Uuid),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Step {
    labels: Vec<LabelAction>,
    notes: Vec<NoteAction>,
    sync: Vec<SyncPlan>,
}

impl Step {
    fn notes(actions: Vec<NoteAction>) -> Self {
        Self {
            notes: actions,
            ..Self::default()
        }
    }

    fn labels(actions: Vec<LabelAction>) -> Self {
        Self {
            labels: actions,
            ..Self::default()
        }
    }

    fn sync(mut self, plan: SyncPlan) -> Self {
        self.sync.push(plan);
        self
    }

    fn transition(&self) -> Transition {
        Transition {
            labels: self.labels.clone(),
            notes: self.notes.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct UndoEntry {
    message: String,
    undo: Step,
    redo: Step,
    destructive: bool,
    undone: bool,
}

struct Planned {
    step: Step,
    undo: Option<(String, Step)>,
    destructive: bool,
}

impl Planned {
    fn plain(step: Step) -> Self {
        Self {
            step,
            undo: None,
            destructive: false,
        }
    }

    fn undoable(step: Step, message: String, undo: Step) -> Self {
        Self {
            step,
            undo: Some((message, undo)),
            destructive: false,
        }
    }

    fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }
}

/// Marks a destructive request as in flight. The unload guard stays up
/// until the last one finishes.
struct PendingDestructive {
    counter: Arc<AtomicUsize>,
    events: EventBus,
}

impl PendingDestructive {
    fn enter(counter: &Arc<AtomicUsize>, events: &EventBus) -> Self {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            events.emit(EngineEvent::UnloadGuard { active: true });
        }
        Self {
            counter: Arc::clone(counter),
            events: events.clone(),
        }
    }
}

impl Drop for PendingDestructive {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.events.emit(EngineEvent::UnloadGuard { active: false });
        }
    }
}

pub struct NoteActions {
    store: Arc<NoteStore>,
    api: Arc<dyn NotesApi>,
    session: ClientSession,
    slot: Mutex<Option<UndoEntry>>,
    pending_destructive: Arc<AtomicUsize>,
}

impl NoteActions {
    pub fn new(store: Arc<NoteStore>, api: Arc<dyn NotesApi>, session: ClientSession) -> Self {
        Self {
            store,
            api,
            session,
            slot: Mutex::new(None),
            pending_destructive: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Applies a request optimistically and then writes it to the server.
    /// Validation errors are returned before anything changes. Server
    /// failures become error notifications and the local change is kept.
    pub async fn perform(&self, request: NoteRequest) -> AppResult<()> {
        let planned = self.store.transact(|snapshot| {
            let planned = self.plan(request, snapshot)?;
            let transition = planned
                .as_ref()
                .map(|planned| planned.step.transition())
                .unwrap_or_default();
            Ok((transition, planned))
        })?;
        let Some(planned) = planned else {
            return Ok(());
        };
        if let Some((message, undo)) = planned.undo {
            self.set_slot(UndoEntry {
                message: message.clone(),
                undo,
                redo: planned.step.clone(),
                destructive: planned.destructive,
                undone: false,
            })?;
            self.store.events().notify(Notification::info(message, true));
        }
        self.sync(&planned.step.sync, planned.destructive).await;
        Ok(())
    }

    /// Reverts the most recent undoable request. Returns false when there
    /// is nothing to undo.
    pub async fn undo(&self) -> AppResult<bool> {
        let Some(entry) = self.take_slot(false)? else {
            return Ok(false);
        };
        self.apply(&entry.undo)?;
        self.store
            .events()
            .notify(Notification::info(format!("Undone: {}", entry.message), false));
        self.sync(&entry.undo.sync, false).await;
        Ok(true)
    }

    /// Re-applies the request reverted by the last `undo`.
    pub async fn redo(&self) -> AppResult<bool> {
        let Some(entry) = self.take_slot(true)? else {
            return Ok(false);
        };
        self.apply(&entry.redo)?;
        self.store.events().notify(Notification::info(entry.message.clone(), true));
        self.sync(&entry.redo.sync, entry.destructive).await;
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        self.slot_state() == Some(false)
    }

    pub fn can_redo(&self) -> bool {
        self.slot_state() == Some(true)
    }

    pub fn has_pending_destructive(&self) -> bool {
        self.pending_destructive.load(Ordering::SeqCst) > 0
    }

    /// Adds images with inline placeholders, uploads them and swaps in the
    /// hosted URLs. A failed upload drops its placeholder.
    pub async fn add_images(&self, uuid: Uuid, uploads: Vec<ImageUpload>) -> AppResult<()> {
        for upload in &uploads {
            validate_image_upload(upload)?;
        }
        if uploads.is_empty() || !self.store.notes()?.contains(&uuid) {
            return Ok(());
        }
        let placeholders = uploads.iter().map(ImageUpload::placeholder).collect();
        self.store.dispatch(&NoteAction::AddImages {
            uuid,
            images: placeholders,
        })?;

        let mut hosted = Vec::with_capacity(uploads.len());
        for upload in &uploads {
            match self.api.upload_image(uuid, upload).await {
                Ok(uploaded) => hosted.push(NoteImage {
                    uuid: upload.uuid,
                    url: uploaded.url,
                }),
                Err(error) => {
                    tracing::warn!(error = %error, note = %uuid, image = %upload.uuid, "image upload failed");
                    self.store.dispatch(&NoteAction::DeleteImages {
                        uuid,
                        image_uuids: vec![upload.uuid],
                    })?;
                    self.store
                        .events()
                        .notify(Notification::error(format!("Image upload failed: {}", error)));
                }
            }
        }
        if hosted.is_empty() {
            return Ok(());
        }
        self.store.dispatch(&NoteAction::UpdateImages { uuid, images: hosted })?;
        self.sync(&[SyncPlan::Fields(vec![uuid], vec![NoteField::Images])], false)
            .await;
        Ok(())
    }

    fn apply(&self, step: &Step) -> AppResult<()> {
        self.store.transact(|_| Ok((step.transition(), ())))
    }

    fn lock_slot(&self) -> AppResult<std::sync::MutexGuard<'_, Option<UndoEntry>>> {
        self.slot
            .lock()
            .map_err(|_| AppError::Internal("undo slot mutex poisoned".to_string()))
    }

    fn set_slot(&self, entry: UndoEntry) -> AppResult<()> {
        *self.lock_slot()? = Some(entry);
        Ok(())
    }

    fn take_slot(&self, undone: bool) -> AppResult<Option<UndoEntry>> {
        let mut slot = self.lock_slot()?;
        match slot.as_mut() {
            Some(entry) if entry.undone == undone => {
                entry.undone = !undone;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    fn slot_state(&self) -> Option<bool> {
        self.slot.lock().ok()?.as_ref().map(|entry| entry.undone)
    }

    async fn sync(&self, plans: &[SyncPlan], destructive: bool) {
        let _pending = destructive.then(|| PendingDestructive::enter(&self.pending_destructive, self.store.events()));
        for plan in plans {
            if let Err(error) = self.sync_one(plan).await {
                tracing::warn!(error = %error, "server write failed, keeping local state");
                self.store
                    .events()
                    .notify(Notification::error(format!("Could not save changes: {}", error)));
                return;
            }
        }
    }

    async fn sync_one(&self, plan: &SyncPlan) -> AppResult<()> {
        let snapshot = self.store.snapshot()?;
        if let SyncPlan::Copy(uuids) = plan {
            return self.finalize_copies(uuids, &snapshot).await;
        }
        for mutation in build_mutations(plan, &snapshot, &self.session)? {
            self.api.send(&mutation).await?;
        }
        Ok(())
    }

    async fn finalize_copies(&self, uuids: &[Uuid], snapshot: &StoreSnapshot) -> AppResult<()> {
        let copies = uuids
            .iter()
            .filter_map(|uuid| snapshot.notes.get(uuid).cloned())
            .collect::<Vec<_>>();
        if copies.is_empty() {
            return Ok(());
        }
        let finalized = self.api.copy_notes(&copies, self.session.client_id()).await?;
        if !finalized.is_empty() {
            self.store.dispatch(&NoteAction::UpdateNotes { notes: finalized })?;
        }
        Ok(())
    }

    fn plan(&self, request: NoteRequest, snapshot: &StoreSnapshot) -> AppResult<Option<Planned>> {
        let notes = &snapshot.notes;
        let planned = match request {
            NoteRequest::CreateNote { mut note } => {
                if notes.contains(&note.uuid) {
                    return Ok(None);
                }
                if note.creator.is_none() {
                    note.creator = Some(self.session.user().clone());
                }
                let uuid = note.uuid;
                Planned::plain(
                    Step::notes(vec![NoteAction::AddNote { note }])
                        .sync(SyncPlan::Create(vec![uuid]))
                        .sync(SyncPlan::Order),
                )
            }
            NoteRequest::TogglePin { uuid } => {
                let Some(note) = notes.get(&uuid) else {
                    return Ok(None);
                };
                if note.is_trash {
                    return Ok(None);
                }
                let message = if note.is_pinned { "Note unpinned" } else { "Note pinned" };
                let undo = NoteAction::UndoPin {
                    uuid,
                    index: notes.index_of(&uuid).unwrap_or(0),
                    flags: note.flags(),
                };
                toggle_plan(NoteAction::PinNote { uuid }, undo, uuid, message)
            }
            NoteRequest::ToggleArchive { uuid } => {
                let Some(note) = notes.get(&uuid) else {
                    return Ok(None);
                };
                let message = if note.is_archived { "Note unarchived" } else { "Note archived" };
                let undo = NoteAction::UndoArchive {
                    uuid,
                    index: notes.index_of(&uuid).unwrap_or(0),
                    flags: note.flags(),
                };
                toggle_plan(NoteAction::ArchiveNote { uuid }, undo, uuid, message)
            }
            NoteRequest::ToggleTrash { uuid } => {
                let Some(note) = notes.get(&uuid) else {
                    return Ok(None);
                };
                let message = if note.is_trash { "Note restored" } else { "Note moved to trash" };
                let undo = NoteAction::UndoTrash {
                    uuid,
                    index: notes.index_of(&uuid).unwrap_or(0),
                    flags: note.flags(),
                };
                toggle_plan(NoteAction::TrashNote { uuid }, undo, uuid, message).destructive()
            }
            NoteRequest::BatchPin { uuids, pin } => {
                let selected = capture(snapshot, &uuids)
                    .into_iter()
                    .filter(|entry| !entry.flags.is_trash)
                    .collect::<Vec<_>>();
                if selected.is_empty() {
                    return Ok(None);
                }
                let verb = if pin { "pinned" } else { "unpinned" };
                batch_plan(
                    NoteAction::BatchPin {
                        selected: selected.clone(),
                        pin,
                    },
                    NoteAction::UndoBatchPin { selected: selected.clone() },
                    &selected,
                    verb,
                )
            }
            NoteRequest::BatchArchive { uuids, archive } => {
                let selected = capture(snapshot, &uuids);
                if selected.is_empty() {
                    return Ok(None);
                }
                let verb = if archive { "archived" } else { "unarchived" };
                batch_plan(
                    NoteAction::BatchArchive {
                        selected: selected.clone(),
                        archive,
                    },
                    NoteAction::UndoBatchArchive { selected: selected.clone() },
                    &selected,
                    verb,
                )
            }
            NoteRequest::BatchTrash { uuids, trash } => {
                let selected = capture(snapshot, &uuids);
                if selected.is_empty() {
                    return Ok(None);
                }
                let verb = if trash { "moved to trash" } else { "restored" };
                batch_plan(
                    NoteAction::BatchTrash {
                        selected: selected.clone(),
                        trash,
                    },
                    NoteAction::UndoBatchTrash { selected: selected.clone() },
                    &selected,
                    verb,
                )
                .destructive()
            }
            NoteRequest::DeleteForever { uuids } => {
                let present = present(snapshot, &uuids);
                if present.is_empty() {
                    return Ok(None);
                }
                let action = match present.as_slice() {
                    [uuid] => NoteAction::DeleteNote { uuid: *uuid },
                    _ => NoteAction::BatchDeleteNotes { uuids: present.clone() },
                };
                Planned::plain(
                    Step::notes(vec![action])
                        .sync(SyncPlan::Delete(present))
                        .sync(SyncPlan::Order),
                )
                .destructive()
            }
            NoteRequest::EmptyTrash => {
                let trashed = notes
                    .ordered_notes()
                    .filter(|note| note.is_trash)
                    .map(|note| note.uuid)
                    .collect::<Vec<_>>();
                if trashed.is_empty() {
                    return Ok(None);
                }
                Planned::plain(
                    Step::notes(vec![NoteAction::EmptyTrash])
                        .sync(SyncPlan::EmptyTrash(trashed))
                        .sync(SyncPlan::Order),
                )
                .destructive()
            }
            NoteRequest::SetColor { uuids, color } => {
                let present = present(snapshot, &uuids);
                let action = match present.as_slice() {
                    [] => return Ok(None),
                    [uuid] => NoteAction::UpdateColor { uuid: *uuid, color },
                    _ => NoteAction::BatchUpdateColor {
                        uuids: present.clone(),
                        color,
                    },
                };
                fields_plan(action, present, &[NoteField::Color])
            }
            NoteRequest::SetBackground { uuids, background } => {
                let present = present(snapshot, &uuids);
                let action = match present.as_slice() {
                    [] => return Ok(None),
                    [uuid] => NoteAction::UpdateBackground {
                        uuid: *uuid,
                        background,
                    },
                    _ => NoteAction::BatchUpdateBackground {
                        uuids: present.clone(),
                        background,
                    },
                };
                fields_plan(action, present, &[NoteField::Background])
            }
            NoteRequest::EditText { uuid, title, content } => {
                if !notes.contains(&uuid) || (title.is_none() && content.is_none()) {
                    return Ok(None);
                }
                let mut fields = Vec::new();
                if title.is_some() {
                    fields.push(NoteField::Title);
                }
                if content.is_some() {
                    fields.push(NoteField::Content);
                }
                fields_plan(NoteAction::UpdateText { uuid, title, content }, vec![uuid], &fields)
            }
            NoteRequest::AddCheckbox { uuid, content, parent } => {
                let content = content.trim().to_string();
                if content.is_empty() {
                    return Err(AppError::Validation("Checklist item cannot be empty".to_string()));
                }
                let Some(note) = notes.get(&uuid) else {
                    return Ok(None);
                };
                if let Some(parent) = parent {
                    let Some(parent_item) = note.checkboxes.iter().find(|item| item.uuid == parent) else {
                        return Err(AppError::Validation("Parent checklist item does not exist".to_string()));
                    };
                    if parent_item.parent.is_some() {
                        return Err(AppError::Validation(
                            "Checklist items can only be nested one level".to_string(),
                        ));
                    }
                }
                let checkbox = Checkbox::new(content, parent);
                fields_plan(NoteAction::AddCheckbox { uuid, checkbox }, vec![uuid], &[NoteField::Checkboxes])
            }
            NoteRequest::SetCheckbox {
                uuid,
                checkbox_uuid,
                value,
            } => {
                return Ok(checkbox_plan(
                    snapshot,
                    uuid,
                    NoteAction::CheckboxState {
                        uuid,
                        checkbox_uuid,
                        value,
                    },
                ))
            }
            NoteRequest::DeleteCheckbox { uuid, checkbox_uuid } => {
                return Ok(checkbox_plan(snapshot, uuid, NoteAction::DeleteCheckbox { uuid, checkbox_uuid }))
            }
            NoteRequest::DeleteChecked { uuid } => {
                return Ok(checkbox_plan(snapshot, uuid, NoteAction::DeleteChecked { uuid }))
            }
            NoteRequest::UncheckAll { uuid } => return Ok(checkbox_plan(snapshot, uuid, NoteAction::UncheckAll { uuid })),
            NoteRequest::SetCheckboxVisibility { uuid, value } => {
                if !notes.contains(&uuid) {
                    return Ok(None);
                }
                fields_plan(
                    NoteAction::CheckboxVisibility { uuid, value },
                    vec![uuid],
                    &[NoteField::CheckboxVisibility],
                )
            }
            NoteRequest::SetExpandCompleted { uuid, value } => {
                if !notes.contains(&uuid) {
                    return Ok(None);
                }
                fields_plan(
                    NoteAction::ExpandItems { uuid, value },
                    vec![uuid],
                    &[NoteField::ExpandCompleted],
                )
            }
            NoteRequest::AddLabelToNote { uuid, label_uuid } => {
                if !snapshot.labels.contains_key(&label_uuid) {
                    return Err(AppError::Validation("Label does not exist".to_string()));
                }
                if !notes.contains(&uuid) {
                    return Ok(None);
                }
                fields_plan(NoteAction::AddLabel { uuid, label_uuid }, vec![uuid], &[NoteField::Labels])
            }
            NoteRequest::RemoveLabelFromNote { uuid, label_uuid } => {
                if !notes.contains(&uuid) {
                    return Ok(None);
                }
                fields_plan(NoteAction::RemoveLabel { uuid, label_uuid }, vec![uuid], &[NoteField::Labels])
            }
            NoteRequest::ToggleLabelOnSelection { uuids, name } => {
                let present = present(snapshot, &uuids);
                let (label_uuid, mut step) = match find_by_name(&snapshot.labels, &name) {
                    Some(existing) => (existing.uuid, Step::default()),
                    None => {
                        let name = validate_label_name(&name, &snapshot.labels, None)?;
                        let label = Label::new(name, NoteColor::Default);
                        let uuid = label.uuid;
                        (
                            uuid,
                            Step::labels(vec![LabelAction::CreateLabel { label }])
                                .sync(SyncPlan::UpsertLabel(uuid, MutationKind::CreateLabel)),
                        )
                    }
                };
                if present.is_empty() {
                    return Ok((!step.labels.is_empty()).then(|| Planned::plain(step)));
                }
                let carriers = present
                    .iter()
                    .filter(|uuid| {
                        notes
                            .get(uuid)
                            .map(|note| note.labels.contains(&label_uuid))
                            .unwrap_or(false)
                    })
                    .count();
                let action = if carriers == present.len() {
                    NoteAction::BatchRemoveLabel {
                        uuids: present.clone(),
                        label_uuid,
                    }
                } else if carriers == 0 {
                    NoteAction::BatchAddLabel(LabelAssignment::Shared {
                        uuids: present.clone(),
                        label_uuid,
                    })
                } else {
                    let labels = present
                        .iter()
                        .filter_map(|uuid| notes.get(uuid))
                        .map(|note| {
                            let mut next = note.labels.clone();
                            next.insert(label_uuid);
                            (note.uuid, next)
                        })
                        .collect::<HashMap<Uuid, BTreeSet<Uuid>>>();
                    NoteAction::BatchAddLabel(LabelAssignment::Unshared { labels })
                };
                step.notes.push(action);
                Planned::plain(step.sync(SyncPlan::Fields(present, vec![NoteField::Labels])))
            }
            NoteRequest::CreateLabel { name, color } => {
                let name = validate_label_name(&name, &snapshot.labels, None)?;
                let label = Label::new(name, color);
                let uuid = label.uuid;
                Planned::plain(
                    Step::labels(vec![LabelAction::CreateLabel { label }])
                        .sync(SyncPlan::UpsertLabel(uuid, MutationKind::CreateLabel)),
                )
            }
            NoteRequest::RenameLabel { uuid, name } => {
                if !snapshot.labels.contains_key(&uuid) {
                    return Ok(None);
                }
                let label = validate_label_name(&name, &snapshot.labels, Some(uuid))?;
                label_update_plan(LabelAction::RenameLabel { uuid, label }, uuid)
            }
            NoteRequest::SetLabelColor { uuid, color } => {
                if !snapshot.labels.contains_key(&uuid) {
                    return Ok(None);
                }
                label_update_plan(LabelAction::UpdateLabelColor { uuid, color }, uuid)
            }
            NoteRequest::PinLabel { uuid, value } => {
                if !snapshot.labels.contains_key(&uuid) {
                    return Ok(None);
                }
                label_update_plan(
                    LabelAction::PinLabel {
                        uuid,
                        value,
                        pin_date: value.then(Utc::now),
                    },
                    uuid,
                )
            }
            NoteRequest::DeleteLabel { uuid } => {
                if !snapshot.labels.contains_key(&uuid) {
                    return Ok(None);
                }
                let carriers = notes
                    .ordered_notes()
                    .filter(|note| note.labels.contains(&uuid))
                    .map(|note| note.uuid)
                    .collect::<Vec<_>>();
                let mut step = Step::labels(vec![LabelAction::DeleteLabel { uuid }]);
                step.notes.push(NoteAction::RemoveLabelFromNotes { label_uuid: uuid });
                step = step.sync(SyncPlan::DeleteLabel(uuid));
                if !carriers.is_empty() {
                    step = step.sync(SyncPlan::Fields(carriers, vec![NoteField::Labels]));
                }
                Planned::plain(step)
            }
            NoteRequest::RemoveImages { uuid, image_uuids } => {
                if !notes.contains(&uuid) || image_uuids.is_empty() {
                    return Ok(None);
                }
                fields_plan(NoteAction::DeleteImages { uuid, image_uuids }, vec![uuid], &[NoteField::Images])
            }
            NoteRequest::SetCollaborators { uuid, collaborators } => {
                if !notes.contains(&uuid) {
                    return Ok(None);
                }
                fields_plan(
                    NoteAction::UpdateCollaborators { uuid, collaborators },
                    vec![uuid],
                    &[NoteField::Collaborators],
                )
            }
            NoteRequest::MoveNote {
                initial_index,
                final_index,
            } => {
                if initial_index >= notes.order.len() || initial_index == final_index {
                    return Ok(None);
                }
                Planned::plain(
                    Step::notes(vec![NoteAction::Dnd {
                        initial_index,
                        final_index,
                    }])
                    .sync(SyncPlan::Order),
                )
            }
            NoteRequest::Copy { uuids } => {
                let creator = Some(self.session.user().clone());
                let copies = uuids
                    .iter()
                    .filter_map(|uuid| notes.get(uuid))
                    .filter(|note| !note.is_trash)
                    .map(|note| duplicate_note(note, creator.clone()))
                    .collect::<Vec<_>>();
                if copies.is_empty() {
                    return Ok(None);
                }
                let copy_uuids = copies.iter().map(|note| note.uuid).collect::<Vec<_>>();
                let message = match copies.len() {
                    1 => "Note copied".to_string(),
                    count => format!("{} notes copied", count),
                };
                let undo = match copy_uuids.as_slice() {
                    [uuid] => NoteAction::UndoCopy { uuid: *uuid },
                    _ => NoteAction::UndoBatchCopy {
                        uuids: copy_uuids.clone(),
                    },
                };
                Planned::undoable(
                    Step::notes(vec![NoteAction::BatchCopyNote { notes: copies }])
                        .sync(SyncPlan::Copy(copy_uuids.clone()))
                        .sync(SyncPlan::Order),
                    message,
                    Step::notes(vec![undo])
                        .sync(SyncPlan::Delete(copy_uuids))
                        .sync(SyncPlan::Order),
                )
            }
        };
        Ok(Some(planned))
    }
}

fn capture(snapshot: &StoreSnapshot, uuids: &[Uuid]) -> Vec<SelectedNote> {
    uuids
        .iter()
        .filter_map(|uuid| SelectedNote::capture(&snapshot.notes, *uuid))
        .collect()
}

fn present(snapshot: &StoreSnapshot, uuids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::new();
    uuids
        .iter()
        .filter(|uuid| snapshot.notes.contains(uuid) && seen.insert(**uuid))
        .copied()
        .collect()
}

fn toggle_plan(action: NoteAction, undo: NoteAction, uuid: Uuid, message: &str) -> Planned {
    let sync = |step: Step| {
        step.sync(SyncPlan::Fields(vec![uuid], vec![NoteField::Flags]))
            .sync(SyncPlan::Order)
    };
    Planned::undoable(sync(Step::notes(vec![action])), message.to_string(), sync(Step::notes(vec![undo])))
}

fn batch_plan(action: NoteAction, undo: NoteAction, selected: &[SelectedNote], verb: &str) -> Planned {
    let uuids = selected.iter().map(|entry| entry.uuid).collect::<Vec<_>>();
    let message = match uuids.len() {
        1 => format!("Note {}", verb),
        count => format!("{} notes {}", count, verb),
    };
    let sync = |step: Step| {
        step.sync(SyncPlan::Fields(uuids.clone(), vec![NoteField::Flags]))
            .sync(SyncPlan::Order)
    };
    Planned::undoable(sync(Step::notes(vec![action])), message, sync(Step::notes(vec![undo])))
}

fn fields_plan(action: NoteAction, uuids: Vec<Uuid>, fields: &[NoteField]) -> Planned {
    Planned::plain(Step::notes(vec![action]).sync(SyncPlan::Fields(uuids, fields.to_vec())))
}

fn checkbox_plan(snapshot: &StoreSnapshot, uuid: Uuid, action: NoteAction) -> Option<Planned> {
    snapshot
        .notes
        .contains(&uuid)
        .then(|| fields_plan(action, vec![uuid], &[NoteField::Checkboxes]))
}

fn label_update_plan(action: LabelAction, uuid: Uuid) -> Planned {
    Planned::plain(Step::labels(vec![action]).sync(SyncPlan::UpsertLabel(uuid, MutationKind::UpdateLabel)))
}

fn build_mutations(plan: &SyncPlan, snapshot: &StoreSnapshot, session: &ClientSession) -> AppResult<Vec<Mutation>> {
    let client_id = session.client_id();
    let notes = &snapshot.notes;
    let mutations = match plan {
        SyncPlan::Create(uuids) => {
            let created = uuids.iter().filter_map(|uuid| notes.get(uuid)).collect::<Vec<_>>();
            if created.is_empty() {
                return Ok(Vec::new());
            }
            vec![Mutation::new(
                MutationKind::CreateNotes,
                serde_json::to_value(&created)?,
                created.iter().map(|note| note.uuid).collect(),
                client_id,
            )]
        }
        SyncPlan::Fields(uuids, fields) => {
            let mut groups: Vec<(Value, Vec<Uuid>)> = Vec::new();
            for uuid in uuids {
                let Some(note) = notes.get(uuid) else {
                    continue;
                };
                let patch = strip_placeholders(note_patch(note, fields)?);
                match groups.iter_mut().find(|(value, _)| *value == patch) {
                    Some((_, members)) => members.push(*uuid),
                    None => groups.push((patch, vec![*uuid])),
                }
            }
            groups
                .into_iter()
                .map(|(value, members)| Mutation::new(MutationKind::UpdateNotes, value, members, client_id))
                .collect()
        }
        SyncPlan::Order => vec![Mutation::new(
            MutationKind::SetOrder,
            serde_json::to_value(notes.order.as_slice())?,
            Vec::new(),
            client_id,
        )],
        SyncPlan::Delete(uuids) => vec![Mutation::new(MutationKind::DeleteNotes, Value::Null, uuids.clone(), client_id)],
        SyncPlan::EmptyTrash(uuids) => vec![Mutation::new(MutationKind::EmptyTrash, Value::Null, uuids.clone(), client_id)],
        SyncPlan::UpsertLabel(uuid, kind) => match snapshot.labels.get(uuid) {
            Some(label) => vec![Mutation::label(*kind, label, client_id)?],
            None => Vec::new(),
        },
        SyncPlan::DeleteLabel(uuid) => vec![Mutation::new(
            MutationKind::DeleteLabel,
            json!({ "uuid": uuid }),
            Vec::new(),
            client_id,
        )],
        SyncPlan::Copy(_) => Vec::new(),
    };
    Ok(mutations)
}

/// Images still waiting for their upload are local-only.
fn strip_placeholders(mut patch: Value) -> Value {
    if let Some(Value::Array(images)) = patch.get_mut("images") {
        images.retain(|image| {
            image
                .get("url")
                .and_then(Value::as_str)
                .map(|url| !is_placeholder_url(url))
                .unwrap_or(true)
        });
    }
    patch
}
