use crate::models::{Checkbox, Note, NoteBackground, NoteColor, NoteFlags, NoteImage, NoteState, UserRef};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// A note picked in a multi-selection, captured before the batch action runs
/// so the inverse can restore both its flags and its original position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedNote {
    pub uuid: Uuid,
    pub index: usize,
    pub flags: NoteFlags,
}

impl SelectedNote {
    pub fn capture(state: &NoteState, uuid: Uuid) -> Option<Self> {
        let note = state.get(&uuid)?;
        let index = state.index_of(&uuid)?;
        Some(Self {
            uuid,
            index,
            flags: note.flags(),
        })
    }

    pub fn is_pinned(&self) -> bool {
        self.flags.is_pinned
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LabelAssignment {
    /// Every selected note receives the same label.
    Shared { uuids: Vec<Uuid>, label_uuid: Uuid },
    /// Per-note label sets computed by the caller, used when only part of the
    /// selection already carried the label.
    Unshared { labels: HashMap<Uuid, BTreeSet<Uuid>> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoteAction {
    SetInitialData { notes: Vec<Note>, order: Vec<Uuid> },
    AddNote { note: Note },
    AddNotes { notes: Vec<Note> },
    UpdateNotes { notes: Vec<Note> },

    PinNote { uuid: Uuid },
    ArchiveNote { uuid: Uuid },
    TrashNote { uuid: Uuid },
    UndoPin { uuid: Uuid, index: usize, flags: NoteFlags },
    UndoArchive { uuid: Uuid, index: usize, flags: NoteFlags },
    UndoTrash { uuid: Uuid, index: usize, flags: NoteFlags },

    BatchArchive { selected: Vec<SelectedNote>, archive: bool },
    BatchTrash { selected: Vec<SelectedNote>, trash: bool },
    BatchPin { selected: Vec<SelectedNote>, pin: bool },
    UndoBatchArchive { selected: Vec<SelectedNote> },
    UndoBatchTrash { selected: Vec<SelectedNote> },
    UndoBatchPin { selected: Vec<SelectedNote> },

    DeleteNote { uuid: Uuid },
    BatchDeleteNotes { uuids: Vec<Uuid> },
    DeleteById { server_id: String },
    EmptyTrash,

    UpdateColor { uuid: Uuid, color: NoteColor },
    UpdateBackground { uuid: Uuid, background: NoteBackground },
    BatchUpdateColor { uuids: Vec<Uuid>, color: NoteColor },
    BatchUpdateBackground { uuids: Vec<Uuid>, background: NoteBackground },

    AddLabel { uuid: Uuid, label_uuid: Uuid },
    RemoveLabel { uuid: Uuid, label_uuid: Uuid },
    BatchAddLabel(LabelAssignment),
    BatchRemoveLabel { uuids: Vec<Uuid>, label_uuid: Uuid },
    RemoveLabelFromNotes { label_uuid: Uuid },
    UpdateNoteLabels { uuid: Uuid, labels: BTreeSet<Uuid> },

    UpdateText { uuid: Uuid, title: Option<String>, content: Option<String> },
    UpdateImages { uuid: Uuid, images: Vec<NoteImage> },
    DeleteImages { uuid: Uuid, image_uuids: Vec<Uuid> },
    AddImages { uuid: Uuid, images: Vec<NoteImage> },
    UpdateCollaborators { uuid: Uuid, collaborators: Vec<UserRef> },

    AddCheckbox { uuid: Uuid, checkbox: Checkbox },
    CheckboxState { uuid: Uuid, checkbox_uuid: Uuid, value: bool },
    DeleteCheckbox { uuid: Uuid, checkbox_uuid: Uuid },
    DeleteChecked { uuid: Uuid },
    UncheckAll { uuid: Uuid },
    CheckboxVisibility { uuid: Uuid, value: bool },
    ExpandItems { uuid: Uuid, value: bool },

    SetOrder { order: Vec<Uuid> },
    Dnd { initial_index: usize, final_index: usize },

    BatchCopyNote { notes: Vec<Note> },
    UndoCopy { uuid: Uuid },
    UndoBatchCopy { uuids: Vec<Uuid> },
}

impl NoteAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetInitialData { .. } => "SET_INITIAL_DATA",
            Self::AddNote { .. } => "ADD_NOTE",
            Self::AddNotes { .. } => "ADD_NOTES",
            Self::UpdateNotes { .. } => "UPDATE_NOTES",
            Self::PinNote { .. } => "PIN_NOTE",
            Self::ArchiveNote { .. } => "ARCHIVE_NOTE",
            Self::TrashNote { .. } => "TRASH_NOTE",
            Self::UndoPin { .. } => "UNDO_PIN",
            Self::UndoArchive { .. } => "UNDO_ARCHIVE",
            Self::UndoTrash { .. } => "UNDO_TRASH",
            Self::BatchArchive { .. } => "BATCH_ARCHIVE",
            Self::BatchTrash { .. } => "BATCH_TRASH",
            Self::BatchPin { .. } => "BATCH_PIN",
            Self::UndoBatchArchive { .. } => "UNDO_BATCH_ARCHIVE",
            Self::UndoBatchTrash { .. } => "UNDO_BATCH_TRASH",
            Self::UndoBatchPin { .. } => "UNDO_BATCH_PIN",
            Self::DeleteNote { .. } => "DELETE_NOTE",
            Self::BatchDeleteNotes { .. } => "BATCH_DELETE_NOTES",
            Self::DeleteById { .. } => "DELETE_BY_ID",
            Self::EmptyTrash => "EMPTY_TRASH",
            Self::UpdateColor { .. } => "UPDATE_COLOR",
            Self::UpdateBackground { .. } => "UPDATE_BG",
            Self::BatchUpdateColor { .. } => "BATCH_UPDATE_COLOR",
            Self::BatchUpdateBackground { .. } => "BATCH_UPDATE_BG",
            Self::AddLabel { .. } => "ADD_LABEL",
            Self::RemoveLabel { .. } => "REMOVE_LABEL",
            Self::BatchAddLabel(_) => "BATCH_ADD_LABEL",
            Self::BatchRemoveLabel { .. } => "BATCH_REMOVE_LABEL",
            Self::RemoveLabelFromNotes { .. } => "REMOVE_LABEL_FROM_NOTES",
            Self::UpdateNoteLabels { .. } => "UPDATE_NOTE_LABELS",
            Self::UpdateText { .. } => "UPDATE_TEXT",
            Self::UpdateImages { .. } => "UPDATE_IMAGES",
            Self::DeleteImages { .. } => "DELETE_IMAGES",
            Self::AddImages { .. } => "ADD_IMAGES",
            Self::UpdateCollaborators { .. } => "UPDATE_COLLABORATORS",
            Self::AddCheckbox { .. } => "ADD_CHECKBOX",
            Self::CheckboxState { .. } => "CHECKBOX_STATE",
            Self::DeleteCheckbox { .. } => "DELETE_CHECKBOX",
            Self::DeleteChecked { .. } => "DELETE_CHECKED",
            Self::UncheckAll { .. } => "UNCHECK_ALL",
            Self::CheckboxVisibility { .. } => "CHECKBOX_VIS",
            Self::ExpandItems { .. } => "EXPAND_ITEMS",
            Self::SetOrder { .. } => "SET_ORDER",
            Self::Dnd { .. } => "DND",
            Self::BatchCopyNote { .. } => "BATCH_COPY_NOTE",
            Self::UndoCopy { .. } => "UNDO_COPY",
            Self::UndoBatchCopy { .. } => "UNDO_BATCH_COPY",
        }
    }
}

/// Applies one action and returns the next state. Collections that do not
/// change are shared with the input; actions naming notes that are not
/// present leave the state untouched.
pub fn reduce(state: &NoteState, action: &NoteAction) -> NoteState {
    match action {
        NoteAction::SetInitialData { notes, order } => {
            let notes: HashMap<Uuid, Note> = notes.iter().map(|note| (note.uuid, note.clone())).collect();
            let order = normalize_order(&notes, order);
            NoteState::new(notes, order)
        }
        NoteAction::AddNote { note } => {
            if state.contains(&note.uuid) {
                return state.clone();
            }
            let mut notes = (*state.notes).clone();
            notes.insert(note.uuid, note.clone());
            let mut order = Vec::with_capacity(state.order.len() + 1);
            order.push(note.uuid);
            order.extend(state.order.iter().copied());
            NoteState::new(notes, order)
        }
        NoteAction::AddNotes { notes: incoming } | NoteAction::BatchCopyNote { notes: incoming } => {
            insert_notes(state, incoming)
        }
        NoteAction::UpdateNotes { notes: incoming } => {
            let present = incoming.iter().filter(|note| state.contains(&note.uuid)).collect::<Vec<_>>();
            if present.is_empty() {
                return state.clone();
            }
            let mut notes = (*state.notes).clone();
            for note in present {
                notes.insert(note.uuid, note.clone());
            }
            with_notes(state, notes)
        }

        NoteAction::PinNote { uuid } => toggle_to_front(state, *uuid, toggle_pin),
        NoteAction::ArchiveNote { uuid } => toggle_to_front(state, *uuid, toggle_archive),
        NoteAction::TrashNote { uuid } => toggle_to_front(state, *uuid, toggle_trash),
        NoteAction::UndoPin { uuid, index, flags }
        | NoteAction::UndoArchive { uuid, index, flags }
        | NoteAction::UndoTrash { uuid, index, flags } => restore_at(state, *uuid, *index, *flags),

        NoteAction::BatchArchive { selected, archive } => batch_to_front(state, selected, |note| {
            note.is_archived = *archive;
            note.is_pinned = false;
        }),
        NoteAction::BatchTrash { selected, trash } => batch_to_front(state, selected, |note| {
            note.is_trash = *trash;
            note.is_pinned = false;
        }),
        NoteAction::BatchPin { selected, pin } => {
            let selected = selected
                .iter()
                .filter(|entry| state.get(&entry.uuid).map(|note| !note.is_trash).unwrap_or(false))
                .copied()
                .collect::<Vec<_>>();
            batch_to_front(state, &selected, |note| {
                note.is_pinned = *pin;
                if *pin {
                    note.is_archived = false;
                }
            })
        }
        NoteAction::UndoBatchArchive { selected }
        | NoteAction::UndoBatchTrash { selected }
        | NoteAction::UndoBatchPin { selected } => batch_restore(state, selected),

        NoteAction::DeleteNote { uuid } => remove_notes(state, &[*uuid]),
        NoteAction::BatchDeleteNotes { uuids } | NoteAction::UndoBatchCopy { uuids } => remove_notes(state, uuids),
        NoteAction::UndoCopy { uuid } => remove_notes(state, &[*uuid]),
        NoteAction::DeleteById { server_id } => {
            let target = state
                .notes
                .values()
                .find(|note| note.server_id.as_deref() == Some(server_id.as_str()))
                .map(|note| note.uuid);
            match target {
                Some(uuid) => remove_notes(state, &[uuid]),
                None => state.clone(),
            }
        }
        NoteAction::EmptyTrash => {
            let trashed = state
                .notes
                .values()
                .filter(|note| note.is_trash)
                .map(|note| note.uuid)
                .collect::<Vec<_>>();
            remove_notes(state, &trashed)
        }

        NoteAction::UpdateColor { uuid, color } => update_note(state, *uuid, |note| note.color = *color),
        NoteAction::UpdateBackground { uuid, background } => {
            update_note(state, *uuid, |note| note.background = *background)
        }
        NoteAction::BatchUpdateColor { uuids, color } => update_notes(state, uuids, |note| note.color = *color),
        NoteAction::BatchUpdateBackground { uuids, background } => {
            update_notes(state, uuids, |note| note.background = *background)
        }

        NoteAction::AddLabel { uuid, label_uuid } => update_note(state, *uuid, |note| {
            note.labels.insert(*label_uuid);
        }),
        NoteAction::RemoveLabel { uuid, label_uuid } => update_note(state, *uuid, |note| {
            note.labels.remove(label_uuid);
        }),
        NoteAction::BatchAddLabel(LabelAssignment::Shared { uuids, label_uuid }) => {
            update_notes(state, uuids, |note| {
                note.labels.insert(*label_uuid);
            })
        }
        NoteAction::BatchAddLabel(LabelAssignment::Unshared { labels }) => {
            let uuids = labels.keys().copied().collect::<Vec<_>>();
            update_notes(state, &uuids, |note| {
                if let Some(next) = labels.get(&note.uuid) {
                    note.labels = next.clone();
                }
            })
        }
        NoteAction::BatchRemoveLabel { uuids, label_uuid } => update_notes(state, uuids, |note| {
            note.labels.remove(label_uuid);
        }),
        NoteAction::RemoveLabelFromNotes { label_uuid } => {
            let carriers = state
                .notes
                .values()
                .filter(|note| note.labels.contains(label_uuid))
                .map(|note| note.uuid)
                .collect::<Vec<_>>();
            update_notes(state, &carriers, |note| {
                note.labels.remove(label_uuid);
            })
        }
        NoteAction::UpdateNoteLabels { uuid, labels } => {
            update_note(state, *uuid, |note| note.labels = labels.clone())
        }

        NoteAction::UpdateText { uuid, title, content } => update_note(state, *uuid, |note| {
            if let Some(title) = title {
                note.title = title.clone();
            }
            if let Some(content) = content {
                note.content = content.clone();
            }
        }),
        NoteAction::UpdateImages { uuid, images } => update_note(state, *uuid, |note| {
            for image in note.images.iter_mut() {
                if let Some(next) = images.iter().find(|candidate| candidate.uuid == image.uuid) {
                    image.url = next.url.clone();
                }
            }
        }),
        NoteAction::DeleteImages { uuid, image_uuids } => update_note(state, *uuid, |note| {
            note.images.retain(|image| !image_uuids.contains(&image.uuid));
        }),
        NoteAction::AddImages { uuid, images } => update_note(state, *uuid, |note| {
            for image in images {
                if !note.images.iter().any(|existing| existing.uuid == image.uuid) {
                    note.images.push(image.clone());
                }
            }
        }),
        NoteAction::UpdateCollaborators { uuid, collaborators } => {
            update_note(state, *uuid, |note| note.collaborators = collaborators.clone())
        }

        NoteAction::AddCheckbox { uuid, checkbox } => update_note(state, *uuid, |note| {
            insert_checkbox(&mut note.checkboxes, checkbox.clone());
        }),
        NoteAction::CheckboxState { uuid, checkbox_uuid, value } => update_note(state, *uuid, |note| {
            set_checkbox_state(&mut note.checkboxes, *checkbox_uuid, *value);
        }),
        NoteAction::DeleteCheckbox { uuid, checkbox_uuid } => update_note(state, *uuid, |note| {
            note.checkboxes
                .retain(|item| item.uuid != *checkbox_uuid && item.parent != Some(*checkbox_uuid));
        }),
        NoteAction::DeleteChecked { uuid } => update_note(state, *uuid, |note| {
            let removed = note
                .checkboxes
                .iter()
                .filter(|item| item.is_completed)
                .map(|item| item.uuid)
                .collect::<HashSet<_>>();
            note.checkboxes.retain(|item| {
                !removed.contains(&item.uuid) && !item.parent.map(|parent| removed.contains(&parent)).unwrap_or(false)
            });
        }),
        NoteAction::UncheckAll { uuid } => update_note(state, *uuid, |note| {
            for item in note.checkboxes.iter_mut() {
                item.is_completed = false;
            }
        }),
        NoteAction::CheckboxVisibility { uuid, value } => {
            update_note(state, *uuid, |note| note.checkbox_visibility = *value)
        }
        NoteAction::ExpandItems { uuid, value } => update_note(state, *uuid, |note| note.expand_completed = *value),

        NoteAction::SetOrder { order } => {
            let order = normalize_order(&state.notes, order);
            NoteState {
                notes: Arc::clone(&state.notes),
                order: Arc::new(order),
            }
        }
        NoteAction::Dnd { initial_index, final_index } => {
            if *initial_index >= state.order.len() || initial_index == final_index {
                return state.clone();
            }
            let mut order = (*state.order).clone();
            let moved = order.remove(*initial_index);
            let target = (*final_index).min(order.len());
            order.insert(target, moved);
            NoteState {
                notes: Arc::clone(&state.notes),
                order: Arc::new(order),
            }
        }
    }
}

fn with_notes(state: &NoteState, notes: HashMap<Uuid, Note>) -> NoteState {
    NoteState {
        notes: Arc::new(notes),
        order: Arc::clone(&state.order),
    }
}

fn update_note(state: &NoteState, uuid: Uuid, apply: impl FnOnce(&mut Note)) -> NoteState {
    if !state.contains(&uuid) {
        return state.clone();
    }
    let mut notes = (*state.notes).clone();
    if let Some(note) = notes.get_mut(&uuid) {
        apply(note);
    }
    with_notes(state, notes)
}

fn update_notes(state: &NoteState, uuids: &[Uuid], mut apply: impl FnMut(&mut Note)) -> NoteState {
    if !uuids.iter().any(|uuid| state.contains(uuid)) {
        return state.clone();
    }
    let mut notes = (*state.notes).clone();
    for uuid in uuids {
        if let Some(note) = notes.get_mut(uuid) {
            apply(note);
        }
    }
    with_notes(state, notes)
}

fn insert_notes(state: &NoteState, incoming: &[Note]) -> NoteState {
    let mut seen = HashSet::new();
    let fresh = incoming
        .iter()
        .filter(|note| !state.contains(&note.uuid) && seen.insert(note.uuid))
        .collect::<Vec<_>>();
    if fresh.is_empty() {
        return state.clone();
    }
    let mut notes = (*state.notes).clone();
    let mut order = Vec::with_capacity(state.order.len() + fresh.len());
    for note in &fresh {
        notes.insert(note.uuid, (*note).clone());
        order.push(note.uuid);
    }
    order.extend(state.order.iter().copied());
    NoteState::new(notes, order)
}

fn remove_notes(state: &NoteState, uuids: &[Uuid]) -> NoteState {
    let doomed = uuids
        .iter()
        .filter(|uuid| state.contains(uuid))
        .copied()
        .collect::<HashSet<_>>();
    if doomed.is_empty() {
        return state.clone();
    }
    let mut notes = (*state.notes).clone();
    notes.retain(|uuid, _| !doomed.contains(uuid));
    let order = state
        .order
        .iter()
        .filter(|uuid| !doomed.contains(uuid))
        .copied()
        .collect::<Vec<_>>();
    NoteState::new(notes, order)
}

/// Flips a flag based on the value read from the note itself and moves the
/// note to the front of the order. The closure returns false when the
/// transition does not apply to the note in its current location.
fn toggle_to_front(state: &NoteState, uuid: Uuid, toggle: fn(&mut Note) -> bool) -> NoteState {
    let Some(current) = state.get(&uuid) else {
        return state.clone();
    };
    let mut next = current.clone();
    if !toggle(&mut next) {
        return state.clone();
    }
    let mut notes = (*state.notes).clone();
    notes.insert(uuid, next);
    let mut order = Vec::with_capacity(state.order.len());
    order.push(uuid);
    order.extend(state.order.iter().filter(|current| **current != uuid).copied());
    NoteState::new(notes, order)
}

fn toggle_pin(note: &mut Note) -> bool {
    if note.is_trash {
        return false;
    }
    note.is_pinned = !note.is_pinned;
    if note.is_pinned {
        note.is_archived = false;
    }
    true
}

fn toggle_archive(note: &mut Note) -> bool {
    note.is_archived = !note.is_archived;
    note.is_pinned = false;
    true
}

fn toggle_trash(note: &mut Note) -> bool {
    note.is_trash = !note.is_trash;
    note.is_pinned = false;
    true
}

fn restore_at(state: &NoteState, uuid: Uuid, index: usize, flags: NoteFlags) -> NoteState {
    if !state.contains(&uuid) {
        return state.clone();
    }
    let mut notes = (*state.notes).clone();
    if let Some(note) = notes.get_mut(&uuid) {
        note.set_flags(flags);
    }
    let mut order = state
        .order
        .iter()
        .filter(|current| **current != uuid)
        .copied()
        .collect::<Vec<_>>();
    order.insert(index.min(order.len()), uuid);
    NoteState::new(notes, order)
}

fn batch_to_front(state: &NoteState, selected: &[SelectedNote], mut apply: impl FnMut(&mut Note)) -> NoteState {
    let mut targets = selected
        .iter()
        .filter(|entry| state.contains(&entry.uuid))
        .copied()
        .collect::<Vec<_>>();
    if targets.is_empty() {
        return state.clone();
    }
    targets.sort_by(|a, b| b.index.cmp(&a.index));
    targets.dedup_by_key(|entry| entry.uuid);

    let mut notes = (*state.notes).clone();
    let mut front = Vec::with_capacity(targets.len());
    for entry in &targets {
        if let Some(note) = notes.get_mut(&entry.uuid) {
            apply(note);
        }
        if !front.contains(&entry.uuid) {
            front.push(entry.uuid);
        }
    }
    let moved = front.iter().copied().collect::<HashSet<_>>();
    let mut order = front;
    order.extend(state.order.iter().filter(|uuid| !moved.contains(uuid)).copied());
    NoteState::new(notes, order)
}

fn batch_restore(state: &NoteState, selected: &[SelectedNote]) -> NoteState {
    let mut targets = selected
        .iter()
        .filter(|entry| state.contains(&entry.uuid))
        .copied()
        .collect::<Vec<_>>();
    if targets.is_empty() {
        return state.clone();
    }
    targets.sort_by_key(|entry| entry.index);

    let moved = targets.iter().map(|entry| entry.uuid).collect::<HashSet<_>>();
    let mut notes = (*state.notes).clone();
    let mut order = state
        .order
        .iter()
        .filter(|uuid| !moved.contains(uuid))
        .copied()
        .collect::<Vec<_>>();
    for entry in &targets {
        if let Some(note) = notes.get_mut(&entry.uuid) {
            note.set_flags(entry.flags);
        }
        if !order.contains(&entry.uuid) {
            order.insert(entry.index.min(order.len()), entry.uuid);
        }
    }
    NoteState::new(notes, order)
}

/// Drops unknown and duplicate entries and prepends notes the order does not
/// mention, newest first.
pub fn normalize_order(notes: &HashMap<Uuid, Note>, order: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(order.len());
    let listed = order
        .iter()
        .filter(|uuid| notes.contains_key(uuid) && seen.insert(**uuid))
        .copied()
        .collect::<Vec<_>>();
    let mut missing = notes
        .values()
        .filter(|note| !seen.contains(&note.uuid))
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return listed;
    }
    missing.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.uuid.cmp(&b.uuid)));
    let mut normalized = missing.into_iter().map(|note| note.uuid).collect::<Vec<_>>();
    normalized.extend(listed);
    normalized
}

fn insert_checkbox(items: &mut Vec<Checkbox>, checkbox: Checkbox) {
    if items.iter().any(|item| item.uuid == checkbox.uuid) {
        return;
    }
    let anchor = checkbox.parent.and_then(|parent| {
        items
            .iter()
            .rposition(|item| item.uuid == parent || item.parent == Some(parent))
    });
    match anchor {
        Some(position) => items.insert(position + 1, checkbox),
        None => items.push(checkbox),
    }
}

/// Completing a parent completes its children. Un-completing a child
/// un-completes its parent. Completing every child leaves the parent as is.
fn set_checkbox_state(items: &mut [Checkbox], checkbox_uuid: Uuid, value: bool) {
    let Some(position) = items.iter().position(|item| item.uuid == checkbox_uuid) else {
        return;
    };
    items[position].is_completed = value;
    let parent = items[position].parent;

    for item in items.iter_mut() {
        if item.parent == Some(checkbox_uuid) {
            item.is_completed = value;
        }
    }

    if !value {
        if let Some(parent) = parent {
            if let Some(parent_item) = items.iter_mut().find(|item| item.uuid == parent) {
                parent_item.is_completed = false;
            }
        }
    }
}
