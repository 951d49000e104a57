use crate::errors::{AppError, AppResult};
use crate::models::{ClientId, Label, Note, NoteState};
use crate::reducer::NoteAction;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Keys that identify or stamp a document rather than describe the note.
/// `creator` is listed because pushes do not carry the full user snapshot.
const META_KEYS: [&str; 8] = [
    "_id",
    "uuid",
    "noteUUID",
    "userID",
    "__v",
    "creator",
    "lastModifiedBy",
    "settingsLastModifiedBy",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Note,
    Settings,
    Order,
    Labels,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentKey {
    #[serde(rename = "_id", default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub uuid: Option<Value>,
}

impl DocumentKey {
    /// Server ids arrive either as plain strings or as `{"$oid": ...}`.
    pub fn server_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(id) => Some(id.clone()),
            Value::Object(map) => map.get("$oid").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid.as_ref().and_then(parse_uuid)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Map<String, Value>,
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub operation_type: OperationType,
    #[serde(default)]
    pub document_key: DocumentKey,
    #[serde(default)]
    pub full_document: Option<Value>,
    #[serde(default)]
    pub update_description: Option<UpdateDescription>,
}

impl ChangeEvent {
    fn field(&self, key: &str) -> Option<&Value> {
        self.update_description
            .as_ref()
            .and_then(|description| description.updated_fields.get(key))
            .or_else(|| self.full_document.as_ref().and_then(|document| document.get(key)))
    }

    fn modified_by(&self) -> Option<&str> {
        let key = match self.kind {
            ChangeKind::Note => "lastModifiedBy",
            ChangeKind::Settings => "settingsLastModifiedBy",
            ChangeKind::Labels => "labelsLastModifiedBy",
            ChangeKind::Order => "orderLastModifiedBy",
            ChangeKind::Unknown => return None,
        };
        self.field(key).and_then(Value::as_str)
    }
}

/// Parses one stream message. The payload is normally an array of events;
/// a bare object is accepted as a batch of one. Malformed entries are
/// skipped.
pub fn parse_batch(payload: &str) -> AppResult<Vec<ChangeEvent>> {
    let raw = match serde_json::from_str::<Value>(payload).map_err(|error| AppError::Stream(error.to_string()))? {
        Value::Array(items) => items,
        other => vec![other],
    };
    let mut events = Vec::with_capacity(raw.len());
    for item in raw {
        match serde_json::from_value::<ChangeEvent>(item) {
            Ok(event) => events.push(event),
            Err(error) => tracing::warn!(error = %error, "skipping malformed change event"),
        }
    }
    Ok(events)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldSource {
    Note,
    Settings,
}

/// Field changes collected for one note within a batch. Each path remembers
/// which source wrote it: the same source may overwrite it, the other may
/// not.
#[derive(Debug, Default)]
struct PendingUpdate {
    changes: Vec<(String, Option<Value>)>,
    provenance: HashMap<String, FieldSource>,
}

impl PendingUpdate {
    fn absorb(&mut self, source: FieldSource, path: String, value: Option<Value>) {
        match self.provenance.get(&path) {
            Some(owner) if *owner != source => {}
            Some(_) => {
                if let Some(entry) = self.changes.iter_mut().find(|(existing, _)| *existing == path) {
                    entry.1 = value;
                }
            }
            None => {
                self.provenance.insert(path.clone(), source);
                self.changes.push((path, value));
            }
        }
    }

    fn apply_to(&self, base: &Note) -> Option<Note> {
        let mut document = serde_json::to_value(base).ok()?;
        for (path, value) in &self.changes {
            match value {
                Some(value) => set_path(&mut document, path, value.clone()),
                None => remove_path(&mut document, path),
            }
        }
        match serde_json::from_value::<Note>(document) {
            Ok(mut merged) => {
                merged.uuid = base.uuid;
                merged.creator = base.creator.clone();
                Some(merged)
            }
            Err(error) => {
                tracing::warn!(error = %error, note = %base.uuid, "discarding unmergeable note update");
                None
            }
        }
    }
}

/// What one batch does to local state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub actions: Vec<NoteAction>,
    pub labels: Option<Vec<Label>>,
    pub suppressed: usize,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.labels.is_none()
    }
}

/// Folds a batch of change events into reducer actions against the current
/// state. Changes stamped with `client_id` are echoes of this client's own
/// writes and are dropped, except deletes and order replacements.
pub fn reconcile(events: &[ChangeEvent], state: &NoteState, client_id: &ClientId) -> Reconciliation {
    let mut outcome = Reconciliation::default();
    let mut inserts: Vec<Note> = Vec::new();
    let mut pending: HashMap<Uuid, PendingUpdate> = HashMap::new();
    let mut pending_order: Vec<Uuid> = Vec::new();
    let mut deletes: Vec<Uuid> = Vec::new();
    let mut deletes_by_server_id: Vec<String> = Vec::new();
    let mut pushed_order: Option<Vec<Uuid>> = None;

    for event in events {
        let is_echo = event.modified_by() == Some(client_id.as_str());
        match (event.kind, event.operation_type) {
            (ChangeKind::Note, OperationType::Delete) => match event.document_key.uuid() {
                Some(uuid) => deletes.push(uuid),
                None => match event.document_key.server_id() {
                    Some(server_id) => deletes_by_server_id.push(server_id),
                    None => tracing::warn!("delete event without uuid or _id"),
                },
            },
            (ChangeKind::Order, OperationType::Delete) | (ChangeKind::Settings, OperationType::Delete) => {}
            (ChangeKind::Order, _) => match event.field("order").and_then(parse_uuid_list) {
                Some(order) => pushed_order = Some(order),
                None => tracing::warn!("order event without an order array"),
            },
            (ChangeKind::Labels, OperationType::Delete) => outcome.labels = Some(Vec::new()),
            (ChangeKind::Labels, _) if is_echo => outcome.suppressed += 1,
            (ChangeKind::Labels, _) => match event.field("labels") {
                Some(Value::Array(items)) => outcome.labels = Some(parse_labels(items)),
                _ => tracing::warn!("labels event without a labels array"),
            },
            (ChangeKind::Note, OperationType::Insert) if is_echo => outcome.suppressed += 1,
            (ChangeKind::Note, OperationType::Insert) => {
                let Some(document) = event.full_document.clone() else {
                    tracing::warn!("insert event without a document");
                    continue;
                };
                match serde_json::from_value::<Note>(document) {
                    Ok(note) if !state.contains(&note.uuid) && !inserts.iter().any(|n| n.uuid == note.uuid) => {
                        inserts.push(note)
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(error = %error, "skipping unreadable inserted note"),
                }
            }
            (ChangeKind::Note, _) | (ChangeKind::Settings, _) if is_echo => outcome.suppressed += 1,
            (ChangeKind::Note, OperationType::Update | OperationType::Replace)
            | (ChangeKind::Settings, OperationType::Insert | OperationType::Update | OperationType::Replace) => {
                let Some(uuid) = target_uuid(event, state) else {
                    tracing::debug!("update event for an unknown note");
                    continue;
                };
                let source = if event.kind == ChangeKind::Note {
                    FieldSource::Note
                } else {
                    FieldSource::Settings
                };
                let entry = pending.entry(uuid).or_insert_with(|| {
                    pending_order.push(uuid);
                    PendingUpdate::default()
                });
                for (path, value) in changed_fields(event) {
                    entry.absorb(source, path, value);
                }
            }
            _ => {}
        }
    }

    let mut updates = Vec::new();
    for uuid in pending_order {
        let Some(update) = pending.get(&uuid) else {
            continue;
        };
        if let Some(inserted) = inserts.iter_mut().find(|note| note.uuid == uuid) {
            if let Some(merged) = update.apply_to(inserted) {
                *inserted = merged;
            }
            continue;
        }
        let Some(local) = state.get(&uuid) else {
            continue;
        };
        if let Some(merged) = update.apply_to(local) {
            if merged != *local {
                updates.push(merged);
            }
        }
    }

    if !inserts.is_empty() {
        outcome.actions.push(NoteAction::AddNotes { notes: inserts });
    }
    if !updates.is_empty() {
        outcome.actions.push(NoteAction::UpdateNotes { notes: updates });
    }
    if let Some(order) = pushed_order.as_ref() {
        let membership = order.iter().collect::<HashSet<_>>();
        deletes.extend(state.order.iter().filter(|uuid| !membership.contains(uuid)).copied());
    }
    let mut seen = HashSet::new();
    deletes.retain(|uuid| seen.insert(*uuid));
    if !deletes.is_empty() {
        outcome.actions.push(NoteAction::BatchDeleteNotes { uuids: deletes });
    }
    for server_id in deletes_by_server_id {
        outcome.actions.push(NoteAction::DeleteById { server_id });
    }
    if let Some(order) = pushed_order {
        if order != *state.order {
            outcome.actions.push(NoteAction::SetOrder { order });
        }
    }
    outcome
}

fn target_uuid(event: &ChangeEvent, state: &NoteState) -> Option<Uuid> {
    if let Some(uuid) = event.document_key.uuid() {
        return Some(uuid);
    }
    let document_key = match event.kind {
        ChangeKind::Settings => "noteUUID",
        _ => "uuid",
    };
    if let Some(uuid) = event
        .full_document
        .as_ref()
        .and_then(|document| document.get(document_key))
        .and_then(parse_uuid)
    {
        return Some(uuid);
    }
    let server_id = event.document_key.server_id()?;
    state
        .notes
        .values()
        .find(|note| note.server_id.as_deref() == Some(server_id.as_str()))
        .map(|note| note.uuid)
}

/// Paths set (`Some`) or removed (`None`) by an event. Dotted paths such as
/// `checkboxes.1.isCompleted` are kept whole.
fn changed_fields(event: &ChangeEvent) -> Vec<(String, Option<Value>)> {
    let description = event
        .update_description
        .as_ref()
        .filter(|description| !description.updated_fields.is_empty() || !description.removed_fields.is_empty());
    let mut changes = Vec::new();
    match (description, event.full_document.as_ref()) {
        (Some(description), _) => {
            for (path, value) in &description.updated_fields {
                changes.push((path.clone(), Some(value.clone())));
            }
            for path in &description.removed_fields {
                changes.push((path.clone(), None));
            }
        }
        (None, Some(Value::Object(document))) => {
            for (key, value) in document {
                changes.push((key.clone(), Some(value.clone())));
            }
        }
        _ => {}
    }
    changes.retain(|(path, _)| {
        let root = path.split('.').next().unwrap_or(path);
        !META_KEYS.contains(&root)
    });
    changes
}

fn set_path(document: &mut Value, path: &str, value: Value) {
    let segments = path.split('.').collect::<Vec<_>>();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = document;
    for segment in parents {
        let next = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|index| items.get_mut(index)) {
                Some(item) => item,
                None => return,
            },
            _ => return,
        };
        current = next;
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < items.len() {
                    items[index] = value;
                } else if index == items.len() {
                    items.push(value);
                }
            }
        }
        _ => {}
    }
}

fn remove_path(document: &mut Value, path: &str) {
    let segments = path.split('.').collect::<Vec<_>>();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = document;
    for segment in parents {
        let next = match current {
            Value::Object(map) => map.get_mut(*segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get_mut(index)),
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Value::Object(map) = current {
        map.remove(*last);
    }
}

fn parse_uuid(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|raw| Uuid::parse_str(raw).ok())
}

fn parse_uuid_list(value: &Value) -> Option<Vec<Uuid>> {
    let items = value.as_array()?;
    Some(items.iter().filter_map(parse_uuid).collect())
}

fn parse_labels(items: &[Value]) -> Vec<Label> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<Label>(item.clone()) {
            Ok(label) => Some(label),
            Err(error) => {
                tracing::warn!(error = %error, "skipping unreadable label");
                None
            }
        })
        .collect()
}
