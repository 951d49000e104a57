use crate::errors::{AppError, AppResult};
use crate::models::{Label, NoteColor};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const MAX_LABEL_LENGTH: usize = 50;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

pub type LabelState = Arc<HashMap<Uuid, Label>>;

#[derive(Debug, Clone, PartialEq)]
pub enum LabelAction {
    SetLabels { labels: Vec<Label> },
    CreateLabel { label: Label },
    RenameLabel { uuid: Uuid, label: String },
    UpdateLabelColor { uuid: Uuid, color: NoteColor },
    PinLabel { uuid: Uuid, value: bool, pin_date: Option<DateTime<Utc>> },
    UpdateLabelImage { uuid: Uuid, image: Option<String> },
    DeleteLabel { uuid: Uuid },
}

pub fn reduce_labels(state: &LabelState, action: &LabelAction) -> LabelState {
    match action {
        LabelAction::SetLabels { labels } => {
            Arc::new(labels.iter().map(|label| (label.uuid, label.clone())).collect())
        }
        LabelAction::CreateLabel { label } => {
            if state.contains_key(&label.uuid) {
                return Arc::clone(state);
            }
            let mut next = (**state).clone();
            next.insert(label.uuid, label.clone());
            Arc::new(next)
        }
        LabelAction::RenameLabel { uuid, label } => update_label(state, *uuid, |entry| entry.label = label.clone()),
        LabelAction::UpdateLabelColor { uuid, color } => update_label(state, *uuid, |entry| entry.color = *color),
        LabelAction::PinLabel { uuid, value, pin_date } => update_label(state, *uuid, |entry| {
            entry.is_pinned = *value;
            entry.pin_date = if *value { *pin_date } else { None };
        }),
        LabelAction::UpdateLabelImage { uuid, image } => {
            update_label(state, *uuid, |entry| entry.image = image.clone())
        }
        LabelAction::DeleteLabel { uuid } => {
            if !state.contains_key(uuid) {
                return Arc::clone(state);
            }
            let mut next = (**state).clone();
            next.remove(uuid);
            Arc::new(next)
        }
    }
}

fn update_label(state: &LabelState, uuid: Uuid, apply: impl FnOnce(&mut Label)) -> LabelState {
    if !state.contains_key(&uuid) {
        return Arc::clone(state);
    }
    let mut next = (**state).clone();
    if let Some(label) = next.get_mut(&uuid) {
        apply(label);
    }
    Arc::new(next)
}

/// Collapses whitespace and checks length and case-insensitive uniqueness.
/// `current` is the label being renamed, which may keep its own name.
pub fn validate_label_name(raw: &str, labels: &LabelState, current: Option<Uuid>) -> AppResult<String> {
    let name = normalize_label_name(raw);
    if name.is_empty() {
        return Err(AppError::Validation("Label name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_LABEL_LENGTH {
        return Err(AppError::Validation(format!(
            "Label name cannot exceed {} characters",
            MAX_LABEL_LENGTH
        )));
    }
    if find_by_name(labels, &name).is_some_and(|existing| Some(existing.uuid) != current) {
        return Err(AppError::Validation(format!("Label \"{}\" already exists", name)));
    }
    Ok(name)
}

pub fn normalize_label_name(raw: &str) -> String {
    WHITESPACE_RUN.replace_all(raw.trim(), " ").to_string()
}

/// Case-insensitive lookup that treats whitespace runs as single spaces.
pub fn find_by_name<'a>(labels: &'a LabelState, name: &str) -> Option<&'a Label> {
    let needle = normalize_label_name(name).to_lowercase();
    labels
        .values()
        .find(|label| normalize_label_name(&label.label).to_lowercase() == needle)
}

/// Labels in display order: pinned first by pin date, then alphabetical.
pub fn sorted_labels(labels: &LabelState) -> Vec<Label> {
    let mut sorted = labels.values().cloned().collect::<Vec<_>>();
    sorted.sort_by(|a, b| {
        b.is_pinned
            .cmp(&a.is_pinned)
            .then_with(|| b.pin_date.cmp(&a.pin_date))
            .then_with(|| a.label.to_lowercase().cmp(&b.label.to_lowercase()))
    });
    sorted
}
