use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of one running client (one tab). Every outgoing mutation and
/// every server record carries the id of the client that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum NoteColor {
    #[default]
    Default,
    Coral,
    Peach,
    Sand,
    Mint,
    Sage,
    Fog,
    Storm,
    Dusk,
    Blossom,
    Clay,
    Chalk,
}

impl NoteColor {
    pub const ALL: [NoteColor; 12] = [
        Self::Default,
        Self::Coral,
        Self::Peach,
        Self::Sand,
        Self::Mint,
        Self::Sage,
        Self::Fog,
        Self::Storm,
        Self::Dusk,
        Self::Blossom,
        Self::Clay,
        Self::Chalk,
    ];

    /// Unknown names fall back to `Default`.
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|color| color.as_str() == name)
            .unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Coral => "Coral",
            Self::Peach => "Peach",
            Self::Sand => "Sand",
            Self::Mint => "Mint",
            Self::Sage => "Sage",
            Self::Fog => "Fog",
            Self::Storm => "Storm",
            Self::Dusk => "Dusk",
            Self::Blossom => "Blossom",
            Self::Clay => "Clay",
            Self::Chalk => "Chalk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum NoteBackground {
    #[default]
    DefaultBg,
    Groceries,
    Food,
    Music,
    Recipes,
    Notes,
    Places,
    Travel,
    Video,
    Celebration,
}

impl NoteBackground {
    pub const ALL: [NoteBackground; 10] = [
        Self::DefaultBg,
        Self::Groceries,
        Self::Food,
        Self::Music,
        Self::Recipes,
        Self::Notes,
        Self::Places,
        Self::Travel,
        Self::Video,
        Self::Celebration,
    ];

    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|background| background.as_str() == name)
            .unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DefaultBg => "DefaultBg",
            Self::Groceries => "Groceries",
            Self::Food => "Food",
            Self::Music => "Music",
            Self::Recipes => "Recipes",
            Self::Notes => "Notes",
            Self::Places => "Places",
            Self::Travel => "Travel",
            Self::Video => "Video",
            Self::Celebration => "Celebration",
        }
    }
}

impl<'de> Deserialize<'de> for NoteColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

impl<'de> Deserialize<'de> for NoteBackground {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// Snapshot of a user as embedded in note documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    #[serde(rename = "_id")]
    pub id: String,
    pub display_name: String,
    pub username: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteImage {
    pub uuid: Uuid,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkbox {
    pub uuid: Uuid,
    pub content: String,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub parent: Option<Uuid>,
}

impl Checkbox {
    pub fn new(content: impl Into<String>, parent: Option<Uuid>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            content: content.into(),
            is_completed: false,
            parent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoteLocation {
    Active,
    Pinned,
    Archived,
    Trashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteFlags {
    pub is_pinned: bool,
    pub is_archived: bool,
    pub is_trash: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub uuid: Uuid,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub color: NoteColor,
    #[serde(default)]
    pub background: NoteBackground,
    #[serde(default)]
    pub labels: BTreeSet<Uuid>,
    #[serde(default)]
    pub images: Vec<NoteImage>,
    #[serde(default)]
    pub checkboxes: Vec<Checkbox>,
    #[serde(default = "default_true")]
    pub checkbox_visibility: bool,
    #[serde(default)]
    pub expand_completed: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub is_trash: bool,
    #[serde(default)]
    pub creator: Option<UserRef>,
    #[serde(default)]
    pub collaborators: Vec<UserRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<ClientId>,
}

fn default_true() -> bool {
    true
}

impl Note {
    pub fn new(uuid: Uuid, creator: Option<UserRef>) -> Self {
        let now = Utc::now();
        Self {
            uuid,
            server_id: None,
            title: String::new(),
            content: String::new(),
            color: NoteColor::Default,
            background: NoteBackground::DefaultBg,
            labels: BTreeSet::new(),
            images: Vec::new(),
            checkboxes: Vec::new(),
            checkbox_visibility: true,
            expand_completed: false,
            is_pinned: false,
            is_archived: false,
            is_trash: false,
            creator,
            collaborators: Vec::new(),
            created_at: now,
            updated_at: now,
            last_modified_by: None,
        }
    }

    pub fn flags(&self) -> NoteFlags {
        NoteFlags {
            is_pinned: self.is_pinned,
            is_archived: self.is_archived,
            is_trash: self.is_trash,
        }
    }

    pub fn set_flags(&mut self, flags: NoteFlags) {
        self.is_pinned = flags.is_pinned;
        self.is_archived = flags.is_archived;
        self.is_trash = flags.is_trash;
    }

    pub fn location(&self) -> NoteLocation {
        if self.is_trash {
            NoteLocation::Trashed
        } else if self.is_archived {
            NoteLocation::Archived
        } else if self.is_pinned {
            NoteLocation::Pinned
        } else {
            NoteLocation::Active
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.trim().is_empty()
            && self.content.trim().is_empty()
            && self.images.is_empty()
            && self.checkboxes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub uuid: Uuid,
    pub label: String,
    #[serde(default)]
    pub color: NoteColor,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub pin_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Label {
    pub fn new(label: impl Into<String>, color: NoteColor) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            label: label.into(),
            color,
            is_pinned: false,
            pin_date: None,
            image: None,
            created_at: Utc::now(),
        }
    }
}

/// In-memory notes and their display order. Both collections are shared
/// immutable versions: every transition that changes one of them swaps in a
/// new `Arc`, so a clone of the state is a consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteState {
    pub notes: Arc<HashMap<Uuid, Note>>,
    pub order: Arc<Vec<Uuid>>,
}

impl NoteState {
    pub fn new(notes: HashMap<Uuid, Note>, order: Vec<Uuid>) -> Self {
        Self {
            notes: Arc::new(notes),
            order: Arc::new(order),
        }
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&Note> {
        self.notes.get(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.notes.contains_key(uuid)
    }

    pub fn index_of(&self, uuid: &Uuid) -> Option<usize> {
        self.order.iter().position(|current| current == uuid)
    }

    pub fn ordered_notes(&self) -> impl Iterator<Item = &Note> {
        self.order.iter().filter_map(|uuid| self.notes.get(uuid))
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchNotesResponse {
    pub data: Vec<Note>,
    pub order: Vec<Uuid>,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::{Note, NoteBackground, NoteColor};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn unknown_palette_names_fall_back_to_defaults() {
        let mut value = serde_json::to_value(Note::new(Uuid::new_v4(), None)).expect("serialize");
        value["color"] = json!("Chartreuse");
        value["background"] = json!("Beach");
        let note: Note = serde_json::from_value(value).expect("deserialize");
        assert_eq!(note.color, NoteColor::Default);
        assert_eq!(note.background, NoteBackground::DefaultBg);
    }

    #[test]
    fn known_palette_names_round_trip() {
        assert_eq!(serde_json::to_value(NoteColor::Sage).expect("serialize"), json!("Sage"));
        let color: NoteColor = serde_json::from_value(json!("Sage")).expect("deserialize");
        assert_eq!(color, NoteColor::Sage);
        let background: NoteBackground = serde_json::from_value(json!("Travel")).expect("deserialize");
        assert_eq!(background, NoteBackground::Travel);
    }
}
