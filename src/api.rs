use crate::config::EngineConfig;
use crate::errors::{AppError, AppResult};
use crate::media::ImageUpload;
use crate::models::{ClientId, FetchNotesResponse, Label, Note, UploadedImage};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use uuid::Uuid;

pub type ByteStream = Pin<Box<dyn Stream<Item = AppResult<Vec<u8>>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    CreateNotes,
    UpdateNotes,
    DeleteNotes,
    EmptyTrash,
    SetOrder,
    CreateLabel,
    UpdateLabel,
    DeleteLabel,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateNotes => "CREATE_NOTES",
            Self::UpdateNotes => "UPDATE_NOTES",
            Self::DeleteNotes => "DELETE_NOTES",
            Self::EmptyTrash => "EMPTY_TRASH",
            Self::SetOrder => "SET_ORDER",
            Self::CreateLabel => "CREATE_LABEL",
            Self::UpdateLabel => "UPDATE_LABEL",
            Self::DeleteLabel => "DELETE_LABEL",
        }
    }
}

/// One request to the mutation endpoint. `clientID` lets the realtime
/// channel recognise the echo of this write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub value: Value,
    #[serde(rename = "noteUUIDs")]
    pub note_uuids: Vec<Uuid>,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
}

impl Mutation {
    pub fn new(kind: MutationKind, value: Value, note_uuids: Vec<Uuid>, client_id: &ClientId) -> Self {
        Self {
            kind,
            value,
            note_uuids,
            client_id: client_id.clone(),
        }
    }

    pub fn label(kind: MutationKind, label: &Label, client_id: &ClientId) -> AppResult<Self> {
        Ok(Self::new(kind, serde_json::to_value(label)?, Vec::new(), client_id))
    }
}

/// Note fields a mutation can carry. Each maps to one or more wire keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteField {
    Title,
    Content,
    Color,
    Background,
    Labels,
    Images,
    Checkboxes,
    CheckboxVisibility,
    ExpandCompleted,
    Flags,
    Collaborators,
}

impl NoteField {
    fn wire_keys(self) -> &'static [&'static str] {
        match self {
            Self::Title => &["title"],
            Self::Content => &["content"],
            Self::Color => &["color"],
            Self::Background => &["background"],
            Self::Labels => &["labels"],
            Self::Images => &["images"],
            Self::Checkboxes => &["checkboxes"],
            Self::CheckboxVisibility => &["checkboxVisibility"],
            Self::ExpandCompleted => &["expandCompleted"],
            Self::Flags => &["isPinned", "isArchived", "isTrash"],
            Self::Collaborators => &["collaborators"],
        }
    }
}

/// Serializes the named fields of a note into a partial document.
pub fn note_patch(note: &Note, fields: &[NoteField]) -> AppResult<Value> {
    let Value::Object(document) = serde_json::to_value(note)? else {
        return Err(AppError::Internal("note did not serialize to an object".to_string()));
    };
    let mut patch = Map::new();
    for field in fields {
        for key in field.wire_keys() {
            if let Some(value) = document.get(*key) {
                patch.insert((*key).to_string(), value.clone());
            }
        }
    }
    Ok(Value::Object(patch))
}

/// Server collaborator. Every call either succeeds or reports an error the
/// orchestrator turns into a notification.
#[async_trait]
pub trait NotesApi: Send + Sync {
    async fn fetch_notes(&self) -> AppResult<FetchNotesResponse>;

    async fn send(&self, mutation: &Mutation) -> AppResult<()>;

    /// Persists duplicated notes and returns the server's finalized copies.
    async fn copy_notes(&self, notes: &[Note], client_id: &ClientId) -> AppResult<Vec<Note>>;

    async fn upload_image(&self, note_uuid: Uuid, upload: &ImageUpload) -> AppResult<UploadedImage>;

    /// Opens the change stream for this client as raw bytes.
    async fn open_stream(&self, client_id: &ClientId) -> AppResult<ByteStream>;
}

#[derive(Debug, Clone)]
pub struct HttpNotesApi {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    base_url: String,
}

impl HttpNotesApi {
    pub fn new(config: &EngineConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            stream_client,
            base_url: config.api_base().to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Serialize)]
struct CopyRequest<'a> {
    notes: &'a [Note],
    #[serde(rename = "clientID")]
    client_id: &'a ClientId,
}

#[async_trait]
impl NotesApi for HttpNotesApi {
    async fn fetch_notes(&self) -> AppResult<FetchNotesResponse> {
        let response = self.client.get(self.url("/api/notes")).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<FetchNotesResponse>().await?)
    }

    async fn send(&self, mutation: &Mutation) -> AppResult<()> {
        let response = self
            .client
            .post(self.url("/api/notes/mutate"))
            .json(mutation)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn copy_notes(&self, notes: &[Note], client_id: &ClientId) -> AppResult<Vec<Note>> {
        let response = self
            .client
            .post(self.url("/api/notes/copy"))
            .json(&CopyRequest { notes, client_id })
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<Vec<Note>>().await?)
    }

    async fn upload_image(&self, note_uuid: Uuid, upload: &ImageUpload) -> AppResult<UploadedImage> {
        let response = self
            .client
            .post(self.url("/api/images"))
            .query(&[
                ("noteUUID", note_uuid.to_string()),
                ("imageUUID", upload.uuid.to_string()),
            ])
            .header(reqwest::header::CONTENT_TYPE, upload.content_type.as_str())
            .body(upload.bytes.clone())
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<UploadedImage>().await?)
    }

    async fn open_stream(&self, client_id: &ClientId) -> AppResult<ByteStream> {
        let response = self
            .stream_client
            .get(self.url("/api/stream"))
            .query(&[("clientID", client_id.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|error| AppError::Stream(error.to_string()))?;
        let response = ensure_success(response).await?;
        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|error| AppError::Stream(error.to_string()))
        });
        Ok(Box::pin(stream))
    }
}

async fn ensure_success(response: reqwest::Response) -> AppResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(AppError::NotFound(format!("{}: {}", status, body)));
    }
    Err(AppError::Network(format!("{}: {}", status, body)))
}

#[cfg(test)]
mod tests {
    use super::{note_patch, Mutation, MutationKind, NoteField};
    use crate::models::{ClientId, Note, NoteColor};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn mutation_uses_wire_field_names() {
        let uuid = Uuid::new_v4();
        let mutation = Mutation::new(
            MutationKind::UpdateNotes,
            json!({ "isTrash": true }),
            vec![uuid],
            &ClientId::new("tab-1"),
        );
        let value = serde_json::to_value(&mutation).expect("serialize");
        assert_eq!(value["type"], "UPDATE_NOTES");
        assert_eq!(value["clientID"], "tab-1");
        assert_eq!(value["noteUUIDs"][0], uuid.to_string());
    }

    #[test]
    fn patch_contains_only_requested_fields() {
        let mut note = Note::new(Uuid::new_v4(), None);
        note.color = NoteColor::Mint;
        note.is_archived = true;
        let patch = note_patch(&note, &[NoteField::Color, NoteField::Flags]).expect("patch");
        assert_eq!(
            patch,
            json!({ "color": "Mint", "isPinned": false, "isArchived": true, "isTrash": false })
        );
    }
}
