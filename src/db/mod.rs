use crate::errors::{AppError, AppResult};
use crate::models::{Label, Note};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Everything the cache holds for one user, as read at cold start.
#[derive(Debug, Clone, Default)]
pub struct CachedData {
    pub notes: Vec<Note>,
    pub order: Vec<Uuid>,
    pub labels: Vec<Label>,
}

impl CachedData {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.order.is_empty() && self.labels.is_empty()
    }
}

/// Per-user durable shadow of the in-memory note state: notes by UUID,
/// labels by UUID and a single order record.
#[derive(Debug)]
pub struct LocalCache {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl LocalCache {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Cache(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn open_for_user(cache_dir: &Path, user_id: &str) -> AppResult<Self> {
        let file_name = format!("notes-{}.sqlite", sanitize_component(user_id));
        Self::new(&cache_dir.join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("cache mutex poisoned".to_string()))
    }

    /// Clears all three tables and writes the given data in one transaction.
    pub fn replace_all(&self, notes: &[Note], order: &[Uuid], labels: &[Label]) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM notes", [])?;
        tx.execute("DELETE FROM labels", [])?;
        tx.execute("DELETE FROM note_order", [])?;
        for note in notes {
            tx.execute(
                "INSERT INTO notes (uuid, doc_json, written_at) VALUES (?1, ?2, ?3)",
                params![note.uuid.to_string(), serde_json::to_string(note)?, now],
            )?;
        }
        for label in labels {
            tx.execute(
                "INSERT INTO labels (uuid, doc_json, written_at) VALUES (?1, ?2, ?3)",
                params![label.uuid.to_string(), serde_json::to_string(label)?, now],
            )?;
        }
        tx.execute(
            "INSERT INTO note_order (id, order_json, written_at) VALUES (1, ?1, ?2)",
            params![serde_json::to_string(order)?, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replaces notes and order but leaves labels alone.
    pub fn replace_notes(&self, notes: &[Note], order: &[Uuid]) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM notes", [])?;
        for note in notes {
            tx.execute(
                "INSERT INTO notes (uuid, doc_json, written_at) VALUES (?1, ?2, ?3)",
                params![note.uuid.to_string(), serde_json::to_string(note)?, now],
            )?;
        }
        tx.execute(
            "INSERT INTO note_order (id, order_json, written_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
               order_json = excluded.order_json,
               written_at = excluded.written_at",
            params![serde_json::to_string(order)?, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self) -> AppResult<CachedData> {
        let conn = self.lock()?;
        let notes = read_documents::<Note>(&conn, "SELECT doc_json FROM notes")?;
        let labels = read_documents::<Label>(&conn, "SELECT doc_json FROM labels")?;
        let order_json: Option<String> = conn
            .query_row("SELECT order_json FROM note_order WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        let order = match order_json {
            Some(raw) => serde_json::from_str::<Vec<Uuid>>(&raw).unwrap_or_else(|error| {
                tracing::warn!(error = %error, "discarding unreadable cached order");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(CachedData { notes, order, labels })
    }

    pub fn get_note(&self, uuid: &Uuid) -> AppResult<Option<Note>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT doc_json FROM notes WHERE uuid = ?1",
                [uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(AppError::from))
            .transpose()
    }

    pub fn put_note(&self, note: &Note) -> AppResult<()> {
        self.put_notes(std::slice::from_ref(note))
    }

    pub fn put_notes(&self, notes: &[Note]) -> AppResult<()> {
        if notes.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for note in notes {
            tx.execute(
                "INSERT INTO notes (uuid, doc_json, written_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(uuid) DO UPDATE SET
                   doc_json = excluded.doc_json,
                   written_at = excluded.written_at",
                params![note.uuid.to_string(), serde_json::to_string(note)?, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_notes(&self, uuids: &[Uuid]) -> AppResult<usize> {
        if uuids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut affected = 0usize;
        for uuid in uuids {
            affected += tx.execute("DELETE FROM notes WHERE uuid = ?1", [uuid.to_string()])?;
        }
        tx.commit()?;
        Ok(affected)
    }

    pub fn put_order(&self, order: &[Uuid]) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO note_order (id, order_json, written_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
               order_json = excluded.order_json,
               written_at = excluded.written_at",
            params![serde_json::to_string(order)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn replace_labels(&self, labels: &[Label]) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM labels", [])?;
        for label in labels {
            tx.execute(
                "INSERT INTO labels (uuid, doc_json, written_at) VALUES (?1, ?2, ?3)",
                params![label.uuid.to_string(), serde_json::to_string(label)?, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn put_label(&self, label: &Label) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO labels (uuid, doc_json, written_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(uuid) DO UPDATE SET
               doc_json = excluded.doc_json,
               written_at = excluded.written_at",
            params![
                label.uuid.to_string(),
                serde_json::to_string(label)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn delete_label(&self, uuid: &Uuid) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM labels WHERE uuid = ?1", [uuid.to_string()])?;
        Ok(changed > 0)
    }

    pub fn clear(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM notes; DELETE FROM labels; DELETE FROM note_order;")?;
        Ok(())
    }
}

fn read_documents<T: DeserializeOwned>(conn: &Connection, sql: &str) -> AppResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut documents = Vec::new();
    for row in rows {
        let raw = row?;
        match serde_json::from_str::<T>(&raw) {
            Ok(document) => documents.push(document),
            Err(error) => tracing::warn!(error = %error, "skipping unreadable cached document"),
        }
    }
    Ok(documents)
}

fn sanitize_component(input: &str) -> String {
    let cleaned = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}
