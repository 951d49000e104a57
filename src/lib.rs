pub mod api;
pub mod config;
pub mod copy;
pub mod db;
pub mod engine;
pub mod errors;
pub mod events;
pub mod labels;
pub mod logging;
pub mod media;
pub mod mirror;
pub mod models;
pub mod note_actions;
pub mod realtime;
pub mod reducer;
pub mod render;
pub mod session;
pub mod store;
pub mod sync;

pub use crate::api::{HttpNotesApi, Mutation, MutationKind, NotesApi};
pub use crate::config::EngineConfig;
pub use crate::engine::NotesEngine;
pub use crate::errors::{AppError, AppResult};
pub use crate::events::{EngineEvent, EventBus, Notification, NotificationKind, RealtimeStatus};
pub use crate::logging::init_tracing;
pub use crate::models::{ClientId, Label, Note, NoteColor, NoteState, UserRef};
pub use crate::note_actions::{NoteActions, NoteRequest};
pub use crate::reducer::{reduce, NoteAction};
pub use crate::render::{BatchRenderController, Filters, RenderSurface, Section};
pub use crate::session::ClientSession;
pub use crate::store::{NoteStore, StoreSnapshot};
