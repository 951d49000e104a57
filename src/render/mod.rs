pub mod masonry;

use crate::config::EngineConfig;
use crate::errors::{AppError, AppResult};
use crate::events::EngineEvent;
use crate::models::{Note, NoteColor, NoteState};
use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Section {
    #[default]
    Notes,
    Archive,
    Trash,
    Label(Uuid),
}

impl Section {
    pub fn includes(&self, note: &Note) -> bool {
        match self {
            Section::Notes => !note.is_archived && !note.is_trash,
            Section::Archive => note.is_archived && !note.is_trash,
            Section::Trash => note.is_trash,
            Section::Label(label) => !note.is_trash && note.labels.contains(label),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub color: Option<NoteColor>,
    pub has_images: bool,
    pub query: String,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.color.is_none() && !self.has_images && self.query.trim().is_empty()
    }

    pub fn matches(&self, note: &Note) -> bool {
        if let Some(color) = self.color {
            if note.color != color {
                return false;
            }
        }
        if self.has_images && note.images.is_empty() {
            return false;
        }
        let query = self.query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        note.title.to_lowercase().contains(&query)
            || note.content.to_lowercase().contains(&query)
            || note
                .checkboxes
                .iter()
                .any(|checkbox| checkbox.content.to_lowercase().contains(&query))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSettings {
    pub first_batch_size: usize,
    pub batch_size: usize,
    pub safety_margin_px: f64,
    pub scroll_threshold_px: f64,
}

impl BatchSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            first_batch_size: config.first_batch_size.max(1),
            batch_size: config.batch_size.max(1),
            safety_margin_px: config.render_safety_margin_px,
            scroll_threshold_px: config.scroll_threshold_px,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Decides which notes of the current view are mounted. The visible set is
/// always a prefix of the view's matching notes and grows in batches; any
/// change of section, filters or an explicit reload starts over from empty
/// under a new layout version so continuations of the old sequence stop.
#[derive(Debug)]
pub struct BatchRenderController {
    settings: BatchSettings,
    section: Section,
    filters: Filters,
    layout_version: u64,
    matching: Vec<Uuid>,
    visible: usize,
    viewport_height: f64,
}

impl BatchRenderController {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            section: Section::default(),
            filters: Filters::default(),
            layout_version: 0,
            matching: Vec::new(),
            visible: 0,
            viewport_height: 0.0,
        }
    }

    pub fn layout_version(&self) -> u64 {
        self.layout_version
    }

    pub fn section(&self) -> Section {
        self.section
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn visible(&self) -> &[Uuid] {
        &self.matching[..self.visible]
    }

    pub fn matching_count(&self) -> usize {
        self.matching.len()
    }

    pub fn has_more(&self) -> bool {
        self.visible < self.matching.len()
    }

    pub fn set_viewport_height(&mut self, height: f64) {
        self.viewport_height = height.max(0.0);
    }

    /// Switches section. A label view whose target label changes counts as
    /// a section change.
    pub fn set_section(&mut self, section: Section, state: &NoteState) -> bool {
        if self.section == section {
            return false;
        }
        self.section = section;
        self.reset(state);
        true
    }

    pub fn set_filters(&mut self, filters: Filters, state: &NoteState) -> bool {
        if self.filters == filters {
            return false;
        }
        self.filters = filters;
        self.reset(state);
        true
    }

    /// Starts over from an empty visible set.
    pub fn reset(&mut self, state: &NoteState) {
        self.layout_version += 1;
        self.matching = self.compute_matching(state);
        self.visible = 0;
        tracing::debug!(
            version = self.layout_version,
            matching = self.matching.len(),
            "render sequence reset"
        );
    }

    /// Recomputes the view after a state change, keeping the number of
    /// mounted notes.
    pub fn refresh(&mut self, state: &NoteState) {
        self.matching = self.compute_matching(state);
        self.visible = self.visible.min(self.matching.len());
    }

    pub fn handle_event(&mut self, event: &EngineEvent, state: &NoteState) {
        match event {
            EngineEvent::NotesChanged { .. } | EngineEvent::LabelsChanged { .. } => self.refresh(state),
            EngineEvent::LayoutReload => self.reset(state),
            _ => {}
        }
    }

    /// Grows the visible set by one batch if `version` is still current and
    /// the rendered content does not already overfill the viewport. Returns
    /// the newly visible notes.
    pub fn next_batch(&mut self, version: u64, content_height: f64) -> Option<Vec<Uuid>> {
        if version != self.layout_version {
            return None;
        }
        if self.visible > 0 && content_height > self.viewport_height + self.settings.safety_margin_px {
            return None;
        }
        let size = if self.visible == 0 {
            self.settings.first_batch_size
        } else {
            self.settings.batch_size
        };
        self.extend(size)
    }

    pub fn on_scroll(&mut self, scroll_top: f64, viewport_height: f64, content_height: f64) -> Option<Vec<Uuid>> {
        self.set_viewport_height(viewport_height);
        let remaining = content_height - (scroll_top + viewport_height);
        if remaining > self.settings.scroll_threshold_px {
            return None;
        }
        self.extend(self.settings.batch_size)
    }

    pub fn on_resize(&mut self, viewport_height: f64, content_height: f64) -> Option<Vec<Uuid>> {
        self.set_viewport_height(viewport_height);
        if content_height > self.viewport_height + self.settings.safety_margin_px {
            return None;
        }
        self.extend(self.settings.batch_size)
    }

    fn extend(&mut self, size: usize) -> Option<Vec<Uuid>> {
        if !self.has_more() {
            return None;
        }
        let end = (self.visible + size).min(self.matching.len());
        let added = self.matching[self.visible..end].to_vec();
        self.visible = end;
        Some(added)
    }

    fn compute_matching(&self, state: &NoteState) -> Vec<Uuid> {
        state
            .ordered_notes()
            .filter(|note| self.section.includes(note) && self.filters.matches(note))
            .map(|note| note.uuid)
            .collect()
    }
}

/// Where batches are mounted. `commit` returns once the batch is on screen
/// and the surface is idle.
#[async_trait]
pub trait RenderSurface: Send {
    async fn commit(&mut self, visible: &[Uuid]);
    fn viewport_height(&self) -> f64;
    fn content_height(&self) -> f64;
}

/// Drives one batch sequence to completion or until it goes stale. Returns
/// the number of batches committed.
pub async fn run_batches(controller: &Mutex<BatchRenderController>, surface: &mut dyn RenderSurface) -> AppResult<usize> {
    let version = {
        let mut controller = lock(controller)?;
        controller.set_viewport_height(surface.viewport_height());
        controller.layout_version()
    };
    let mut committed = 0;
    loop {
        let visible = {
            let mut controller = lock(controller)?;
            if controller.next_batch(version, surface.content_height()).is_none() {
                break;
            }
            controller.visible().to_vec()
        };
        surface.commit(&visible).await;
        committed += 1;
    }
    Ok(committed)
}

fn lock(controller: &Mutex<BatchRenderController>) -> AppResult<std::sync::MutexGuard<'_, BatchRenderController>> {
    controller
        .lock()
        .map_err(|_| AppError::Internal("render controller mutex poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::{run_batches, BatchRenderController, BatchSettings, Filters, RenderSurface, Section};
    use crate::models::{Checkbox, Note, NoteColor, NoteState};
    use crate::reducer::{reduce, NoteAction};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn state_of(count: usize) -> NoteState {
        let notes = (0..count).map(|_| Note::new(Uuid::new_v4(), None)).collect::<Vec<_>>();
        let order = notes.iter().map(|note| note.uuid).collect();
        reduce(&NoteState::default(), &NoteAction::SetInitialData { notes, order })
    }

    struct FixedSurface {
        card_height: f64,
        viewport: f64,
        mounted: usize,
        commits: Vec<usize>,
        on_commit: Option<Box<dyn FnMut() + Send>>,
    }

    impl FixedSurface {
        fn new(card_height: f64, viewport: f64) -> Self {
            Self {
                card_height,
                viewport,
                mounted: 0,
                commits: Vec::new(),
                on_commit: None,
            }
        }
    }

    #[async_trait]
    impl RenderSurface for FixedSurface {
        async fn commit(&mut self, visible: &[Uuid]) {
            self.mounted = visible.len();
            self.commits.push(visible.len());
            if let Some(hook) = self.on_commit.as_mut() {
                hook();
            }
            tokio::task::yield_now().await;
        }

        fn viewport_height(&self) -> f64 {
            self.viewport
        }

        fn content_height(&self) -> f64 {
            self.mounted as f64 * self.card_height
        }
    }

    #[tokio::test]
    async fn grows_until_the_viewport_is_overfilled() {
        let state = state_of(40);
        let mut controller = BatchRenderController::new(BatchSettings::default());
        controller.reset(&state);
        let controller = Mutex::new(controller);
        let mut surface = FixedSurface::new(100.0, 1000.0);

        let batches = run_batches(&controller, &mut surface).await.expect("run");
        assert_eq!(surface.commits, vec![10, 15]);
        assert_eq!(batches, 2);
        assert!(controller.lock().expect("lock").has_more());
    }

    #[tokio::test]
    async fn stale_sequences_stop_after_a_reset() {
        let state = state_of(40);
        let mut controller = BatchRenderController::new(BatchSettings::default());
        controller.reset(&state);
        let controller = Arc::new(Mutex::new(controller));
        let mut surface = FixedSurface::new(1.0, 1000.0);
        let shared = controller.clone();
        let reset_state = state.clone();
        surface.on_commit = Some(Box::new(move || {
            shared.lock().expect("lock").reset(&reset_state);
        }));

        let batches = run_batches(&controller, &mut surface).await.expect("run");
        assert_eq!(batches, 1);
        assert!(controller.lock().expect("lock").visible().is_empty());
    }

    #[test]
    fn scroll_near_bottom_and_resize_extend() {
        let state = state_of(30);
        let mut controller = BatchRenderController::new(BatchSettings::default());
        controller.reset(&state);
        let version = controller.layout_version();
        assert_eq!(controller.next_batch(version, 0.0).map(|batch| batch.len()), Some(10));

        assert!(controller.on_scroll(0.0, 800.0, 3000.0).is_none());
        assert_eq!(controller.on_scroll(1700.0, 800.0, 3000.0).map(|batch| batch.len()), Some(5));
        assert_eq!(controller.on_resize(2000.0, 1500.0).map(|batch| batch.len()), Some(5));
        assert!(controller.on_resize(500.0, 1500.0).is_none());
        assert_eq!(controller.visible().len(), 20);
    }

    #[test]
    fn section_and_filter_changes_restart_from_empty() {
        let mut state = state_of(3);
        let ids = state.order.to_vec();
        let mut listed = state.get(&ids[1]).expect("note").clone();
        listed.title = "Groceries".to_string();
        listed.color = NoteColor::Mint;
        listed.checkboxes = vec![Checkbox::new("Oat milk", None)];
        state = reduce(&state, &NoteAction::UpdateNotes { notes: vec![listed] });
        state = reduce(&state, &NoteAction::ArchiveNote { uuid: ids[2] });

        let mut controller = BatchRenderController::new(BatchSettings::default());
        controller.reset(&state);
        let first_version = controller.layout_version();
        let _ = controller.next_batch(first_version, 0.0);
        assert_eq!(controller.visible(), &ids[..2]);

        assert!(controller.set_section(Section::Archive, &state));
        assert!(controller.visible().is_empty());
        assert!(controller.next_batch(first_version, 0.0).is_none());
        let _ = controller.next_batch(controller.layout_version(), 0.0);
        assert_eq!(controller.visible(), &ids[2..]);

        assert!(controller.set_section(Section::Notes, &state));
        let filters = Filters {
            query: "OAT".to_string(),
            ..Filters::default()
        };
        assert!(controller.set_filters(filters.clone(), &state));
        assert!(!controller.set_filters(filters, &state));
        let _ = controller.next_batch(controller.layout_version(), 0.0);
        assert_eq!(controller.visible(), &ids[1..2]);
    }

    #[test]
    fn refresh_keeps_the_mounted_count() {
        let state = state_of(12);
        let mut controller = BatchRenderController::new(BatchSettings::default());
        controller.reset(&state);
        let version = controller.layout_version();
        let _ = controller.next_batch(version, 0.0);

        let added = Note::new(Uuid::new_v4(), None);
        let next = reduce(&state, &NoteAction::AddNote { note: added.clone() });
        controller.refresh(&next);
        assert_eq!(controller.layout_version(), version);
        assert_eq!(controller.visible().len(), 10);
        assert_eq!(controller.visible()[0], added.uuid);
        assert_eq!(controller.matching_count(), 13);
    }
}
