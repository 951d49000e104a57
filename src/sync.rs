use crate::api::NotesApi;
use crate::errors::AppResult;
use crate::store::NoteStore;

/// Loads the last cached state into the store. Returns false when there is
/// no cache or it holds nothing; an unreadable cache is logged and skipped.
pub fn hydrate_from_cache(store: &NoteStore) -> AppResult<bool> {
    let Some(cache) = store.mirror().cache() else {
        return Ok(false);
    };
    let data = match cache.load() {
        Ok(data) => data,
        Err(error) => {
            tracing::warn!(error = %error, path = %cache.path().display(), "could not read local cache");
            return Ok(false);
        }
    };
    if data.is_empty() {
        return Ok(false);
    }
    tracing::info!(notes = data.notes.len(), labels = data.labels.len(), "hydrated from local cache");
    store.replace_all(data.notes, data.order, data.labels, false)?;
    Ok(true)
}

/// Pulls the full server state and makes it authoritative locally, both in
/// memory and in the cache.
pub async fn refetch(store: &NoteStore, api: &dyn NotesApi) -> AppResult<()> {
    let response = api.fetch_notes().await?;
    tracing::info!(
        notes = response.data.len(),
        labels = response.labels.len(),
        "refetched notes from server"
    );
    store.replace_all(response.data, response.order, response.labels, true)
}
