//! Operational endpoints: health, cache introspection, purges

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

/// Browsers ask for this on every visit.
pub async fn favicon() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// One row per disk cache entry, flagging whether a rasterizer currently
/// holds the file open.
#[derive(Serialize)]
pub struct FilecacheEntry {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "StoragePath")]
    storage_path: String,
    #[serde(rename = "LoadedInMemory")]
    loaded_in_memory: bool,
}

pub async fn filecache_list(State(state): State<AppState>) -> impl IntoResponse {
    let entries: Vec<FilecacheEntry> = state
        .file_cache()
        .entries()
        .into_iter()
        .map(|entry| FilecacheEntry {
            path: entry.key.path().to_string(),
            loaded_in_memory: state.raster_cache().contains(&entry.storage_path),
            storage_path: entry.storage_path.to_string_lossy().into_owned(),
        })
        .collect();
    Json(entries)
}

pub async fn rastercache_purge(State(state): State<AppState>) -> impl IntoResponse {
    warn!("raster cache purge triggered via HTTP");
    state.raster_cache().purge();
    Json(json!({"status": "OK"}))
}

/// Soft shutdown: kick off an async file-cache purge and answer
/// immediately. The process keeps serving; the orchestrator is expected to
/// follow up with a signal.
pub async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    warn!("shutdown triggered via HTTP");
    let _ = state.file_cache().purge_async();
    Json(json!({"status": "OK"}))
}
