use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::playlist::PlaylistError;
use crate::schedule::{CueError, ScheduleRef};
use crate::station::{Station, StationError, SyncResponse};
use crate::track::{NewTrack, Playlist, Track, TrackPatch};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub station: Station,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;

fn api_error(status: StatusCode, msg: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": msg.to_string() })))
}

pub fn build_router(state: AppState, media_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/ping", get(ping))
        // Listener-facing: polled every few seconds by every client.
        .route("/api/radio/sync", get(api_sync))
        .route("/api/radio/state", get(api_state))
        .route("/api/radio/skip", post(api_skip))
        .route("/api/radio/cue", post(api_cue))
        .route("/api/songs", get(api_songs_list).post(api_songs_create).put(api_songs_reorder))
        .route("/api/songs/:id", put(api_songs_update).delete(api_songs_delete));

    if let Some(dir) = media_dir {
        router = router.nest_service("/media", ServeDir::new(dir));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn root() -> &'static str {
    "stationsync is running. Poll /api/radio/sync"
}

async fn ping(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": state.version,
        "features": ["sync", "playlist", "transport"]
    }))
}

// --- Schedule -------------------------------------------------------------

async fn api_sync(State(state): State<AppState>) -> ApiResult<SyncResponse> {
    // A failing store must not look like "nothing playing"; listeners treat
    // any non-200 as a skipped poll and keep their current state.
    state.station.sync().await.map(Json).map_err(|e| {
        tracing::warn!("sync failed: {e:#}");
        api_error(StatusCode::SERVICE_UNAVAILABLE, "schedule unavailable")
    })
}

async fn api_state(State(state): State<AppState>) -> ApiResult<ScheduleRef> {
    state
        .station
        .reference()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e))
}

async fn api_skip(State(state): State<AppState>) -> ApiResult<SyncResponse> {
    state.station.skip().await.map(Json).map_err(|e| {
        tracing::warn!("skip failed: {e:#}");
        api_error(StatusCode::SERVICE_UNAVAILABLE, "schedule unavailable")
    })
}

#[derive(Deserialize)]
struct CueReq {
    id: String,
}

async fn api_cue(State(state): State<AppState>, Json(req): Json<CueReq>) -> ApiResult<SyncResponse> {
    match state.station.cue(&req.id).await {
        Ok(resp) => Ok(Json(resp)),
        Err(StationError::Cue(e @ CueError::UnknownTrack(_))) => Err(api_error(StatusCode::NOT_FOUND, e)),
        Err(StationError::Cue(e @ CueError::NotSchedulable(_))) => Err(api_error(StatusCode::BAD_REQUEST, e)),
        Err(StationError::Storage(e)) => {
            tracing::warn!("cue failed: {e:#}");
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "schedule unavailable"))
        }
    }
}

// --- Playlist ---------------------------------------------------------------

fn playlist_error(e: PlaylistError) -> (StatusCode, Json<Value>) {
    match e {
        PlaylistError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e),
        PlaylistError::Invalid(_) => api_error(StatusCode::BAD_REQUEST, e),
        PlaylistError::Storage(ref inner) => {
            tracing::warn!("playlist storage error: {inner:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "playlist storage error")
        }
    }
}

async fn api_songs_list(State(state): State<AppState>) -> ApiResult<Playlist> {
    state
        .station
        .playlist()
        .load()
        .await
        .map(Json)
        .map_err(|e| playlist_error(e.into()))
}

async fn api_songs_create(
    State(state): State<AppState>,
    Json(req): Json<NewTrack>,
) -> Result<(StatusCode, Json<Track>), (StatusCode, Json<Value>)> {
    let track = state.station.playlist().create(req).await.map_err(playlist_error)?;
    Ok((StatusCode::CREATED, Json(track)))
}

async fn api_songs_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TrackPatch>,
) -> ApiResult<Track> {
    let track = state.station.playlist().update(&id, patch).await.map_err(playlist_error)?;
    Ok(Json(track))
}

async fn api_songs_delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    // The schedule pointer is left alone; if it referenced this track the
    // next sync repairs it.
    state.station.playlist().delete(&id).await.map_err(playlist_error)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct ReorderReq {
    order: Vec<String>,
}

async fn api_songs_reorder(State(state): State<AppState>, Json(req): Json<ReorderReq>) -> ApiResult<Playlist> {
    let playlist = state.station.playlist().reorder(req.order).await.map_err(playlist_error)?;
    Ok(Json(playlist))
}
