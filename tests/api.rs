//! Router tests: the full HTTP surface against an in-memory station with a
//! hand-driven clock.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::util::ServiceExt; // for `oneshot`

use stationsync::api::{build_router, AppState};
use stationsync::clock::ManualClock;
use stationsync::db::Database;
use stationsync::playlist::{demo_tracks, PlaylistRepo};
use stationsync::station::{Station, SyncResponse};
use stationsync::store::SqliteScheduleStore;

struct Harness {
    app: Router,
    clock: ManualClock,
}

async fn setup() -> Harness {
    let db = Database::open_in_memory().expect("in-memory db");
    let playlist = PlaylistRepo::new(db.clone());
    playlist.seed_if_empty(demo_tracks()).await.expect("seed");

    let clock = ManualClock::at_secs(1_000.0);
    let station = Station::new(playlist, Arc::new(SqliteScheduleStore::new(db)), Arc::new(clock.clone()));
    let state = AppState { version: "test".into(), station };
    Harness { app: build_router(state, None), clock }
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request(method, uri, body)).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Should read body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

async fn sync(app: &Router) -> SyncResponse {
    let (status, body) = call(app, "GET", "/api/radio/sync", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    serde_json::from_value(body).expect("sync shape")
}

fn current_id(s: &SyncResponse) -> Option<&str> {
    s.current_song.as_ref().map(|t| t.id.as_str())
}

#[tokio::test]
async fn health_and_ping() {
    let h = setup().await;
    let (status, body) = call(&h.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".into()));

    let (_, body) = call(&h.app, "GET", "/api/ping", None).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["version"], "test");
}

#[tokio::test]
async fn sync_walks_the_playlist_over_time() {
    let h = setup().await;

    let first = sync(&h.app).await;
    assert_eq!(current_id(&first), Some("1"));
    assert_eq!(first.position, 0.0);
    assert_eq!(first.timestamp, 1_000_000);
    assert_eq!(first.next_song.as_ref().map(|t| t.id.as_str()), Some("2"));

    h.clock.set_secs(1_090.0);
    let mid = sync(&h.app).await;
    assert_eq!(current_id(&mid), Some("1"));
    assert!((mid.position - 90.0).abs() < 1e-9);

    // Track 1 is 180 s long; the next poll after it ends hands over to 2.
    h.clock.set_secs(1_185.0);
    let next = sync(&h.app).await;
    assert_eq!(current_id(&next), Some("2"));
    assert_eq!(next.position, 0.0);

    h.clock.set_secs(1_195.0);
    let later = sync(&h.app).await;
    assert_eq!(current_id(&later), Some("2"));
    assert!((later.position - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn state_exposes_the_stored_reference() {
    let h = setup().await;
    sync(&h.app).await;
    let (status, body) = call(&h.app, "GET", "/api/radio/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "trackId": "1", "activatedAtMs": 1_000_000 }));
}

#[tokio::test]
async fn skip_and_cue_restart_the_clock() {
    let h = setup().await;
    sync(&h.app).await;

    h.clock.set_secs(1_050.0);
    let (status, body) = call(&h.app, "POST", "/api/radio/skip", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["currentSong"]["id"], "2");
    assert_eq!(body["position"], 0.0);

    let (status, body) = call(&h.app, "POST", "/api/radio/cue", Some(json!({ "id": "4" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["currentSong"]["id"], "4");

    let (status, _) = call(&h.app, "POST", "/api/radio/cue", Some(json!({ "id": "nope" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn playlist_crud_round_trip() {
    let h = setup().await;

    let (status, body) = call(&h.app, "GET", "/api/songs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(5));

    let (status, created) = call(
        &h.app,
        "POST",
        "/api/songs",
        Some(json!({ "title": "Fresh", "audioUrl": "/media/fresh.mp3" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["duration"], 180.0);
    assert_eq!(created["genre"], "Unknown");
    let id = created["id"].as_str().expect("id").to_string();

    let (status, _) = call(&h.app, "POST", "/api/songs", Some(json!({ "title": "No audio" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, updated) =
        call(&h.app, "PUT", &format!("/api/songs/{id}"), Some(json!({ "duration": 231 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["duration"], 231.0);
    assert_eq!(updated["title"], "Fresh");

    let (status, _) = call(&h.app, "PUT", "/api/songs/missing", Some(json!({ "duration": 10 }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&h.app, "DELETE", &format!("/api/songs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = call(&h.app, "DELETE", &format!("/api/songs/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reorder_requires_a_permutation() {
    let h = setup().await;
    let (status, body) = call(
        &h.app,
        "PUT",
        "/api/songs",
        Some(json!({ "order": ["5", "4", "3", "2", "1"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "5");

    let (status, _) = call(&h.app, "PUT", "/api/songs", Some(json!({ "order": ["1", "2"] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_the_active_track_repairs_on_next_sync() {
    let h = setup().await;
    let (_, body) = call(&h.app, "POST", "/api/radio/cue", Some(json!({ "id": "3" }))).await;
    assert_eq!(body["currentSong"]["id"], "3");

    call(&h.app, "DELETE", "/api/songs/3", None).await;
    h.clock.set_secs(1_010.0);
    let repaired = sync(&h.app).await;
    assert_eq!(current_id(&repaired), Some("1"));
    assert_eq!(repaired.position, 0.0);
}

#[tokio::test]
async fn duration_correction_changes_when_the_track_ends() {
    let h = setup().await;
    sync(&h.app).await;

    // A listener measured track 1 as 231 s instead of 180 s.
    call(&h.app, "PUT", "/api/songs/1", Some(json!({ "duration": 231 }))).await;
    h.clock.set_secs(1_200.0);
    let s = sync(&h.app).await;
    assert_eq!(current_id(&s), Some("1"));
    assert!((s.position - 200.0).abs() < 1e-9);
}

#[tokio::test]
async fn empty_playlist_reports_nothing_on_air() {
    let db = Database::open_in_memory().unwrap();
    let station = Station::new(
        PlaylistRepo::new(db.clone()),
        Arc::new(SqliteScheduleStore::new(db)),
        Arc::new(ManualClock::at_secs(5.0)),
    );
    let app = build_router(AppState { version: "test".into(), station }, None);

    let s = sync(&app).await;
    assert!(s.current_song.is_none());
    assert!(s.next_song.is_none());
    assert_eq!(s.position, 0.0);

    let (status, _) = call(&app, "POST", "/api/radio/cue", Some(json!({ "id": "1" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn concurrent_polls_agree() {
    let h = setup().await;
    sync(&h.app).await;
    h.clock.set_secs(1_190.0);

    let polls: Vec<_> = (0..16)
        .map(|_| {
            let app = h.app.clone();
            tokio::spawn(async move { sync(&app).await })
        })
        .collect();
    for p in polls {
        let s = p.await.unwrap();
        assert_eq!(current_id(&s), Some("2"));
        assert_eq!(s.position, 0.0);
    }

    let (_, body) = call(&h.app, "GET", "/api/radio/state", None).await;
    assert_eq!(body["trackId"], "2");
    assert_eq!(body["activatedAtMs"], 1_190_000);
}
