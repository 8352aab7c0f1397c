// --- Sync endpoint service ----------------------------------------------------
//
// Answers "what is on air right now" for every listener poll. The answer is
// computed from the playlist and the stored pointer; if the pointer is stale
// (first run, deleted track, finished track) the replacement is persisted
// before the answer leaves, inside the store's atomic update.
//
// The clock is read inside that update, never before it. Otherwise a request
// that sampled `now` early could find a pointer another request had already
// advanced "in its future" and re-anchor it backwards.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{fmt_unix_millis, Clock};
use crate::playlist::PlaylistRepo;
use crate::schedule::{self, Change, CueError, Decision, ScheduleRef};
use crate::store::ScheduleStore;
use crate::track::{Playlist, Track};

/// Authoritative answer returned to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// `None` only when the playlist is empty.
    pub current_song: Option<Track>,
    /// Seconds into `current_song`.
    pub position: f64,
    /// Server wall clock (unix ms) the answer was computed for.
    pub timestamp: i64,
    /// Informational only; live listeners wait for the server to switch.
    #[serde(default)]
    pub next_song: Option<Track>,
}

impl SyncResponse {
    fn from_decision(playlist: &Playlist, decision: &Decision, now_ms: i64) -> Self {
        Self {
            current_song: decision.track(playlist).cloned(),
            position: decision.position,
            timestamp: now_ms,
            next_song: decision.next_track(playlist).cloned(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StationError {
    #[error(transparent)]
    Cue(#[from] CueError),
    #[error("schedule storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct Station {
    playlist: PlaylistRepo,
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
}

impl Station {
    pub fn new(playlist: PlaylistRepo, store: Arc<dyn ScheduleStore>, clock: Arc<dyn Clock>) -> Self {
        Self { playlist, store, clock }
    }

    pub fn playlist(&self) -> &PlaylistRepo {
        &self.playlist
    }

    /// Current schedule pointer, for diagnostics.
    pub async fn reference(&self) -> anyhow::Result<ScheduleRef> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.read()).await?
    }

    /// Resolves the on-air track, advancing the pointer if it ran out.
    pub async fn sync(&self) -> anyhow::Result<SyncResponse> {
        let playlist = self.playlist.load().await?;
        let store = self.store.clone();
        let clock = self.clock.clone();

        let (playlist, decision, now) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let mut outcome: Option<(Decision, i64)> = None;
            store.update(&mut |current| {
                let now = clock.now_ms();
                let decision = schedule::evaluate(&playlist, current, now);
                let replacement = decision.replacement.as_ref().map(|(r, _)| r.clone());
                outcome = Some((decision, now));
                replacement
            })?;
            let (decision, now) =
                outcome.ok_or_else(|| anyhow::anyhow!("schedule store returned without deciding"))?;
            Ok((playlist, decision, now))
        })
        .await??;

        if let Some((reference, change)) = &decision.replacement {
            log_change(&playlist, reference, *change);
        }

        Ok(SyncResponse::from_decision(&playlist, &decision, now))
    }

    /// Operator skip: the next track in loop order starts now.
    pub async fn skip(&self) -> anyhow::Result<SyncResponse> {
        let playlist = self.playlist.load().await?;
        self.replace(playlist, schedule::skip).await
    }

    /// Operator cue: `track_id` starts now.
    pub async fn cue(&self, track_id: &str) -> Result<SyncResponse, StationError> {
        let playlist = self.playlist.load().await?;
        // Validate up front so the error can be reported; the reference itself
        // is rebuilt under the store lock with the clock read there.
        schedule::cue(&playlist, track_id, 0)?;

        let id = track_id.to_string();
        let resp = self
            .replace(playlist, move |playlist, _, now| schedule::cue(playlist, &id, now).ok())
            .await?;
        Ok(resp)
    }

    async fn replace<F>(&self, playlist: Playlist, choose: F) -> anyhow::Result<SyncResponse>
    where
        F: Fn(&Playlist, &ScheduleRef, i64) -> Option<ScheduleRef> + Send + 'static,
    {
        let store = self.store.clone();
        let clock = self.clock.clone();

        let (playlist, updated, now) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let mut now = clock.now_ms();
            let updated = store.update(&mut |current| {
                now = clock.now_ms();
                choose(&playlist, current, now)
            })?;
            Ok((playlist, updated, now))
        })
        .await??;

        if updated.changed() {
            info!(
                from = %updated.previous.track_id,
                to = %updated.current.track_id,
                "operator moved schedule"
            );
        }

        // Evaluating the fresh pointer at the instant it was written cannot
        // produce another replacement.
        let decision = schedule::evaluate(&playlist, &updated.current, now);
        Ok(SyncResponse::from_decision(&playlist, &decision, now))
    }
}

fn log_change(playlist: &Playlist, reference: &ScheduleRef, change: Change) {
    let title = playlist
        .find(&reference.track_id)
        .map(|t| t.title.as_str())
        .unwrap_or("?");
    let at = fmt_unix_millis(reference.activated_at_ms);
    match change {
        Change::Initialized => info!(track = %reference.track_id, %title, %at, "schedule initialized"),
        Change::Advanced => info!(track = %reference.track_id, %title, %at, "advanced to next track"),
        Change::Repaired => warn!(
            track = %reference.track_id,
            %title,
            "active track missing from playlist; restarting at head"
        ),
        Change::Reanchored => warn!(
            track = %reference.track_id,
            "activation was in the future (clock moved back); re-anchored at now"
        ),
    }
}
