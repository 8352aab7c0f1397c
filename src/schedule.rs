// --- Schedule function ------------------------------------------------------
//
// The station never runs a playback clock. What is "on air" is derived on
// demand from the playlist and a single stored pointer: which track is active
// and when it became active. Every read either confirms the pointer or
// produces a replacement (first use, dangling id, finished track), and the
// caller persists that replacement through the store's atomic update.
//
// Advancing anchors the next track at `now`, not at the previous activation
// plus its duration. After an outage nobody listened through, the station
// resumes one track later instead of rapid-firing through everything it
// "missed".

use serde::{Deserialize, Serialize};

use crate::track::{Playlist, Track};

/// The persisted pointer into the playlist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRef {
    pub track_id: String,
    /// Unix milliseconds at which `track_id` started.
    pub activated_at_ms: i64,
}

impl ScheduleRef {
    pub fn new(track_id: impl Into<String>, activated_at_ms: i64) -> Self {
        Self { track_id: track_id.into(), activated_at_ms }
    }

    /// True for the never-initialized default.
    pub fn is_unset(&self) -> bool {
        self.track_id.is_empty()
    }
}

/// Why a read produced a new reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// No reference stored yet.
    Initialized,
    /// Stored track no longer exists (or cannot be scheduled).
    Repaired,
    /// Activation lay in the future; the wall clock went backwards.
    Reanchored,
    /// The active track ran out.
    Advanced,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Index of the active track. `None` only for an empty playlist.
    pub index: Option<usize>,
    /// Offset into the active track in seconds, within `[0, duration)`.
    pub position: f64,
    /// Reference to persist before answering, if the stored one is stale.
    pub replacement: Option<(ScheduleRef, Change)>,
}

impl Decision {
    pub fn track<'a>(&self, playlist: &'a Playlist) -> Option<&'a Track> {
        self.index.and_then(|i| playlist.get(i))
    }

    /// The track that follows the active one in loop order.
    pub fn next_track<'a>(&self, playlist: &'a Playlist) -> Option<&'a Track> {
        self.index
            .and_then(|i| playlist.next_schedulable_after(i))
            .and_then(|i| playlist.get(i))
    }

    fn nothing() -> Self {
        Self { index: None, position: 0.0, replacement: None }
    }

    fn fresh(index: usize, reference: ScheduleRef, change: Change) -> Self {
        Self { index: Some(index), position: 0.0, replacement: Some((reference, change)) }
    }
}

/// Resolves what is playing at `now_ms` given the stored reference.
///
/// Pure: the caller decides whether and how to persist `replacement`. At most
/// one advance happens per call, so a track that finished long ago hands over
/// to its successor starting at `now`.
pub fn evaluate(playlist: &Playlist, current: &ScheduleRef, now_ms: i64) -> Decision {
    if playlist.is_empty() {
        return Decision::nothing();
    }

    let resolved = playlist
        .position(&current.track_id)
        .filter(|&i| playlist.tracks()[i].is_schedulable());

    let Some(index) = resolved else {
        let Some(start) = playlist.schedulable_from(0) else {
            // Every track has zero duration: report the head of the list as
            // instantaneous and leave the stored pointer alone.
            return Decision { index: Some(0), position: 0.0, replacement: None };
        };
        let change = if current.is_unset() { Change::Initialized } else { Change::Repaired };
        return Decision::fresh(start, ScheduleRef::new(playlist.tracks()[start].id.clone(), now_ms), change);
    };

    if current.activated_at_ms > now_ms {
        return Decision::fresh(index, ScheduleRef::new(current.track_id.clone(), now_ms), Change::Reanchored);
    }

    let duration = playlist.tracks()[index].duration;
    let elapsed = (now_ms - current.activated_at_ms) as f64 / 1000.0;

    if elapsed >= duration {
        // `index` is schedulable, so there is always a successor (possibly itself).
        let next = playlist.next_schedulable_after(index).unwrap_or(index);
        return Decision::fresh(next, ScheduleRef::new(playlist.tracks()[next].id.clone(), now_ms), Change::Advanced);
    }

    Decision { index: Some(index), position: elapsed.max(0.0), replacement: None }
}

/// Reference for an operator "skip": the track after the active one starts now.
/// A dangling reference skips to the head of the list.
pub fn skip(playlist: &Playlist, current: &ScheduleRef, now_ms: i64) -> Option<ScheduleRef> {
    let target = match playlist.position(&current.track_id) {
        Some(i) => playlist.next_schedulable_after(i),
        None => playlist.schedulable_from(0),
    }?;
    Some(ScheduleRef::new(playlist.tracks()[target].id.clone(), now_ms))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CueError {
    #[error("unknown track: {0}")]
    UnknownTrack(String),
    #[error("track {0} has no playable duration")]
    NotSchedulable(String),
}

/// Reference for an operator "cue": `track_id` starts now.
pub fn cue(playlist: &Playlist, track_id: &str, now_ms: i64) -> Result<ScheduleRef, CueError> {
    let track = playlist
        .find(track_id)
        .ok_or_else(|| CueError::UnknownTrack(track_id.to_string()))?;
    if !track.is_schedulable() {
        return Err(CueError::NotSchedulable(track_id.to_string()));
    }
    Ok(ScheduleRef::new(track.id.clone(), now_ms))
}
