// --- Listener session -----------------------------------------------------------
//
// One listener's view of the station, as an explicit state machine:
//
//            toggle               toggle (re-poll first)
//   LivePlaying ───────► LivePaused ───────────────────► LivePlaying
//        │ play_track                  ▲ go_live
//        ▼                             │
//   PreviewPlaying ◄──────────► PreviewPaused
//                    toggle
//
// The session never touches the network itself. Operations return `Action`s
// (fetch a sync answer, report a corrected duration) that the listener driver
// performs asynchronously and feeds back in. Every answer carries the
// generation it was requested under, and every engine event carries its
// `LoadId`; anything that no longer matches the current session is dropped.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::engine::{EngineEvent, LoadId, PlaybackEngine};
use crate::config::ListenerConfig;
use crate::station::SyncResponse;
use crate::track::{fmt_dur_mmss, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    LivePlaying,
    LivePaused,
    PreviewPlaying,
    PreviewPaused,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        matches!(self, Self::LivePlaying | Self::LivePaused)
    }

    pub fn is_playing(self) -> bool {
        matches!(self, Self::LivePlaying | Self::PreviewPlaying)
    }
}

/// Why a sync answer was requested; decides how the answer is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Periodic heartbeat.
    Tick,
    /// Local engine hit the end of a live track before the next heartbeat.
    TrackEnded,
    /// User pressed play while live-paused (or idle).
    Resume,
    /// User asked to return to the live schedule.
    GoLive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Fetch { purpose: Purpose, generation: u64 },
    ReportDuration { track_id: String, seconds: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub drift_tolerance: f64,
    pub duration_tolerance: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        let d = ListenerConfig::default();
        Self::from(&d)
    }
}

impl From<&ListenerConfig> for Tuning {
    fn from(c: &ListenerConfig) -> Self {
        Self { drift_tolerance: c.drift_tolerance, duration_tolerance: c.duration_tolerance }
    }
}

pub struct Session<E: PlaybackEngine> {
    engine: E,
    tuning: Tuning,
    state: SessionState,
    playlist: Vec<Track>,
    current: Option<Track>,
    load: Option<LoadId>,
    volume: f32,
    /// Last authoritative offset and when it was observed; the basis for
    /// `current_time` between polls.
    last_offset: f64,
    observed_at: Instant,
    generation: u64,
    resume_pending: bool,
    duration_checked: bool,
    ended_locally: bool,
    retry_on_unlock: bool,
}

impl<E: PlaybackEngine> Session<E> {
    pub fn new(engine: E, tuning: Tuning, now: Instant) -> Self {
        Self {
            engine,
            tuning,
            state: SessionState::Idle,
            playlist: Vec::new(),
            current: None,
            load: None,
            volume: 1.0,
            last_offset: 0.0,
            observed_at: now,
            generation: 0,
            resume_pending: false,
            duration_checked: false,
            ended_locally: false,
            retry_on_unlock: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn playlist(&self) -> &[Track] {
        &self.playlist
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_playlist(&mut self, tracks: Vec<Track>) {
        self.playlist = tracks;
    }

    /// First contact with the station. With `autoplay` the session goes
    /// straight to live playback; otherwise the current track is cued and the
    /// session stays idle until the user presses play.
    ///
    /// An autoplay session that could not reach the station still goes live
    /// with nothing loaded, so the next heartbeat picks up the track.
    pub fn start(&mut self, playlist: Vec<Track>, sync: Option<SyncResponse>, autoplay: bool, now: Instant) {
        self.playlist = playlist;
        let Some(sync) = sync else {
            if autoplay {
                info!("station unreachable at startup; retrying on the next heartbeat");
                self.state = SessionState::LivePlaying;
            } else {
                info!("station unreachable at startup; waiting for user action");
            }
            return;
        };
        let Some(track) = sync.current_song else {
            info!("station playlist is empty");
            if autoplay {
                self.state = SessionState::LivePlaying;
            }
            return;
        };
        self.cue(track, sync.position, now);
        if autoplay {
            self.state = SessionState::LivePlaying;
            self.engine.play();
        }
    }

    /// Heartbeat. Only live sessions talk to the station.
    pub fn tick(&mut self) -> Vec<Action> {
        if !self.state.is_live() {
            return Vec::new();
        }
        if self.state == SessionState::LivePlaying {
            self.watchdog();
        }
        vec![self.fetch(Purpose::Tick)]
    }

    /// Applies a sync answer (or a failed fetch) requested under `generation`.
    pub fn on_sync(
        &mut self,
        purpose: Purpose,
        generation: u64,
        result: Result<SyncResponse, String>,
        now: Instant,
    ) -> Vec<Action> {
        if generation != self.generation {
            debug!(?purpose, generation, current = self.generation, "dropping stale sync answer");
            return Vec::new();
        }
        let sync = match result {
            Ok(sync) => sync,
            Err(e) => {
                // Keep running on local state until the next good poll.
                warn!(?purpose, "sync failed: {e}");
                if purpose == Purpose::Resume {
                    self.resume_pending = false;
                }
                return Vec::new();
            }
        };

        match purpose {
            Purpose::Tick | Purpose::TrackEnded => self.reconcile(sync, now),
            Purpose::Resume => {
                if !self.resume_pending || self.state.is_playing() {
                    return Vec::new();
                }
                self.resume_pending = false;
                self.join_live(sync, now);
            }
            Purpose::GoLive => match self.state {
                SessionState::LivePlaying => self.join_live(sync, now),
                // Paused while the answer was in flight: cue it, stay paused.
                SessionState::LivePaused => self.reconcile(sync, now),
                _ => {}
            },
        }
        Vec::new()
    }

    pub fn on_engine_event(&mut self, event: EngineEvent, now: Instant) -> Vec<Action> {
        if let EngineEvent::Unlocked = event {
            if self.retry_on_unlock && self.state.is_playing() {
                info!("output unlocked; retrying playback");
                self.retry_on_unlock = false;
                self.engine.play();
            }
            return Vec::new();
        }

        let load = match &event {
            EngineEvent::Loaded { load, .. }
            | EngineEvent::Ended { load }
            | EngineEvent::LoadError { load, .. }
            | EngineEvent::PlayError { load, .. } => *load,
            EngineEvent::Unlocked => return Vec::new(),
        };
        if self.load != Some(load) {
            debug!(?event, "ignoring engine event for a replaced track");
            return Vec::new();
        }

        match event {
            EngineEvent::Loaded { duration, .. } => self.check_duration(duration).into_iter().collect(),
            EngineEvent::Ended { .. } => self.on_track_end(now),
            EngineEvent::LoadError { reason, .. } => {
                warn!("failed to load track: {reason}");
                // Forget the track so the next live poll reloads it as a
                // transition.
                self.load = None;
                self.current = None;
                if self.state == SessionState::PreviewPlaying {
                    self.state = SessionState::PreviewPaused;
                }
                Vec::new()
            }
            EngineEvent::PlayError { reason, .. } => {
                warn!("playback refused: {reason}; will retry when output unlocks");
                self.retry_on_unlock = true;
                Vec::new()
            }
            EngineEvent::Unlocked => Vec::new(),
        }
    }

    /// Play/pause button.
    pub fn toggle_play(&mut self, now: Instant) -> Vec<Action> {
        match self.state {
            SessionState::LivePlaying | SessionState::PreviewPlaying => {
                self.last_offset = self.current_time(now);
                self.observed_at = now;
                self.engine.pause();
                self.state = if self.state == SessionState::LivePlaying {
                    SessionState::LivePaused
                } else {
                    SessionState::PreviewPaused
                };
                Vec::new()
            }
            SessionState::LivePaused | SessionState::Idle => {
                if self.resume_pending {
                    // Second press while the resume poll is in flight.
                    self.resume_pending = false;
                    return Vec::new();
                }
                // The station kept going while we were paused: ask where it
                // is now instead of un-pausing the stale deck.
                self.resume_pending = true;
                if self.state == SessionState::Idle {
                    self.state = SessionState::LivePaused;
                }
                vec![self.fetch(Purpose::Resume)]
            }
            SessionState::PreviewPaused => {
                self.state = SessionState::PreviewPlaying;
                self.observed_at = now;
                match (self.load, self.current.clone()) {
                    (Some(_), _) => self.engine.play(),
                    (None, Some(track)) => self.start_preview(track, now),
                    (None, None) => self.state = SessionState::PreviewPaused,
                }
                Vec::new()
            }
        }
    }

    /// Manual track selection: leaves the live schedule and plays `track_id`
    /// from the top. Never contacts the station.
    pub fn play_track(&mut self, track_id: &str, now: Instant) -> bool {
        let Some(track) = self.playlist.iter().find(|t| t.id == track_id).cloned() else {
            warn!(track_id, "cannot preview unknown track");
            return false;
        };
        self.invalidate();
        self.state = SessionState::PreviewPlaying;
        self.start_preview(track, now);
        true
    }

    /// Returns to the live schedule at its authoritative position.
    pub fn go_live(&mut self) -> Vec<Action> {
        self.invalidate();
        self.state = SessionState::LivePlaying;
        vec![self.fetch(Purpose::GoLive)]
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.engine.set_volume(self.volume);
    }

    /// Position for display, interpolated from the last observation rather
    /// than queried from the engine.
    pub fn current_time(&self, now: Instant) -> f64 {
        let Some(track) = &self.current else {
            return 0.0;
        };
        match self.state {
            SessionState::Idle => 0.0,
            SessionState::LivePaused | SessionState::PreviewPaused => self.last_offset,
            SessionState::LivePlaying | SessionState::PreviewPlaying => {
                let since = now.saturating_duration_since(self.observed_at).as_secs_f64();
                (self.last_offset + since).min(track.duration.max(0.0))
            }
        }
    }

    /// Stops everything and discards in-flight answers and callbacks.
    pub fn teardown(&mut self) {
        self.invalidate();
        self.engine.unload();
        self.load = None;
        self.current = None;
        self.state = SessionState::Idle;
    }

    // --- internals ------------------------------------------------------------

    fn fetch(&self, purpose: Purpose) -> Action {
        Action::Fetch { purpose, generation: self.generation }
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        self.resume_pending = false;
    }

    fn cue(&mut self, track: Track, offset: f64, now: Instant) {
        match self.engine.load(&track, offset) {
            Ok(load) => {
                self.load = Some(load);
                self.engine.set_volume(self.volume);
            }
            Err(e) => {
                warn!(track = %track.id, "engine rejected track: {e}");
                self.load = None;
            }
        }
        self.current = Some(track);
        self.last_offset = offset;
        self.observed_at = now;
        self.duration_checked = false;
        self.ended_locally = false;
        self.retry_on_unlock = false;
    }

    fn start_preview(&mut self, track: Track, now: Instant) {
        info!(track = %track.id, title = %track.title, "preview");
        self.cue(track, 0.0, now);
        self.engine.play();
    }

    /// Switch to (or re-sync with) the live answer and start playing.
    fn join_live(&mut self, sync: SyncResponse, now: Instant) {
        self.state = SessionState::LivePlaying;
        let Some(track) = sync.current_song else {
            self.engine.unload();
            self.load = None;
            self.current = None;
            return;
        };
        let same = self.current.as_ref().is_some_and(|c| c.id == track.id) && self.load.is_some();
        if same && !self.ended_locally {
            self.engine.seek(sync.position);
            self.last_offset = sync.position;
            self.observed_at = now;
        } else {
            info!(title = %track.title, at = %fmt_dur_mmss(sync.position), "joining live");
            self.cue(track, sync.position, now);
        }
        self.engine.play();
    }

    /// Heartbeat answer while live: forced transition or drift correction.
    fn reconcile(&mut self, sync: SyncResponse, now: Instant) {
        if !self.state.is_live() {
            return;
        }
        let playing = self.state == SessionState::LivePlaying;

        let Some(track) = sync.current_song else {
            if self.current.is_some() {
                info!("station went silent");
                self.engine.unload();
                self.load = None;
                self.current = None;
            }
            return;
        };

        let loaded_id = self.current.as_ref().map(|t| t.id.as_str());
        if loaded_id != Some(track.id.as_str()) || self.load.is_none() {
            info!(
                from = loaded_id.unwrap_or("none"),
                to = %track.id,
                title = %track.title,
                at = %fmt_dur_mmss(sync.position),
                "transition"
            );
            self.cue(track, sync.position, now);
            if playing {
                self.engine.play();
            }
            return;
        }

        self.last_offset = sync.position;
        self.observed_at = now;

        if !playing || self.engine.is_loading() {
            return;
        }
        let Some(local) = self.engine.position() else {
            return;
        };
        let drift = (local - sync.position).abs();
        if drift > self.tuning.drift_tolerance {
            info!(local = local, server = sync.position, drift, "drift correction");
            self.engine.seek(sync.position);
            if self.ended_locally {
                self.ended_locally = false;
                self.engine.play();
            }
        } else {
            debug!(drift, "within tolerance");
        }
    }

    /// Restart a deck that should be playing but went quiet without telling us.
    fn watchdog(&mut self) {
        if self.load.is_none() || self.ended_locally || self.retry_on_unlock {
            return;
        }
        if !self.engine.is_loading() && !self.engine.is_playing() {
            warn!("engine stalled while live; resuming");
            self.engine.play();
        }
    }

    fn on_track_end(&mut self, now: Instant) -> Vec<Action> {
        self.ended_locally = true;
        match self.state {
            SessionState::LivePlaying | SessionState::LivePaused => {
                // Only the station decides when the next track starts.
                debug!("live track ended locally; asking the station");
                vec![self.fetch(Purpose::TrackEnded)]
            }
            SessionState::PreviewPlaying | SessionState::PreviewPaused => {
                let next = self.next_in_playlist();
                match next {
                    Some(track) => {
                        self.state = SessionState::PreviewPlaying;
                        self.start_preview(track, now);
                    }
                    None => self.state = SessionState::PreviewPaused,
                }
                Vec::new()
            }
            SessionState::Idle => Vec::new(),
        }
    }

    fn next_in_playlist(&self) -> Option<Track> {
        if self.playlist.is_empty() {
            return None;
        }
        let index = self
            .current
            .as_ref()
            .and_then(|c| self.playlist.iter().position(|t| t.id == c.id))
            .map(|i| (i + 1) % self.playlist.len())
            .unwrap_or(0);
        self.playlist.get(index).cloned()
    }

    fn check_duration(&mut self, observed: f64) -> Option<Action> {
        if self.duration_checked || !observed.is_finite() || observed <= 0.0 {
            return None;
        }
        self.duration_checked = true;
        let track = self.current.as_mut()?;
        if (observed - track.duration).abs() <= self.tuning.duration_tolerance {
            return None;
        }
        info!(
            track = %track.id,
            declared = track.duration,
            observed,
            "declared duration is off; correcting"
        );
        track.duration = observed;
        let track_id = track.id.clone();
        if let Some(entry) = self.playlist.iter_mut().find(|t| t.id == track_id) {
            entry.duration = observed;
        }
        Some(Action::ReportDuration { track_id, seconds: observed.round() })
    }
}
