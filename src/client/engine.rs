// --- Playback engine ----------------------------------------------------------
//
// Decoding and output are the platform's business. The reconciliation loop
// only needs a deck it can load, start, stop and reposition, plus a stream of
// completion events. Each load hands out a `LoadId`; every event carries the
// id of the load it belongs to so late callbacks for a replaced track can be
// recognised and dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ClientError, Result};
use crate::track::Track;

/// Identity of one `load` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The audio is decodable; `duration` is what the decoder measured.
    Loaded { load: LoadId, duration: f64 },
    /// Playback reached the end of the loaded track.
    Ended { load: LoadId },
    LoadError { load: LoadId, reason: String },
    /// `play` was refused, typically because output is locked until the
    /// user interacts (autoplay policies).
    PlayError { load: LoadId, reason: String },
    /// Output became available after a `PlayError`.
    Unlocked,
}

pub trait PlaybackEngine: Send {
    /// Replaces whatever is loaded with `track`, positioned at `offset`
    /// seconds. Does not start playback.
    fn load(&mut self, track: &Track, offset: f64) -> Result<LoadId>;
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, offset: f64);
    fn unload(&mut self);
    fn set_volume(&mut self, volume: f32);
    /// Current playback offset, `None` when nothing is loaded.
    fn position(&self) -> Option<f64>;
    /// Actually producing audio right now.
    fn is_playing(&self) -> bool;
    /// Still fetching/decoding the current load.
    fn is_loading(&self) -> bool;
}

// --- Simulated deck ---------------------------------------------------------

/// How often the simulated deck checks for load completion and track end.
const DECK_TICK: Duration = Duration::from_millis(50);

/// A clock-driven stand-in for a real audio output. Positions advance with
/// tokio time, loads complete after `load_delay`, and the decoded duration
/// can be overridden per track to mimic files whose tags lie. Tracks marked
/// broken fail to decode once their load delay has passed.
pub struct SimulatedEngine {
    deck: Arc<Mutex<Deck>>,
    ticker: JoinHandle<()>,
    next_load: u64,
    load_delay: Duration,
    real_durations: HashMap<String, f64>,
    broken: HashSet<String>,
}

struct Deck {
    events: mpsc::UnboundedSender<EngineEvent>,
    current: Option<Cue>,
    volume: f32,
    locked: bool,
}

struct Cue {
    load: LoadId,
    duration: f64,
    ready_at: Instant,
    announced: bool,
    /// Offset at `anchor`; the live position is `offset + (now - anchor)`.
    offset: f64,
    anchor: Option<Instant>,
    want_play: bool,
    ended: bool,
    broken: bool,
}

impl Cue {
    fn position(&self, now: Instant) -> f64 {
        let running = self.anchor.map(|a| now.saturating_duration_since(a).as_secs_f64()).unwrap_or(0.0);
        (self.offset + running).min(self.duration)
    }

    fn ready(&self, now: Instant) -> bool {
        now >= self.ready_at
    }
}

fn lock(deck: &Mutex<Deck>) -> MutexGuard<'_, Deck> {
    deck.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedEngine {
    /// Must be called inside a tokio runtime; the deck runs its own ticker.
    pub fn new(load_delay: Duration) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let deck = Arc::new(Mutex::new(Deck { events: tx, current: None, volume: 1.0, locked: false }));
        let ticker = tokio::spawn(run_deck(deck.clone()));
        let engine = Self {
            deck,
            ticker,
            next_load: 0,
            load_delay,
            real_durations: HashMap::new(),
            broken: HashSet::new(),
        };
        (engine, rx)
    }

    /// Pretend the audio behind `track_id` really lasts `seconds`.
    pub fn with_real_duration(mut self, track_id: impl Into<String>, seconds: f64) -> Self {
        self.real_durations.insert(track_id.into(), seconds);
        self
    }

    /// Every load of `track_id` ends in `LoadError`.
    pub fn with_broken(mut self, track_id: impl Into<String>) -> Self {
        self.broken.insert(track_id.into());
        self
    }

    /// Simulates an output that refuses to start until `unlock` is called.
    pub fn lock_output(&self) {
        lock(&self.deck).locked = true;
    }

    pub fn unlock(&self) {
        let mut deck = lock(&self.deck);
        if deck.locked {
            deck.locked = false;
            let _ = deck.events.send(EngineEvent::Unlocked);
        }
    }

    pub fn volume(&self) -> f32 {
        lock(&self.deck).volume
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

async fn run_deck(deck: Arc<Mutex<Deck>>) {
    let mut interval = tokio::time::interval(DECK_TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = Instant::now();
        let mut guard = lock(&deck);
        let deck = &mut *guard;
        let Some(cue) = deck.current.as_mut() else {
            continue;
        };

        if !cue.announced && cue.ready(now) {
            cue.announced = true;
            if cue.broken {
                let load = cue.load;
                let _ = deck.events.send(EngineEvent::LoadError { load, reason: "could not decode audio".into() });
                deck.current = None;
                continue;
            }
            let _ = deck.events.send(EngineEvent::Loaded { load: cue.load, duration: cue.duration });
            if cue.want_play && !deck.locked && !cue.ended {
                cue.anchor = Some(now);
            }
        }

        if cue.anchor.is_some() && !cue.ended && cue.position(now) >= cue.duration {
            cue.offset = cue.duration;
            cue.anchor = None;
            cue.ended = true;
            let _ = deck.events.send(EngineEvent::Ended { load: cue.load });
        }
    }
}

impl PlaybackEngine for SimulatedEngine {
    fn load(&mut self, track: &Track, offset: f64) -> Result<LoadId> {
        if track.audio_url.trim().is_empty() {
            return Err(ClientError::engine(format!("track {} has no audio locator", track.id)));
        }
        self.next_load += 1;
        let load = LoadId(self.next_load);
        let duration = self.real_durations.get(&track.id).copied().unwrap_or(track.duration).max(0.0);
        lock(&self.deck).current = Some(Cue {
            load,
            duration,
            ready_at: Instant::now() + self.load_delay,
            announced: false,
            offset: offset.clamp(0.0, duration),
            anchor: None,
            want_play: false,
            ended: false,
            broken: self.broken.contains(&track.id),
        });
        Ok(load)
    }

    fn play(&mut self) {
        let now = Instant::now();
        let mut guard = lock(&self.deck);
        let deck = &mut *guard;
        let Some(cue) = deck.current.as_mut() else {
            return;
        };
        cue.want_play = true;
        if deck.locked {
            let _ = deck.events.send(EngineEvent::PlayError {
                load: cue.load,
                reason: "output locked until user interaction".into(),
            });
            return;
        }
        if cue.ready(now) && cue.anchor.is_none() && !cue.ended {
            cue.anchor = Some(now);
        }
    }

    fn pause(&mut self) {
        let now = Instant::now();
        if let Some(cue) = lock(&self.deck).current.as_mut() {
            cue.offset = cue.position(now);
            cue.anchor = None;
            cue.want_play = false;
        }
    }

    fn seek(&mut self, offset: f64) {
        let now = Instant::now();
        if let Some(cue) = lock(&self.deck).current.as_mut() {
            cue.offset = offset.clamp(0.0, cue.duration);
            cue.ended = cue.offset >= cue.duration;
            if cue.anchor.is_some() || (cue.want_play && cue.ready(now) && !cue.ended) {
                cue.anchor = Some(now);
            }
        }
    }

    fn unload(&mut self) {
        lock(&self.deck).current = None;
    }

    fn set_volume(&mut self, volume: f32) {
        lock(&self.deck).volume = volume.clamp(0.0, 1.0);
    }

    fn position(&self) -> Option<f64> {
        let now = Instant::now();
        lock(&self.deck).current.as_ref().map(|c| c.position(now))
    }

    fn is_playing(&self) -> bool {
        lock(&self.deck).current.as_ref().is_some_and(|c| c.anchor.is_some())
    }

    fn is_loading(&self) -> bool {
        let now = Instant::now();
        lock(&self.deck).current.as_ref().is_some_and(|c| !c.ready(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::track;

    async fn settle() {
        // Let the deck ticker observe the advanced clock.
        tokio::time::sleep(DECK_TICK * 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn load_then_play_advances_and_ends() {
        let (mut engine, mut events) = SimulatedEngine::new(Duration::from_millis(200));
        let load = engine.load(&track("a", 2.0), 0.5).unwrap();
        engine.play();
        assert!(engine.is_loading());
        assert!(!engine.is_playing());

        settle().await;
        settle().await;
        assert_eq!(events.recv().await, Some(EngineEvent::Loaded { load, duration: 2.0 }));
        assert!(engine.is_playing());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(events.recv().await, Some(EngineEvent::Ended { load }));
        assert!(!engine.is_playing());
        assert_eq!(engine.position(), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_position_and_seek_moves_it() {
        let (mut engine, _events) = SimulatedEngine::new(Duration::ZERO);
        engine.load(&track("a", 100.0), 10.0).unwrap();
        engine.play();
        tokio::time::sleep(Duration::from_secs(5)).await;
        engine.pause();
        let frozen = engine.position().unwrap();
        assert!((frozen - 15.0).abs() < 0.2, "{frozen}");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.position(), Some(frozen));

        engine.seek(40.0);
        assert_eq!(engine.position(), Some(40.0));
        assert!(!engine.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn real_duration_override_is_reported() {
        let (engine, mut events) = SimulatedEngine::new(Duration::ZERO);
        let mut engine = engine.with_real_duration("a", 231.0);
        let load = engine.load(&track("a", 180.0), 0.0).unwrap();
        settle().await;
        assert_eq!(events.recv().await, Some(EngineEvent::Loaded { load, duration: 231.0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn locked_output_refuses_until_unlocked() {
        let (mut engine, mut events) = SimulatedEngine::new(Duration::ZERO);
        engine.lock_output();
        let load = engine.load(&track("a", 100.0), 0.0).unwrap();
        settle().await;
        engine.play();
        assert_eq!(events.recv().await, Some(EngineEvent::Loaded { load, duration: 100.0 }));
        assert!(matches!(events.recv().await, Some(EngineEvent::PlayError { .. })));
        assert!(!engine.is_playing());

        engine.unlock();
        assert_eq!(events.recv().await, Some(EngineEvent::Unlocked));
        engine.play();
        assert!(engine.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn broken_track_reports_load_error_and_unloads() {
        let (engine, mut events) = SimulatedEngine::new(Duration::from_millis(100));
        let mut engine = engine.with_broken("a");
        let load = engine.load(&track("a", 100.0), 0.0).unwrap();
        engine.play();
        settle().await;
        settle().await;
        assert!(matches!(events.recv().await, Some(EngineEvent::LoadError { load: l, .. }) if l == load));
        assert_eq!(engine.position(), None);
        assert!(!engine.is_playing());

        // Other tracks still load.
        let ok = engine.load(&track("b", 100.0), 0.0).unwrap();
        settle().await;
        settle().await;
        assert_eq!(events.recv().await, Some(EngineEvent::Loaded { load: ok, duration: 100.0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_locator_fails_to_load() {
        let (mut engine, _events) = SimulatedEngine::new(Duration::ZERO);
        let mut t = track("a", 10.0);
        t.audio_url.clear();
        assert!(engine.load(&t, 0.0).is_err());
        assert_eq!(engine.position(), None);
    }
}
