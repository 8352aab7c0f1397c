// --- Reconciliation loop ------------------------------------------------------
//
// Drives a `Session`: heartbeat ticks, engine events, user commands and
// completed network calls all funnel into one `select!` so the session itself
// is only ever touched from this task. Network calls run on their own tasks
// and report back through a channel; the session decides whether their
// answers are still wanted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::api::RadioApi;
use super::engine::{EngineEvent, PlaybackEngine};
use super::session::{Action, Purpose, Session, SessionState, Tuning};
use crate::config::ListenerConfig;
use crate::station::SyncResponse;
use crate::track::Track;

#[derive(Debug)]
pub enum Command {
    TogglePlay,
    PlayTrack(String),
    GoLive,
    SetVolume(f32),
    RefreshPlaylist,
    Status(oneshot::Sender<Status>),
    Quit,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub state: SessionState,
    pub track: Option<Track>,
    pub position: f64,
    pub volume: f32,
    pub playlist: Vec<Track>,
}

type SyncResult = (Purpose, u64, Result<SyncResponse, String>);

/// Runs one listener until `Quit` arrives or the command channel closes.
pub async fn run<A, E>(
    api: Arc<A>,
    engine: E,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    mut commands: mpsc::Receiver<Command>,
    config: ListenerConfig,
) where
    A: RadioApi,
    E: PlaybackEngine,
{
    let mut session = Session::new(engine, Tuning::from(&config), Instant::now());
    session.set_volume(config.volume);

    let playlist = match api.fetch_playlist().await {
        Ok(tracks) => tracks,
        Err(e) => {
            warn!("could not load playlist: {e}");
            Vec::new()
        }
    };
    let first = match api.fetch_sync().await {
        Ok(sync) => Some(sync),
        Err(e) => {
            warn!("could not reach station: {e}");
            None
        }
    };
    session.start(playlist, first, config.autoplay, Instant::now());
    info!(state = ?session.state(), "listener started");

    let (sync_tx, mut sync_rx) = mpsc::unbounded_channel::<SyncResult>();
    let (playlist_tx, mut playlist_rx) = mpsc::unbounded_channel::<Vec<Track>>();

    let mut heartbeat = tokio::time::interval_at(Instant::now() + config.poll_interval, config.poll_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let actions = tokio::select! {
            _ = heartbeat.tick() => session.tick(),
            Some(event) = events.recv() => session.on_engine_event(event, Instant::now()),
            Some((purpose, generation, result)) = sync_rx.recv() => {
                session.on_sync(purpose, generation, result, Instant::now())
            }
            Some(tracks) = playlist_rx.recv() => {
                session.set_playlist(tracks);
                Vec::new()
            }
            cmd = commands.recv() => match cmd {
                None | Some(Command::Quit) => break,
                Some(cmd) => handle_command(&mut session, cmd, &api, &playlist_tx),
            },
        };
        for action in actions {
            perform(action, &api, &sync_tx, &playlist_tx);
        }
    }

    session.teardown();
    info!("listener stopped");
}

fn handle_command<A: RadioApi, E: PlaybackEngine>(
    session: &mut Session<E>,
    cmd: Command,
    api: &Arc<A>,
    playlist_tx: &mpsc::UnboundedSender<Vec<Track>>,
) -> Vec<Action> {
    let now = Instant::now();
    match cmd {
        Command::TogglePlay => session.toggle_play(now),
        Command::PlayTrack(id) => {
            session.play_track(&id, now);
            Vec::new()
        }
        Command::GoLive => session.go_live(),
        Command::SetVolume(v) => {
            session.set_volume(v);
            Vec::new()
        }
        Command::RefreshPlaylist => {
            spawn_playlist_refresh(api.clone(), playlist_tx.clone());
            Vec::new()
        }
        Command::Status(reply) => {
            let _ = reply.send(Status {
                state: session.state(),
                track: session.current().cloned(),
                position: session.current_time(now),
                volume: session.volume(),
                playlist: session.playlist().to_vec(),
            });
            Vec::new()
        }
        Command::Quit => Vec::new(),
    }
}

fn perform<A: RadioApi>(
    action: Action,
    api: &Arc<A>,
    sync_tx: &mpsc::UnboundedSender<SyncResult>,
    playlist_tx: &mpsc::UnboundedSender<Vec<Track>>,
) {
    match action {
        Action::Fetch { purpose, generation } => {
            let api = api.clone();
            let tx = sync_tx.clone();
            tokio::spawn(async move {
                let result = api.fetch_sync().await.map_err(|e| e.to_string());
                let _ = tx.send((purpose, generation, result));
            });
        }
        Action::ReportDuration { track_id, seconds } => {
            let api = api.clone();
            let playlist_tx = playlist_tx.clone();
            tokio::spawn(async move {
                match api.update_duration(&track_id, seconds).await {
                    Ok(()) => {
                        info!(track = %track_id, seconds, "reported corrected duration");
                        if let Ok(tracks) = api.fetch_playlist().await {
                            let _ = playlist_tx.send(tracks);
                        }
                    }
                    Err(e) => warn!(track = %track_id, "duration report failed: {e}"),
                }
            });
        }
    }
}

fn spawn_playlist_refresh<A: RadioApi>(api: Arc<A>, tx: mpsc::UnboundedSender<Vec<Track>>) {
    tokio::spawn(async move {
        match api.fetch_playlist().await {
            Ok(tracks) => {
                let _ = tx.send(tracks);
            }
            Err(e) => warn!("playlist refresh failed: {e}"),
        }
    });
}

/// Asks a running listener for its status, `None` once it has stopped.
pub async fn query_status(commands: &mpsc::Sender<Command>, timeout: Duration) -> Option<Status> {
    let (tx, rx) = oneshot::channel();
    commands.send(Command::Status(tx)).await.ok()?;
    tokio::time::timeout(timeout, rx).await.ok()?.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::engine::SimulatedEngine;
    use crate::error::{ClientError, Result as ClientResult};
    use crate::track::track;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Station double whose answer is swapped by the test.
    struct ScriptedStation {
        answer: Mutex<Option<SyncResponse>>,
        playlist: Vec<Track>,
        reports: Mutex<Vec<(String, f64)>>,
        syncs: AtomicUsize,
    }

    impl ScriptedStation {
        fn new(answer: SyncResponse) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(answer)),
                playlist: vec![track("A", 180.0), track("B", 215.0)],
                reports: Mutex::new(Vec::new()),
                syncs: AtomicUsize::new(0),
            })
        }

        fn syncs(&self) -> usize {
            self.syncs.load(Ordering::SeqCst)
        }

        fn set(&self, answer: Option<SyncResponse>) {
            *self.answer.lock().unwrap() = answer;
        }
    }

    #[async_trait]
    impl RadioApi for ScriptedStation {
        async fn fetch_sync(&self) -> ClientResult<SyncResponse> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            self.answer
                .lock()
                .unwrap()
                .clone()
                .ok_or(ClientError::Status { status: 503, body: "down".into() })
        }

        async fn fetch_playlist(&self) -> ClientResult<Vec<Track>> {
            Ok(self.playlist.clone())
        }

        async fn update_duration(&self, track_id: &str, seconds: f64) -> ClientResult<()> {
            self.reports.lock().unwrap().push((track_id.to_string(), seconds));
            Ok(())
        }
    }

    fn at(id: &str, duration: f64, position: f64) -> SyncResponse {
        SyncResponse { current_song: Some(track(id, duration)), position, timestamp: 0, next_song: None }
    }

    fn config() -> ListenerConfig {
        ListenerConfig { poll_interval: Duration::from_secs(3), ..ListenerConfig::default() }
    }

    async fn status(commands: &mpsc::Sender<Command>) -> Status {
        query_status(commands, Duration::from_secs(1)).await.expect("listener running")
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_station_across_a_transition() {
        let station = ScriptedStation::new(at("A", 180.0, 20.0));
        let (engine, events) = SimulatedEngine::new(Duration::from_millis(100));
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(station.clone(), engine, events, rx, config()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let s = status(&tx).await;
        assert_eq!(s.state, SessionState::LivePlaying);
        assert_eq!(s.track.map(|t| t.id), Some("A".to_string()));
        assert_eq!(s.playlist.len(), 2);

        station.set(Some(at("B", 215.0, 1.0)));
        tokio::time::sleep(Duration::from_secs(4)).await;
        let s = status(&tx).await;
        assert_eq!(s.track.map(|t| t.id), Some("B".to_string()));

        tx.send(Command::Quit).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn station_down_at_startup_is_picked_up_by_heartbeat() {
        let station = ScriptedStation::new(at("A", 180.0, 20.0));
        station.set(None);
        let (engine, events) = SimulatedEngine::new(Duration::from_millis(100));
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(station.clone(), engine, events, rx, config()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let s = status(&tx).await;
        assert_eq!(s.state, SessionState::LivePlaying);
        assert!(s.track.is_none());

        station.set(Some(at("A", 180.0, 20.0)));
        tokio::time::sleep(Duration::from_secs(3)).await;
        let s = status(&tx).await;
        assert_eq!(s.state, SessionState::LivePlaying);
        assert_eq!(s.track.map(|t| t.id), Some("A".to_string()));

        tx.send(Command::Quit).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_track_is_reloaded_from_the_next_answer() {
        let station = ScriptedStation::new(at("A", 180.0, 20.0));
        let (engine, events) = SimulatedEngine::new(Duration::from_millis(100));
        let engine = engine.with_broken("A");
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(station.clone(), engine, events, rx, config()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let s = status(&tx).await;
        assert_eq!(s.state, SessionState::LivePlaying);
        assert!(s.track.is_none());

        station.set(Some(at("B", 215.0, 4.0)));
        tokio::time::sleep(Duration::from_secs(3)).await;
        let s = status(&tx).await;
        assert_eq!(s.track.map(|t| t.id), Some("B".to_string()));

        tx.send(Command::Quit).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn preview_never_talks_to_the_station() {
        let station = ScriptedStation::new(at("A", 180.0, 50.0));
        let (engine, events) = SimulatedEngine::new(Duration::ZERO);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(station.clone(), engine, events, rx, config()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(Command::PlayTrack("B".into())).await.unwrap();
        let before = station.syncs();
        assert_eq!(before, 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(station.syncs(), before);
        assert!(station.reports.lock().unwrap().is_empty());
        let s = status(&tx).await;
        assert_eq!(s.state, SessionState::PreviewPlaying);
        assert_eq!(s.track.map(|t| t.id), Some("B".to_string()));

        tx.send(Command::Quit).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn outage_keeps_local_playback_running() {
        let station = ScriptedStation::new(at("A", 180.0, 20.0));
        let (engine, events) = SimulatedEngine::new(Duration::ZERO);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(station.clone(), engine, events, rx, config()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        station.set(None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let s = status(&tx).await;
        assert_eq!(s.state, SessionState::LivePlaying);
        assert_eq!(s.track.map(|t| t.id), Some("A".to_string()));
        assert!(s.position > 25.0, "{}", s.position);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reports_measured_duration_once() {
        let station = ScriptedStation::new(at("A", 180.0, 0.0));
        let (engine, events) = SimulatedEngine::new(Duration::ZERO);
        let engine = engine.with_real_duration("A", 231.0);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(station.clone(), engine, events, rx, config()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*station.reports.lock().unwrap(), vec![("A".to_string(), 231.0)]);

        tx.send(Command::Quit).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn preview_then_back_to_live() {
        let station = ScriptedStation::new(at("A", 180.0, 50.0));
        let (engine, events) = SimulatedEngine::new(Duration::ZERO);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(station.clone(), engine, events, rx, config()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(Command::PlayTrack("B".into())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;
        let s = status(&tx).await;
        assert_eq!(s.state, SessionState::PreviewPlaying);
        assert_eq!(s.track.map(|t| t.id), Some("B".to_string()));

        tx.send(Command::GoLive).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let s = status(&tx).await;
        assert_eq!(s.state, SessionState::LivePlaying);
        assert_eq!(s.track.map(|t| t.id), Some("A".to_string()));

        tx.send(Command::Quit).await.unwrap();
        handle.await.unwrap();
    }
}
