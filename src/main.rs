use std::sync::Arc;

use tracing::{info, warn};

use stationsync::api::{build_router, AppState};
use stationsync::clock::SystemClock;
use stationsync::config::ServerConfig;
use stationsync::db::Database;
use stationsync::playlist::{demo_tracks, PlaylistRepo};
use stationsync::station::Station;
use stationsync::store::SqliteScheduleStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let config = ServerConfig::from_env()?;

    let db = Database::open(&config.db_path)?;
    info!("database at {}", config.db_path.display());

    let playlist = PlaylistRepo::new(db.clone());
    if config.seed_demo && playlist.seed_if_empty(demo_tracks()).await? {
        info!("seeded demo playlist");
    }

    let station = Station::new(playlist, Arc::new(SqliteScheduleStore::new(db)), Arc::new(SystemClock));

    // Resolve the schedule once so the log shows what is on air at boot.
    match station.sync().await {
        Ok(now) => match &now.current_song {
            Some(track) => info!(title = %track.title, position = now.position, "on air"),
            None => warn!("playlist is empty; nothing on air"),
        },
        Err(e) => warn!("initial schedule resolution failed: {e:#}"),
    }

    let state = AppState { version, station };
    let app = build_router(state, config.media_dir.clone());

    // Bind loopback by default; put a reverse proxy in front for LAN/Internet.
    let addr = config.bind;
    info!("stationsync starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
