// --- Configuration ------------------------------------------------------------
//
// Everything comes from environment variables with working defaults, so a bare
// `stationsync` starts a station in the current directory and a bare
// `stationsync-listener` tunes into it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_DB_PATH: &str = "stationsync.db";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Served under `/media` when set.
    pub media_dir: Option<PathBuf>,
    /// Seed the demo playlist into an empty database.
    pub seed_demo: bool,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("STATIONSYNC_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()?;
        let db_path = std::env::var("STATIONSYNC_DB_PATH")
            .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
            .into();
        let media_dir = std::env::var("STATIONSYNC_MEDIA_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        Ok(Self {
            bind,
            db_path,
            media_dir,
            seed_demo: env_or("STATIONSYNC_SEED_DEMO", true),
        })
    }
}

/// Tuning for the client reconciliation loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub server_url: String,
    /// How often the sync endpoint is polled.
    pub poll_interval: Duration,
    /// Seconds of drift tolerated before seeking back to the server position.
    pub drift_tolerance: f64,
    /// Seconds of disagreement between declared and decoded duration that
    /// trigger a correction.
    pub duration_tolerance: f64,
    pub autoplay: bool,
    pub volume: f32,
    pub request_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            poll_interval: Duration::from_secs(3),
            drift_tolerance: 3.5,
            duration_tolerance: 2.0,
            autoplay: true,
            volume: 0.8,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ListenerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let poll_ms = env_or("STATIONSYNC_POLL_MS", d.poll_interval.as_millis() as u64).max(250);
        Self {
            server_url: std::env::var("STATIONSYNC_SERVER_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(d.server_url),
            poll_interval: Duration::from_millis(poll_ms),
            drift_tolerance: env_or("STATIONSYNC_DRIFT_TOLERANCE", d.drift_tolerance),
            duration_tolerance: env_or("STATIONSYNC_DURATION_TOLERANCE", d.duration_tolerance),
            autoplay: env_or("STATIONSYNC_AUTOPLAY", d.autoplay),
            volume: env_or("STATIONSYNC_VOLUME", d.volume).clamp(0.0, 1.0),
            request_timeout: d.request_timeout,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!("ignoring malformed {key}={raw:?}; using default");
            default
        }
    }
}
