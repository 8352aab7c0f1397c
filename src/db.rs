// --- Persistence (SQLite) -------------------------------------------------
//
// One database file holds both the playlist and the schedule pointer. The
// pointer lives in a single-row table (id = 1) and is written with an upsert,
// so a missing or garbled row simply means "not initialized yet".
//
// rusqlite is synchronous. Every call goes through `spawn_blocking` so a slow
// disk never stalls the tokio workers serving sync polls.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use rusqlite::Connection;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        db_init(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Runs `f` with exclusive access to the connection on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to join sqlite task: {e}"))?
    }

    /// Same as [`Database::call`] but on the current thread. Used by the
    /// schedule store, which is already invoked from blocking context.
    pub fn call_blocking<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))?;
        f(&mut guard)
    }
}

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS tracks (
            id         TEXT PRIMARY KEY,
            position   INTEGER NOT NULL,
            title      TEXT NOT NULL,
            duration   REAL NOT NULL,
            audio_url  TEXT NOT NULL,
            cover_url  TEXT NOT NULL,
            genre      TEXT NOT NULL,
            created_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_tracks_position ON tracks(position);

        CREATE TABLE IF NOT EXISTS schedule_state (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            track_id        TEXT NOT NULL,
            activated_at_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}
