// --- Schedule state store ---------------------------------------------------
//
// Holds the single schedule pointer. The only mutator is the sync path's
// read-decide-write, and `update` is the one place that performs it: the
// whole cycle runs under the store's lock, so concurrent polls that all see a
// finished track produce exactly one advance. The SQLite write is also a
// compare-and-swap on the previous value, which keeps a second process
// sharing the file from double-advancing either.
//
// Methods are blocking; async callers go through `spawn_blocking`.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::Database;
use crate::schedule::ScheduleRef;

/// Result of an atomic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Updated {
    pub previous: ScheduleRef,
    pub current: ScheduleRef,
}

impl Updated {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

pub trait ScheduleStore: Send + Sync + 'static {
    /// Current reference, or the unset default if none was ever written.
    fn read(&self) -> anyhow::Result<ScheduleRef>;

    /// Last-write-wins overwrite.
    fn write(&self, reference: &ScheduleRef) -> anyhow::Result<()>;

    /// Reads the reference, lets `decide` pick a replacement, and persists it,
    /// all as one step with respect to every other caller of this store.
    fn update(
        &self,
        decide: &mut dyn FnMut(&ScheduleRef) -> Option<ScheduleRef>,
    ) -> anyhow::Result<Updated>;
}

fn lock<T>(m: &Mutex<T>) -> anyhow::Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow::anyhow!("schedule store mutex poisoned"))
}

// --- In-memory ------------------------------------------------------------

/// Process-local store. Loses the pointer on restart, which the schedule
/// tolerates by restarting from the head of the playlist.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    inner: Mutex<ScheduleRef>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference(reference: ScheduleRef) -> Self {
        Self { inner: Mutex::new(reference) }
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn read(&self) -> anyhow::Result<ScheduleRef> {
        Ok(lock(&self.inner)?.clone())
    }

    fn write(&self, reference: &ScheduleRef) -> anyhow::Result<()> {
        *lock(&self.inner)? = reference.clone();
        Ok(())
    }

    fn update(
        &self,
        decide: &mut dyn FnMut(&ScheduleRef) -> Option<ScheduleRef>,
    ) -> anyhow::Result<Updated> {
        let mut guard = lock(&self.inner)?;
        let previous = guard.clone();
        if let Some(next) = decide(&previous) {
            *guard = next;
        }
        Ok(Updated { previous, current: guard.clone() })
    }
}

// --- SQLite -----------------------------------------------------------------

/// Gives up after this many lost compare-and-swap races within one update.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Durable store with a process-local cache in front of it.
///
/// The cache is only ever filled from a successful DB read or write, and is
/// cleared whenever a write fails or loses a race, so the file stays the
/// source of truth across restarts.
pub struct SqliteScheduleStore {
    db: Database,
    cache: Mutex<Option<ScheduleRef>>,
}

impl SqliteScheduleStore {
    pub fn new(db: Database) -> Self {
        Self { db, cache: Mutex::new(None) }
    }

    fn load(&self) -> anyhow::Result<ScheduleRef> {
        self.db.call_blocking(|conn| db_load_schedule(conn))
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn read(&self) -> anyhow::Result<ScheduleRef> {
        let mut cache = lock(&self.cache)?;
        if let Some(hit) = cache.as_ref() {
            return Ok(hit.clone());
        }
        let loaded = self.load()?;
        *cache = Some(loaded.clone());
        Ok(loaded)
    }

    fn write(&self, reference: &ScheduleRef) -> anyhow::Result<()> {
        let mut cache = lock(&self.cache)?;
        let owned = reference.clone();
        match self.db.call_blocking(move |conn| db_save_schedule(conn, &owned)) {
            Ok(()) => {
                *cache = Some(reference.clone());
                Ok(())
            }
            Err(e) => {
                *cache = None;
                Err(e)
            }
        }
    }

    fn update(
        &self,
        decide: &mut dyn FnMut(&ScheduleRef) -> Option<ScheduleRef>,
    ) -> anyhow::Result<Updated> {
        // Holding the cache lock for the whole cycle is what serializes
        // concurrent sync requests in this process.
        let mut cache = lock(&self.cache)?;
        let mut previous = match cache.as_ref() {
            Some(hit) => hit.clone(),
            None => self.load()?,
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(next) = decide(&previous).filter(|next| *next != previous) else {
                *cache = Some(previous.clone());
                return Ok(Updated { current: previous.clone(), previous });
            };

            let expected = previous.clone();
            let candidate = next.clone();
            let swapped = self
                .db
                .call_blocking(move |conn| db_swap_schedule(conn, &expected, &candidate));

            match swapped {
                Ok(true) => {
                    *cache = Some(next.clone());
                    return Ok(Updated { previous, current: next });
                }
                Ok(false) => {
                    // Someone else (another process on the same file) moved
                    // the pointer first. Decide again against what they wrote.
                    tracing::debug!("schedule compare-and-swap lost; reloading");
                    *cache = None;
                    previous = self.load()?;
                }
                Err(e) => {
                    *cache = None;
                    return Err(e);
                }
            }
        }

        *cache = None;
        anyhow::bail!("schedule update kept losing compare-and-swap after {MAX_CAS_ATTEMPTS} attempts")
    }
}

fn db_load_schedule(conn: &Connection) -> anyhow::Result<ScheduleRef> {
    let row = conn
        .query_row(
            "SELECT track_id, activated_at_ms FROM schedule_state WHERE id = 1",
            [],
            |row| Ok(ScheduleRef::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional();

    match row {
        Ok(Some(r)) => Ok(r),
        Ok(None) => Ok(ScheduleRef::default()),
        // A row with the wrong column types is treated as absent; the next
        // sync rebuilds it from the playlist head.
        Err(e @ (rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::FromSqlConversionFailure(..))) => {
            tracing::warn!("schedule state row unreadable, starting over: {e}");
            Ok(ScheduleRef::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn db_save_schedule(conn: &Connection, r: &ScheduleRef) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO schedule_state (id, track_id, activated_at_ms)
         VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
           track_id=excluded.track_id,
           activated_at_ms=excluded.activated_at_ms",
        params![r.track_id, r.activated_at_ms],
    )?;
    Ok(())
}

/// Writes `next` only if the stored row still equals `expected`.
fn db_swap_schedule(conn: &mut Connection, expected: &ScheduleRef, next: &ScheduleRef) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let stored = db_load_schedule(&tx)?;
    if stored != *expected {
        return Ok(false);
    }
    db_save_schedule(&tx, next)?;
    tx.commit()?;
    Ok(true)
}
