// --- Playlist source --------------------------------------------------------
//
// Ordered track table. The schedule only ever reads it; everything here that
// mutates is the administrative surface (and the listener's duration
// correction, which goes through `update`).
//
// Writes rewrite positions inside one transaction so ordering stays
// consistent even if the process dies mid-request.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::clock::unix_millis_now;
use crate::db::Database;
use crate::track::{NewTrack, Playlist, Track, TrackPatch, DEFAULT_COVER_URL, DEFAULT_DURATION_SECS};

#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("track not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct PlaylistRepo {
    db: Database,
}

impl PlaylistRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn load(&self) -> anyhow::Result<Playlist> {
        self.db.call(|conn| db_load_tracks(conn).map(Playlist::new)).await
    }

    pub async fn create(&self, req: NewTrack) -> Result<Track, PlaylistError> {
        let title = req
            .title
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PlaylistError::Invalid("title is required".into()))?
            .to_string();
        let audio_url = req
            .audio_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PlaylistError::Invalid("audioUrl is required".into()))?
            .to_string();

        let duration = match req.duration {
            Some(d) if d.is_finite() && d > 0.0 => d,
            Some(d) if !d.is_finite() || d < 0.0 => {
                return Err(PlaylistError::Invalid(format!("invalid duration: {d}")));
            }
            _ => DEFAULT_DURATION_SECS,
        };

        let track = Track {
            id: Uuid::new_v4().to_string(),
            title,
            duration,
            audio_url,
            cover_url: req
                .cover_url
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_COVER_URL.to_string()),
            genre: req
                .genre
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            created_at: Some(unix_millis_now()),
        };

        let to_insert = track.clone();
        self.db
            .call(move |conn| {
                let next: i64 =
                    conn.query_row("SELECT COALESCE(MAX(position) + 1, 0) FROM tracks", [], |r| r.get(0))?;
                db_insert_track(conn, &to_insert, next)?;
                Ok(())
            })
            .await?;

        tracing::info!(id = %track.id, title = %track.title, "track added to playlist");
        Ok(track)
    }

    /// Applies `patch` to one track, leaving absent fields unchanged.
    pub async fn update(&self, id: &str, patch: TrackPatch) -> Result<Track, PlaylistError> {
        if let Some(d) = patch.duration {
            if !d.is_finite() || d <= 0.0 {
                return Err(PlaylistError::Invalid(format!("invalid duration: {d}")));
            }
        }

        let owned = id.to_string();
        let updated = self
            .db
            .call(move |conn| {
                let Some(mut track) = db_get_track(conn, &owned)? else {
                    return Ok(None);
                };
                patch.apply(&mut track);
                conn.execute(
                    "UPDATE tracks SET title = ?2, duration = ?3, audio_url = ?4, cover_url = ?5, genre = ?6
                     WHERE id = ?1",
                    params![track.id, track.title, track.duration, track.audio_url, track.cover_url, track.genre],
                )?;
                Ok(Some(track))
            })
            .await?;

        updated.ok_or_else(|| PlaylistError::NotFound(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> Result<(), PlaylistError> {
        let owned = id.to_string();
        let removed = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute("DELETE FROM tracks WHERE id = ?1", params![owned])?;
                if n > 0 {
                    renumber_positions(&tx)?;
                }
                tx.commit()?;
                Ok(n)
            })
            .await?;

        if removed == 0 {
            return Err(PlaylistError::NotFound(id.to_string()));
        }
        tracing::info!(id, "track removed from playlist");
        Ok(())
    }

    /// Replaces the loop order. `order` must be a permutation of the current ids.
    pub async fn reorder(&self, order: Vec<String>) -> Result<Playlist, PlaylistError> {
        let result = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current = db_load_tracks(&tx)?;
                if let Err(msg) = validate_permutation(&current, &order) {
                    return Ok(Err(msg));
                }
                for (position, id) in order.iter().enumerate() {
                    tx.execute("UPDATE tracks SET position = ?2 WHERE id = ?1", params![id, position as i64])?;
                }
                let reordered = db_load_tracks(&tx)?;
                tx.commit()?;
                Ok(Ok(Playlist::new(reordered)))
            })
            .await?;
        result.map_err(PlaylistError::Invalid)
    }

    /// Seeds the table the first time the station starts.
    pub async fn seed_if_empty(&self, tracks: Vec<Track>) -> anyhow::Result<bool> {
        self.db
            .call(move |conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM tracks", [], |r| r.get(0))?;
                if count > 0 {
                    return Ok(false);
                }
                let tx = conn.transaction()?;
                for (position, track) in tracks.iter().enumerate() {
                    db_insert_track(&tx, track, position as i64)?;
                }
                tx.commit()?;
                Ok(true)
            })
            .await
    }
}

fn validate_permutation(current: &[Track], order: &[String]) -> Result<(), String> {
    if order.len() != current.len() {
        return Err(format!("expected {} ids, got {}", current.len(), order.len()));
    }
    let known: HashSet<&str> = current.iter().map(|t| t.id.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(order.len());
    for id in order {
        if !seen.insert(id.as_str()) {
            return Err(format!("duplicate id: {id}"));
        }
        if !known.contains(id.as_str()) {
            return Err(format!("unknown id: {id}"));
        }
    }
    Ok(())
}

fn db_load_tracks(conn: &Connection) -> anyhow::Result<Vec<Track>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, duration, audio_url, cover_url, genre, created_at FROM tracks ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([], row_to_track)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn db_get_track(conn: &Connection, id: &str) -> anyhow::Result<Option<Track>> {
    Ok(conn
        .query_row(
            "SELECT id, title, duration, audio_url, cover_url, genre, created_at FROM tracks WHERE id = ?1",
            params![id],
            row_to_track,
        )
        .optional()?)
}

fn row_to_track(row: &rusqlite::Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        title: row.get(1)?,
        duration: row.get(2)?,
        audio_url: row.get(3)?,
        cover_url: row.get(4)?,
        genre: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn db_insert_track(conn: &Connection, track: &Track, position: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO tracks (id, position, title, duration, audio_url, cover_url, genre, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            track.id,
            position,
            track.title,
            track.duration,
            track.audio_url,
            track.cover_url,
            track.genre,
            track.created_at,
        ],
    )?;
    Ok(())
}

fn renumber_positions(conn: &Connection) -> anyhow::Result<()> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM tracks ORDER BY position ASC")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for (position, id) in ids.iter().enumerate() {
        conn.execute("UPDATE tracks SET position = ?2 WHERE id = ?1", params![id, position as i64])?;
    }
    Ok(())
}

/// Tracks a fresh install starts with.
pub fn demo_tracks() -> Vec<Track> {
    let demo = [
        ("1", "Orizont Neon", 180.0, "SoundHelix-Song-1", "photo-1614613535308-eb5fbd3d2c17", "Synthwave"),
        ("2", "Vise Cibernetice", 215.0, "SoundHelix-Song-2", "photo-1550745165-9bc0b252726f", "Cyberpunk"),
        ("3", "Ploaie Digitală", 195.0, "SoundHelix-Song-3", "photo-1515630278258-407f66498911", "Ambient"),
        ("4", "Viitorul Moldovei", 240.0, "SoundHelix-Song-4", "photo-1470225620780-dba8ba36b745", "Pop"),
        ("5", "Bas Neural", 170.0, "SoundHelix-Song-8", "photo-1493225255756-d9584f8606e9", "Drum & Bass"),
    ];
    demo.into_iter()
        .map(|(id, title, duration, audio, cover, genre)| Track {
            id: id.to_string(),
            title: title.to_string(),
            duration,
            audio_url: format!("https://www.soundhelix.com/examples/mp3/{audio}.mp3"),
            cover_url: format!("https://images.unsplash.com/{cover}?w=500&auto=format&fit=crop&q=60"),
            genre: genre.to_string(),
            created_at: None,
        })
        .collect()
}
