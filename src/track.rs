use serde::{Deserialize, Serialize};

/// Cover art used when a track is created without one.
pub const DEFAULT_COVER_URL: &str =
    "https://images.unsplash.com/photo-1614613535308-eb5fbd3d2c17?w=500&q=60";

/// Declared duration used when a track is created without one (seconds).
pub const DEFAULT_DURATION_SECS: f64 = 180.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub title: String,
    /// Declared duration in seconds. Authoritative until a listener reports
    /// the real decoded length.
    pub duration: f64,
    pub audio_url: String,
    pub cover_url: String,
    pub genre: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl Track {
    /// Tracks with a non-positive (or NaN) duration never become active.
    pub fn is_schedulable(&self) -> bool {
        self.duration.is_finite() && self.duration > 0.0
    }
}

/// Body of a create request. Only `title` and `audio_url` are required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTrack {
    pub title: Option<String>,
    pub genre: Option<String>,
    pub duration: Option<f64>,
    pub audio_url: Option<String>,
    pub cover_url: Option<String>,
}

/// Partial update. Absent fields are left unchanged, which is what lets the
/// listener send a bare `{ "duration": 231 }` correction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
}

impl TrackPatch {
    pub fn duration_only(secs: f64) -> Self {
        Self { duration: Some(secs), ..Self::default() }
    }

    pub fn apply(&self, track: &mut Track) {
        if let Some(title) = non_blank(self.title.as_deref()) {
            track.title = title;
        }
        if let Some(genre) = non_blank(self.genre.as_deref()) {
            track.genre = genre;
        }
        if let Some(d) = self.duration {
            track.duration = d;
        }
        if let Some(url) = non_blank(self.audio_url.as_deref()) {
            track.audio_url = url;
        }
        if let Some(url) = non_blank(self.cover_url.as_deref()) {
            track.cover_url = url;
        }
    }
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Ordered station playlist. Order defines the loop sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Playlist {
    tracks: Vec<Track>,
}

impl Playlist {
    /// Builds a playlist, dropping any later track whose id repeats an
    /// earlier one so ids stay unique.
    pub fn new(tracks: Vec<Track>) -> Self {
        let mut seen = std::collections::HashSet::with_capacity(tracks.len());
        let tracks = tracks
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .collect();
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn first(&self) -> Option<&Track> {
        self.tracks.first()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == id)
    }

    pub fn find(&self, id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Next schedulable track strictly after `index`, wrapping around. May
    /// return `index` itself when it is the only schedulable track.
    pub fn next_schedulable_after(&self, index: usize) -> Option<usize> {
        let n = self.tracks.len();
        (1..=n)
            .map(|step| (index + step) % n)
            .find(|&i| self.tracks[i].is_schedulable())
    }

    /// First schedulable track at or after `index`, wrapping around.
    pub fn schedulable_from(&self, index: usize) -> Option<usize> {
        let n = self.tracks.len();
        (0..n)
            .map(|step| (index + step) % n)
            .find(|&i| self.tracks[i].is_schedulable())
    }

    pub fn into_tracks(self) -> Vec<Track> {
        self.tracks
    }
}

pub fn fmt_dur_mmss(total_s: f64) -> String {
    let total_s = total_s.max(0.0).round() as u64;
    let m = total_s / 60;
    let s = total_s % 60;
    format!("{}:{:02}", m, s)
}

#[cfg(test)]
pub(crate) fn track(id: &str, duration: f64) -> Track {
    Track {
        id: id.to_string(),
        title: format!("Track {id}"),
        duration,
        audio_url: format!("/media/{id}.mp3"),
        cover_url: DEFAULT_COVER_URL.to_string(),
        genre: "Test".to_string(),
        created_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_dropped() {
        let p = Playlist::new(vec![track("a", 10.0), track("b", 20.0), track("a", 30.0)]);
        assert_eq!(p.len(), 2);
        assert_eq!(p.find("a").map(|t| t.duration), Some(10.0));
    }

    #[test]
    fn next_schedulable_skips_zero_duration_and_wraps() {
        let p = Playlist::new(vec![track("a", 10.0), track("b", 0.0), track("c", 5.0)]);
        assert_eq!(p.next_schedulable_after(0), Some(2));
        assert_eq!(p.next_schedulable_after(2), Some(0));

        let solo = Playlist::new(vec![track("a", 10.0), track("b", 0.0)]);
        assert_eq!(solo.next_schedulable_after(0), Some(0));

        let silent = Playlist::new(vec![track("a", 0.0)]);
        assert_eq!(silent.next_schedulable_after(0), None);
        assert_eq!(silent.schedulable_from(0), None);
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let mut t = track("a", 180.0);
        let before = t.clone();
        TrackPatch::duration_only(231.0).apply(&mut t);
        assert_eq!(t.duration, 231.0);
        assert_eq!(t.title, before.title);
        assert_eq!(t.audio_url, before.audio_url);

        // Blank strings are ignored rather than wiping the field.
        TrackPatch { title: Some("  ".into()), ..TrackPatch::default() }.apply(&mut t);
        assert_eq!(t.title, before.title);
    }

    #[test]
    fn track_json_uses_camel_case_locators() {
        let v = serde_json::to_value(track("a", 1.0)).unwrap();
        assert!(v.get("audioUrl").is_some());
        assert!(v.get("coverUrl").is_some());
        assert!(v.get("createdAt").is_none());
    }

    #[test]
    fn durations_format_as_minutes_seconds() {
        assert_eq!(fmt_dur_mmss(242.0), "4:02");
        assert_eq!(fmt_dur_mmss(59.6), "1:00");
        assert_eq!(fmt_dur_mmss(-3.0), "0:00");
    }
}
