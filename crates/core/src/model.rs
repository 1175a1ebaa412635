use crate::apps::AppName;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Window assumed for a track whose source does not report a duration.
pub const DEFAULT_TRACK_DURATION: Duration = Duration::from_secs(180);

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Snapshot of one piece of currently (or recently) playing audio.
///
/// Equality only looks at `name`, `artist`, `album` and `is_playing`;
/// artwork, the playback window and the numeric tags are ignored so that a
/// re-read of the same track never counts as a change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub year: u32,
    pub track_number: u32,
    pub track_count: u32,
    pub artwork_path: Option<PathBuf>,
    /// Player the adapter could attribute the track to, if any.
    pub source_app: Option<AppName>,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub is_playing: bool,
}

impl Track {
    /// Builds a track whose window is derived from the player position.
    ///
    /// A missing or zero duration falls back to [`DEFAULT_TRACK_DURATION`],
    /// so `end_time >= start_time` always holds.
    pub fn with_window(
        name: impl Into<String>,
        artist: impl Into<String>,
        album: impl Into<String>,
        is_playing: bool,
        position: Duration,
        duration: Option<Duration>,
        now: SystemTime,
    ) -> Self {
        let duration = duration
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_TRACK_DURATION);
        let start_time = now.checked_sub(position.min(duration)).unwrap_or(now);
        Self {
            name: name.into(),
            artist: artist.into(),
            album: album.into(),
            genre: String::new(),
            year: 0,
            track_number: 0,
            track_count: 0,
            artwork_path: None,
            source_app: None,
            start_time,
            end_time: start_time + duration,
            is_playing,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }

    pub fn elapsed(&self, now: SystemTime) -> Duration {
        now.duration_since(self.start_time)
            .unwrap_or_default()
            .min(self.duration())
    }

    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.duration().saturating_sub(self.elapsed(now))
    }

    pub fn progress_percent(&self, now: SystemTime) -> f64 {
        if !self.is_playing {
            return 0.0;
        }
        let total = self.duration().as_secs_f64();
        if total <= 0.0 {
            return 0.0;
        }
        (self.elapsed(now).as_secs_f64() / total * 100.0).clamp(0.0, 100.0)
    }

    /// Playback window as unix milliseconds.
    pub fn window_millis(&self) -> (i64, i64) {
        (unix_millis(self.start_time), unix_millis(self.end_time))
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.artist == other.artist
            && self.album == other.album
            && self.is_playing == other.is_playing
    }
}

impl Eq for Track {}

fn unix_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{Track, DEFAULT_TRACK_DURATION};
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn track(name: &str, playing: bool) -> Track {
        Track::with_window(
            name,
            "Artist X",
            "Album",
            playing,
            Duration::from_secs(10),
            Some(Duration::from_secs(200)),
            at(1_000),
        )
    }

    #[test]
    fn equality_ignores_timestamps_artwork_and_tags() {
        let a = track("Song A", true);
        let mut b = Track::with_window(
            "Song A",
            "Artist X",
            "Album",
            true,
            Duration::from_secs(90),
            None,
            at(5_000),
        );
        b.artwork_path = Some(PathBuf::from("/tmp/playcord/artwork_1.jpg"));
        b.source_app = Some(crate::AppName::Vlc);
        b.year = 1999;
        b.track_number = 4;
        b.genre = "Rock".to_string();

        assert_eq!(a, b);
    }

    #[test]
    fn equality_is_case_sensitive_and_tracks_play_state() {
        assert_ne!(track("Song A", true), track("song a", true));
        assert_ne!(track("Song A", true), track("Song A", false));
    }

    #[test]
    fn missing_duration_synthesizes_default_window() {
        let t = Track::with_window("x", "y", "z", true, Duration::ZERO, None, at(100));
        assert_eq!(t.duration(), DEFAULT_TRACK_DURATION);
        assert!(t.end_time >= t.start_time);
    }

    #[test]
    fn window_is_anchored_on_position() {
        let t = track("Song A", true);
        assert_eq!(t.start_time, at(990));
        assert_eq!(t.end_time, at(1_190));
        assert_eq!(t.window_millis(), (990_000, 1_190_000));
    }

    #[test]
    fn progress_is_clamped() {
        let t = track("Song A", true);
        assert_eq!(t.elapsed(at(980)), Duration::ZERO);
        assert_eq!(t.remaining(at(5_000)), Duration::ZERO);
        assert_eq!(t.progress_percent(at(5_000)), 100.0);
        assert_eq!(track("Song A", false).progress_percent(at(1_050)), 0.0);
    }
}
