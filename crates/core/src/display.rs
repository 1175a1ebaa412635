//! Text helpers shared by the presence payload and the status surfaces.

use crate::model::Track;
use std::time::{Duration, SystemTime};

/// Discord rejects activity strings longer than this.
pub const MAX_FIELD_LEN: usize = 128;

pub fn format_time(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, minutes, seconds) = (total / 3_600, (total % 3_600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

pub fn format_track_position(track_number: u32, track_count: u32) -> String {
    if track_number == 0 || track_count == 0 {
        return "-".to_string();
    }
    format!("{track_number} of {track_count}")
}

pub fn format_progress(track: &Track, now: SystemTime) -> String {
    let duration = track.duration();
    if !track.is_playing || duration.is_zero() {
        return "-".to_string();
    }
    format!(
        "{} / {}",
        format_time(track.elapsed(now)),
        format_time(duration)
    )
}

/// Cuts `text` to at most `max_len` characters, ending with `...` when cut.
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

pub fn rich_description(track: &Track) -> String {
    let mut description = format!("{} • {}", track.artist, track.album);
    if track.year > 0 {
        description.push_str(&format!(" ({})", track.year));
    }
    if !track.genre.is_empty() {
        description.push_str(&format!(" • {}", track.genre));
    }
    truncate_text(&description, MAX_FIELD_LEN)
}
