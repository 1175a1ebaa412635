use playcord_core::display::{truncate_text, MAX_FIELD_LEN};
use playcord_core::{AppName, AssetsConfig, Track};
use serde::{Deserialize, Serialize};

/// Status blob handed to the presence client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub details: String,
    pub state: String,
    pub large_image_key: String,
    pub large_image_text: Option<String>,
    pub small_image_key: String,
    pub small_image_text: String,
    /// Unix milliseconds.
    pub start_timestamp: i64,
    /// Unix milliseconds.
    pub end_timestamp: i64,
}

pub fn payload_from_track(
    track: &Track,
    source: Option<AppName>,
    assets: &AssetsConfig,
) -> PresencePayload {
    let field = |text: &str| truncate_text(text, MAX_FIELD_LEN);
    let (start_timestamp, end_timestamp) = track.window_millis();
    let via = match source {
        Some(app) => format!("Via {}", app.display_name()),
        None => "Now playing".to_string(),
    };

    PresencePayload {
        details: field(&track.name),
        state: field(&format!("by {}", track.artist)),
        large_image_key: field(assets.large_image_for(source)),
        large_image_text: (!track.album.trim().is_empty()).then(|| field(&track.album)),
        small_image_key: field(&assets.small_play_image),
        small_image_text: field(&via),
        start_timestamp,
        end_timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::payload_from_track;
    use playcord_core::{AppName, AssetsConfig, Track};
    use std::time::{Duration, UNIX_EPOCH};

    fn song(album: &str) -> Track {
        Track::with_window(
            "Song A",
            "Artist X",
            album,
            true,
            Duration::from_secs(10),
            Some(Duration::from_secs(200)),
            UNIX_EPOCH + Duration::from_secs(1_000),
        )
    }

    #[test]
    fn maps_track_fields_and_window() {
        let payload = payload_from_track(&song("Album"), Some(AppName::ITunes), &AssetsConfig::default());
        assert_eq!(payload.details, "Song A");
        assert_eq!(payload.state, "by Artist X");
        assert_eq!(payload.large_image_key, "itunes_logo");
        assert_eq!(payload.large_image_text.as_deref(), Some("Album"));
        assert_eq!(payload.small_image_key, "play_icon");
        assert_eq!(payload.small_image_text, "Via iTunes");
        assert_eq!(payload.start_timestamp, 990_000);
        assert_eq!(payload.end_timestamp, 1_190_000);
    }

    #[test]
    fn apple_music_gets_its_own_logo() {
        let payload =
            payload_from_track(&song(""), Some(AppName::AppleMusic), &AssetsConfig::default());
        assert_eq!(payload.large_image_key, "apple_music_logo");
        assert_eq!(payload.large_image_text, None);
    }

    #[test]
    fn long_fields_are_cut_to_128_chars() {
        let mut track = song("Album");
        track.name = "é".repeat(300);
        let payload = payload_from_track(&track, None, &AssetsConfig::default());
        assert_eq!(payload.details.chars().count(), 128);
        assert!(payload.details.ends_with("..."));
        assert_eq!(payload.small_image_text, "Now playing");
    }
}
