use crate::{AdapterError, TrackAdapter};
use async_trait::async_trait;
use playcord_core::{AppName, DetectedApp, Track, UNKNOWN_ARTIST};
use std::time::{Duration, SystemTime};

const SEPARATORS: [&str; 3] = [" - ", " – ", " — "];

/// Titles without a separator shorter than this are ignored.
const MIN_BARE_TITLE_LEN: usize = 5;

/// Lowest-trust adapter: reads `artist - title` out of the player's window title.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowTitleAdapter;

#[async_trait]
impl TrackAdapter for WindowTitleAdapter {
    fn name(&self) -> &'static str {
        "window_title"
    }

    async fn try_get_track(
        &mut self,
        hint: Option<&DetectedApp>,
    ) -> Result<Option<Track>, AdapterError> {
        Ok(hint.and_then(|app| {
            parse_window_title(&app.window_title, app.app_name, SystemTime::now())
        }))
    }
}

pub fn parse_window_title(title: &str, app: AppName, now: SystemTime) -> Option<Track> {
    let title = title.trim();
    if title.is_empty() || app.is_bare_title(title) || title.contains("Microsoft Store") {
        return None;
    }

    for separator in SEPARATORS {
        let mut parts = title
            .split(separator)
            .map(str::trim)
            .filter(|p| !p.is_empty());
        if let (Some(artist), Some(name)) = (parts.next(), parts.next()) {
            return Some(Track::with_window(
                name,
                artist,
                "",
                true,
                Duration::ZERO,
                None,
                now,
            ));
        }
    }

    if title.chars().count() > MIN_BARE_TITLE_LEN {
        return Some(Track::with_window(
            title,
            UNKNOWN_ARTIST,
            "",
            true,
            Duration::ZERO,
            None,
            now,
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{parse_window_title, WindowTitleAdapter};
    use crate::TrackAdapter;
    use playcord_core::{AppName, DetectedApp, DEFAULT_TRACK_DURATION, UNKNOWN_ARTIST};
    use std::time::SystemTime;

    fn parse(title: &str) -> Option<(String, String)> {
        parse_window_title(title, AppName::Spotify, SystemTime::now())
            .map(|t| (t.artist, t.name))
    }

    #[test]
    fn artist_dash_title_is_canonical() {
        assert_eq!(
            parse("Artist X - Song A"),
            Some(("Artist X".to_string(), "Song A".to_string()))
        );
    }

    #[test]
    fn dash_variants_are_accepted() {
        assert_eq!(
            parse("Artist X – Song A"),
            Some(("Artist X".to_string(), "Song A".to_string()))
        );
        assert_eq!(
            parse("Artist X — Song A"),
            Some(("Artist X".to_string(), "Song A".to_string()))
        );
    }

    #[test]
    fn bare_app_name_is_not_a_track() {
        assert_eq!(parse("Spotify"), None);
        assert_eq!(parse("SPOTIFY"), None);
        assert_eq!(parse("   "), None);
        assert_eq!(parse("Microsoft Store - Apps"), None);
    }

    #[test]
    fn long_titles_without_separator_become_name_only() {
        let track = parse_window_title("Podcast episode 12", AppName::Vlc, SystemTime::now())
            .expect("track");
        assert_eq!(track.name, "Podcast episode 12");
        assert_eq!(track.artist, UNKNOWN_ARTIST);
        assert!(track.is_playing);
        assert_eq!(track.duration(), DEFAULT_TRACK_DURATION);
        assert_eq!(parse("Intro"), None);
    }

    #[tokio::test]
    async fn adapter_needs_a_hint() {
        let mut adapter = WindowTitleAdapter;
        assert!(adapter.try_get_track(None).await.expect("ok").is_none());

        let app = DetectedApp::new(AppName::Spotify, 9, "Artist X - Song A");
        let track = adapter
            .try_get_track(Some(&app))
            .await
            .expect("ok")
            .expect("track");
        assert_eq!(track.name, "Song A");
    }
}
