use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level polling group the arbitrator chooses between.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceFamily {
    LegacyApp,
    MediaSession,
}

impl SourceFamily {
    pub const ALL: [SourceFamily; 2] = [SourceFamily::LegacyApp, SourceFamily::MediaSession];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceFamily::LegacyApp => "legacy_app",
            SourceFamily::MediaSession => "media_session",
        }
    }

    pub fn other(self) -> SourceFamily {
        match self {
            SourceFamily::LegacyApp => SourceFamily::MediaSession,
            SourceFamily::MediaSession => SourceFamily::LegacyApp,
        }
    }

    pub fn supports(self, app: AppName) -> bool {
        app.family() == self
    }

    /// Whether a tick needs a detected process before querying its source.
    ///
    /// The media-session registry lists sessions of players the detector has
    /// no process name for, so that family is queried regardless.
    pub fn needs_running_app(self) -> bool {
        matches!(self, SourceFamily::LegacyApp)
    }
}

impl fmt::Display for SourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical names of the players the detector knows about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppName {
    AppleMusic,
    ITunes,
    Spotify,
    Vlc,
    WindowsMediaPlayer,
}

/// Extra media-session identifiers accepted when no hint narrows the search.
pub const GENERIC_SESSION_IDS: [&str; 4] = ["AIMP", "foobar2000", "MusicBee", "Winamp"];

impl AppName {
    pub const ALL: [AppName; 5] = [
        AppName::AppleMusic,
        AppName::ITunes,
        AppName::Spotify,
        AppName::Vlc,
        AppName::WindowsMediaPlayer,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            AppName::AppleMusic => "Apple Music",
            AppName::ITunes => "iTunes",
            AppName::Spotify => "Spotify",
            AppName::Vlc => "VLC",
            AppName::WindowsMediaPlayer => "Windows Media Player",
        }
    }

    /// Static rank, higher wins when several players are open at once.
    pub fn priority(self) -> u8 {
        match self {
            AppName::AppleMusic => 100,
            AppName::ITunes => 90,
            AppName::Spotify => 80,
            AppName::Vlc => 70,
            AppName::WindowsMediaPlayer => 60,
        }
    }

    pub fn process_names(self) -> &'static [&'static str] {
        match self {
            AppName::AppleMusic => &["Music", "AppleMusic", "Microsoft.ZuneMusic", "ZuneMusic"],
            AppName::ITunes => &["iTunes"],
            AppName::Spotify => &["Spotify"],
            AppName::Vlc => &["vlc"],
            AppName::WindowsMediaPlayer => &["wmplayer", "MediaPlayer"],
        }
    }

    pub fn media_session_ids(self) -> &'static [&'static str] {
        match self {
            AppName::AppleMusic => &[
                "Microsoft.ZuneMusic",
                "ZuneMusic",
                "AppleMusic",
                "com.apple.music",
            ],
            AppName::ITunes => &["iTunes", "com.apple.itunes"],
            AppName::Spotify => &["Spotify", "com.spotify.client"],
            AppName::Vlc => &["vlc", "VideoLAN.VLCMediaPlayer"],
            AppName::WindowsMediaPlayer => &["wmplayer", "Microsoft.WindowsMediaPlayer"],
        }
    }

    pub fn family(self) -> SourceFamily {
        match self {
            AppName::ITunes => SourceFamily::LegacyApp,
            #[cfg(target_os = "macos")]
            AppName::AppleMusic => SourceFamily::LegacyApp,
            _ => SourceFamily::MediaSession,
        }
    }

    /// Maps an OS process name (with or without `.exe`) to a registry entry.
    pub fn from_process_name(process: &str) -> Option<AppName> {
        let trimmed = process.trim();
        let stem = trimmed
            .strip_suffix(".exe")
            .or_else(|| trimmed.strip_suffix(".EXE"))
            .unwrap_or(trimmed);
        AppName::ALL.into_iter().find(|app| {
            app.process_names()
                .iter()
                .any(|name| name.eq_ignore_ascii_case(stem))
        })
    }

    /// Registry entry whose media-session identifiers occur in `source_app_id`,
    /// case-insensitively. The highest-priority match wins.
    pub fn from_session_id(source_app_id: &str) -> Option<AppName> {
        let source = source_app_id.to_lowercase();
        AppName::ALL.into_iter().find(|app| {
            app.media_session_ids()
                .iter()
                .any(|id| source.contains(&id.to_lowercase()))
        })
    }

    /// True when `title` carries no track information for this app.
    pub fn is_bare_title(self, title: &str) -> bool {
        let title = title.trim();
        title.eq_ignore_ascii_case(self.display_name())
            || self
                .process_names()
                .iter()
                .any(|name| name.eq_ignore_ascii_case(title))
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A supported player found running during one detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedApp {
    pub app_name: AppName,
    pub process_identifier: u32,
    pub window_title: String,
    pub priority: u8,
}

impl DetectedApp {
    pub fn new(app_name: AppName, process_identifier: u32, window_title: impl Into<String>) -> Self {
        Self {
            app_name,
            process_identifier,
            window_title: window_title.into(),
            priority: app_name.priority(),
        }
    }
}

impl fmt::Display for DetectedApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.app_name, self.process_identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::{AppName, SourceFamily};

    #[test]
    fn process_names_match_case_insensitively() {
        assert_eq!(AppName::from_process_name("iTunes.exe"), Some(AppName::ITunes));
        assert_eq!(AppName::from_process_name("SPOTIFY"), Some(AppName::Spotify));
        assert_eq!(AppName::from_process_name("vlc"), Some(AppName::Vlc));
        assert_eq!(AppName::from_process_name("firefox"), None);
    }

    #[test]
    fn priorities_follow_registry_order() {
        let ranks: Vec<u8> = AppName::ALL.iter().map(|a| a.priority()).collect();
        let mut sorted = ranks.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(ranks, sorted);
    }

    #[test]
    fn itunes_is_legacy_family() {
        assert_eq!(AppName::ITunes.family(), SourceFamily::LegacyApp);
        assert!(SourceFamily::MediaSession.supports(AppName::Spotify));
        assert!(!SourceFamily::LegacyApp.supports(AppName::Vlc));
        assert_eq!(SourceFamily::LegacyApp.other(), SourceFamily::MediaSession);
    }

    #[test]
    fn session_ids_map_back_to_apps() {
        assert_eq!(AppName::from_session_id("vlc.exe"), Some(AppName::Vlc));
        assert_eq!(
            AppName::from_session_id("org.mpris.MediaPlayer2.spotify"),
            Some(AppName::Spotify)
        );
        assert_eq!(
            AppName::from_session_id("Microsoft.ZuneMusic_8wekyb3d8bbwe!Microsoft.ZuneMusic"),
            Some(AppName::AppleMusic)
        );
        assert_eq!(AppName::from_session_id("foobar2000.exe"), None);
    }

    #[test]
    fn only_the_legacy_family_waits_for_a_process() {
        assert!(SourceFamily::LegacyApp.needs_running_app());
        assert!(!SourceFamily::MediaSession.needs_running_app());
    }

    #[test]
    fn bare_titles_are_detected() {
        assert!(AppName::Spotify.is_bare_title("Spotify"));
        assert!(AppName::AppleMusic.is_bare_title("music"));
        assert!(!AppName::Spotify.is_bare_title("Artist X - Song A"));
    }
}
