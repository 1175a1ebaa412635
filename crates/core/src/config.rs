use crate::apps::AppName;
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigIntervals {
    pub legacy_poll_ms: u64,
    pub media_poll_ms: u64,
    pub adapter_timeout_ms: u64,
    pub reconnect_ms: u64,
    pub reconnect_delay_ms: u64,
    pub artwork_sweep_ms: u64,
    pub file_watch_poll_ms: u64,
}

impl Default for ConfigIntervals {
    fn default() -> Self {
        Self {
            legacy_poll_ms: 1_000,
            media_poll_ms: 2_000,
            adapter_timeout_ms: 3_000,
            reconnect_ms: 30_000,
            reconnect_delay_ms: 1_000,
            artwork_sweep_ms: 600_000,
            file_watch_poll_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    pub failure_threshold: u32,
    pub multiplier: u32,
    pub cooldown_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            multiplier: 5,
            cooldown_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArtworkConfig {
    pub max_age_secs: u64,
}

impl Default for ArtworkConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationMode {
    #[default]
    LastPlayingWins,
    Priority,
}

impl std::str::FromStr for ArbitrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last_playing_wins" | "last" => Ok(ArbitrationMode::LastPlayingWins),
            "priority" => Ok(ArbitrationMode::Priority),
            other => Err(format!("unknown arbitration mode {other:?}")),
        }
    }
}

/// Toggles owned by the presentation layer; the engine only reads them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiToggles {
    pub auto_start: bool,
    pub minimize_to_tray: bool,
    pub notify_on_change: bool,
    pub check_updates_on_start: bool,
    pub update_feed_url: Option<String>,
}

impl Default for UiToggles {
    fn default() -> Self {
        Self {
            auto_start: false,
            minimize_to_tray: true,
            notify_on_change: true,
            check_updates_on_start: false,
            update_feed_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssetsConfig {
    pub apple_music_image: String,
    pub default_image: String,
    pub small_play_image: String,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            apple_music_image: "apple_music_logo".to_string(),
            default_image: "itunes_logo".to_string(),
            small_play_image: "play_icon".to_string(),
        }
    }
}

impl AssetsConfig {
    pub fn large_image_for(&self, app: Option<AppName>) -> &str {
        match app {
            Some(AppName::AppleMusic) => &self.apple_music_image,
            _ => &self.default_image,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub discord_app_id: String,
    pub intervals: ConfigIntervals,
    pub backoff: BackoffConfig,
    pub artwork: ArtworkConfig,
    pub arbitration: ArbitrationMode,
    pub ui: UiToggles,
    pub log_level: String,
    pub assets: AssetsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            discord_app_id: "1369005012486852649".to_string(),
            intervals: ConfigIntervals::default(),
            backoff: BackoffConfig::default(),
            artwork: ArtworkConfig::default(),
            arbitration: ArbitrationMode::default(),
            ui: UiToggles::default(),
            log_level: "info".to_string(),
            assets: AssetsConfig::default(),
        }
    }
}

/// A setting that is missing or out of range. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigIssue {
    #[error("discord_app_id is empty; presence publishing will fail")]
    MissingAppId,
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("update checks are enabled but ui.update_feed_url is not set")]
    MissingUpdateFeed,
}

impl AppConfig {
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.discord_app_id.trim().is_empty() {
            issues.push(ConfigIssue::MissingAppId);
        }
        let non_zero = [
            ("intervals.legacy_poll_ms", self.intervals.legacy_poll_ms),
            ("intervals.media_poll_ms", self.intervals.media_poll_ms),
            ("intervals.adapter_timeout_ms", self.intervals.adapter_timeout_ms),
            ("intervals.reconnect_ms", self.intervals.reconnect_ms),
            ("backoff.failure_threshold", u64::from(self.backoff.failure_threshold)),
            ("backoff.multiplier", u64::from(self.backoff.multiplier)),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                issues.push(ConfigIssue::ZeroValue { field });
            }
        }
        if self.ui.check_updates_on_start
            && self
                .ui
                .update_feed_url
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            issues.push(ConfigIssue::MissingUpdateFeed);
        }
        issues
    }
}
