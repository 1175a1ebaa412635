pub mod apps;
pub mod config;
pub mod display;
pub mod model;

pub use apps::{AppName, DetectedApp, SourceFamily};
pub use config::{
    AppConfig, ArbitrationMode, ArtworkConfig, AssetsConfig, BackoffConfig, ConfigIntervals,
    ConfigIssue, UiToggles,
};
pub use model::{Track, DEFAULT_TRACK_DURATION, UNKNOWN_ARTIST};
