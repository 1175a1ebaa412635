use async_trait::async_trait;
use playcord_core::{DetectedApp, SourceFamily, Track};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub mod artwork;
pub mod detector;
pub mod legacy;
pub mod media_session;
pub mod window_title;

pub use artwork::ArtworkCache;
pub use detector::{AppPresence, SystemAppDetector};
pub use legacy::LegacyAppAdapter;
pub use media_session::{MediaSession, MediaSessionAdapter, SessionRegistry, SessionStatus};
pub use window_title::{parse_window_title, WindowTitleAdapter};

/// Why an adapter could not query its origin at all.
///
/// "Nothing is playing" is not an error; adapters report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{adapter} did not answer within {after:?}")]
    Timeout {
        adapter: &'static str,
        after: Duration,
    },
    #[error("script runner failed: {0}")]
    ScriptFailed(String),
    #[error("invalid adapter output: {0}")]
    InvalidOutput(String),
    #[error(transparent)]
    Interface(#[from] anyhow::Error),
}

#[async_trait]
pub trait TrackAdapter: Send {
    fn name(&self) -> &'static str;
    async fn try_get_track(
        &mut self,
        hint: Option<&DetectedApp>,
    ) -> Result<Option<Track>, AdapterError>;
}

/// Ordered fallback over several adapters; the first track found wins.
pub struct AdapterChain {
    adapters: Vec<Box<dyn TrackAdapter>>,
    timeout: Duration,
}

impl AdapterChain {
    pub fn new(adapters: Vec<Box<dyn TrackAdapter>>, timeout: Duration) -> Self {
        Self { adapters, timeout }
    }

    /// Returns `Err` only when every adapter failed; a single adapter that
    /// answered "no track" makes the whole chain answer "no track".
    pub async fn try_get_track(
        &mut self,
        hint: Option<&DetectedApp>,
    ) -> Result<Option<Track>, AdapterError> {
        let mut answered = false;
        let mut last_err = None;

        for adapter in self.adapters.iter_mut() {
            let name = adapter.name();
            match tokio::time::timeout(self.timeout, adapter.try_get_track(hint)).await {
                Ok(Ok(Some(track))) => {
                    debug!(adapter = name, track = %track.name, "adapter reported a track");
                    return Ok(Some(track));
                }
                Ok(Ok(None)) => answered = true,
                Ok(Err(err)) => {
                    debug!(adapter = name, error = %err, "adapter failed");
                    last_err = Some(err);
                }
                Err(_) => {
                    debug!(adapter = name, "adapter timed out");
                    last_err = Some(AdapterError::Timeout {
                        adapter: name,
                        after: self.timeout,
                    });
                }
            }
        }

        match last_err {
            Some(err) if !answered => Err(err),
            _ => Ok(None),
        }
    }

    pub fn adapter_names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }
}

/// Structured source first, window-title parsing last.
pub fn build_chain(
    family: SourceFamily,
    artwork: Arc<ArtworkCache>,
    timeout: Duration,
) -> AdapterChain {
    let primary: Box<dyn TrackAdapter> = match family {
        SourceFamily::LegacyApp => Box::new(LegacyAppAdapter::new(artwork)),
        SourceFamily::MediaSession => Box::new(MediaSessionAdapter::new(
            media_session::platform_registry(),
            artwork,
        )),
    };
    AdapterChain::new(vec![primary, Box::new(WindowTitleAdapter)], timeout)
}

#[cfg(target_os = "linux")]
mod mpris;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(test)]
mod tests {
    use super::{AdapterChain, AdapterError, TrackAdapter};
    use async_trait::async_trait;
    use playcord_core::{DetectedApp, Track};
    use std::time::{Duration, SystemTime};

    enum Behavior {
        Track(&'static str),
        Nothing,
        Fail,
        Hang,
    }

    struct Scripted(&'static str, Behavior);

    #[async_trait]
    impl TrackAdapter for Scripted {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn try_get_track(
            &mut self,
            _hint: Option<&DetectedApp>,
        ) -> Result<Option<Track>, AdapterError> {
            match self.1 {
                Behavior::Track(name) => Ok(Some(Track::with_window(
                    name,
                    "Artist",
                    "",
                    true,
                    Duration::ZERO,
                    None,
                    SystemTime::now(),
                ))),
                Behavior::Nothing => Ok(None),
                Behavior::Fail => Err(AdapterError::ScriptFailed("boom".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(None)
                }
            }
        }
    }

    fn chain(adapters: Vec<Scripted>) -> AdapterChain {
        AdapterChain::new(
            adapters
                .into_iter()
                .map(|a| Box::new(a) as Box<dyn TrackAdapter>)
                .collect(),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn first_track_short_circuits() {
        let mut chain = chain(vec![
            Scripted("a", Behavior::Fail),
            Scripted("b", Behavior::Track("from b")),
            Scripted("c", Behavior::Track("from c")),
        ]);
        let track = chain.try_get_track(None).await.expect("ok").expect("track");
        assert_eq!(track.name, "from b");
    }

    #[tokio::test]
    async fn any_clean_answer_means_no_track() {
        let mut chain = chain(vec![
            Scripted("a", Behavior::Fail),
            Scripted("b", Behavior::Nothing),
        ]);
        assert!(chain.try_get_track(None).await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn all_failures_surface_the_last_error() {
        let mut chain = chain(vec![
            Scripted("a", Behavior::Fail),
            Scripted("slow", Behavior::Hang),
        ]);
        let err = chain.try_get_track(None).await.expect_err("fails");
        assert!(matches!(err, AdapterError::Timeout { adapter: "slow", .. }));
        assert_eq!(chain.adapter_names(), vec!["a", "slow"]);
    }
}
