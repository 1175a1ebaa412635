use crate::backoff::{BackoffPolicy, BackoffState};
use playcord_core::{AppName, DetectedApp, SourceFamily, Track};
use playcord_providers::{AdapterChain, AppPresence, ArtworkCache};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn, Instrument, Span};

const EVENT_CAPACITY: usize = 64;

/// What a polling source reports upward. Per tick, a track change is always
/// sent before the play-state change it implies.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    TrackChanged {
        family: SourceFamily,
        source: Option<AppName>,
        track: Track,
    },
    PlayStateChanged {
        family: SourceFamily,
        source: Option<AppName>,
        is_playing: bool,
    },
}

impl SourceEvent {
    pub fn family(&self) -> SourceFamily {
        match self {
            SourceEvent::TrackChanged { family, .. } | SourceEvent::PlayStateChanged { family, .. } => {
                *family
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourcePhase {
    #[default]
    Idle,
    Polling,
    Backoff,
}

#[derive(Debug, Clone, Default)]
pub struct SourceState {
    pub last_track: Option<Track>,
    /// Last play flag reported to subscribers.
    pub is_active: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<SystemTime>,
    pub phase: SourcePhase,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub backoff: BackoffPolicy,
    pub artwork_max_age: Duration,
    pub artwork_sweep_interval: Duration,
}

/// Polls one source family on its own timer and turns snapshots into events.
pub struct PollingSource {
    family: SourceFamily,
    detector: Arc<dyn AppPresence>,
    chain: AdapterChain,
    artwork: Option<ArtworkCache>,
    config: SourceConfig,
    state: SourceState,
    backoff: BackoffState,
    last_sweep: Option<Instant>,
    events: broadcast::Sender<SourceEvent>,
    span: Span,
}

impl PollingSource {
    pub fn new(
        family: SourceFamily,
        detector: Arc<dyn AppPresence>,
        chain: AdapterChain,
        config: SourceConfig,
        span: Span,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            family,
            detector,
            chain,
            artwork: None,
            config,
            state: SourceState::default(),
            backoff: BackoffState::default(),
            last_sweep: None,
            events,
            span,
        }
    }

    /// Enables the opportunistic sweep of stale artwork in `cache`'s directory.
    pub fn with_artwork_sweep(mut self, cache: ArtworkCache) -> Self {
        self.artwork = Some(cache);
        self
    }

    pub fn family(&self) -> SourceFamily {
        self.family
    }

    pub fn state(&self) -> &SourceState {
        &self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    /// Polls until `stop` flips to `true`. The flag is only looked at between
    /// ticks, never while one is running.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let span = self.span.clone();
        async move {
            info!(adapters = ?self.chain.adapter_names(), "polling source started");
            while !*stop.borrow() {
                let next = self.tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(next) => {}
                    _ = stop.changed() => break,
                }
            }
            info!("polling source stopped");
        }
        .instrument(span)
        .await
    }

    /// One detection and extraction pass. Returns how long to wait before the next.
    pub async fn tick(&mut self) -> Duration {
        let now = Instant::now();
        self.maybe_sweep_artwork(now);
        if self.backoff.expire_cooldown(&self.config.backoff, now) {
            debug!("back-off cooldown elapsed; failures reset");
        }

        let app = Self::detect(Arc::clone(&self.detector), self.family).await;
        if app.is_none() && self.family.needs_running_app() {
            self.go_idle();
            return self.config.backoff.interval;
        }

        self.state.phase = SourcePhase::Polling;
        let hinted = app.as_ref().map(|a| a.app_name);
        match self.chain.try_get_track(app.as_ref()).await {
            Ok(Some(track)) => {
                self.record_success();
                let source = track.source_app.or(hinted);
                self.report(track, source);
            }
            Ok(None) if app.is_none() => self.go_idle(),
            Ok(None) => {
                self.record_success();
                self.drop_track(hinted);
            }
            Err(err) => {
                self.backoff.record_failure(&self.config.backoff, Instant::now());
                self.state.consecutive_failures = self.backoff.consecutive_failures();
                warn!(
                    app = hinted.map(AppName::display_name).unwrap_or("none"),
                    failures = self.state.consecutive_failures,
                    error = %err,
                    "track extraction failed"
                );
                if self.backoff.is_backing_off() {
                    self.state.phase = SourcePhase::Backoff;
                }
            }
        }
        self.backoff.next_interval(&self.config.backoff)
    }

    /// Owned handles only; the tick future must stay `Send`.
    async fn detect(detector: Arc<dyn AppPresence>, family: SourceFamily) -> Option<DetectedApp> {
        let found = tokio::task::spawn_blocking(move || {
            detector
                .detect_running_apps()
                .into_iter()
                .find(|app| family.supports(app.app_name))
        })
        .await;
        match found {
            Ok(app) => app,
            Err(err) => {
                warn!(error = %err, "app detection panicked");
                None
            }
        }
    }

    fn record_success(&mut self) {
        self.backoff.record_success();
        self.state.consecutive_failures = 0;
        self.state.last_success = Some(SystemTime::now());
    }

    fn go_idle(&mut self) {
        if self.state.phase != SourcePhase::Idle {
            debug!("no supported app running");
        }
        self.state.phase = SourcePhase::Idle;
        self.backoff.reset();
        self.state.consecutive_failures = 0;
        self.drop_track(None);
    }

    fn drop_track(&mut self, source: Option<AppName>) {
        self.state.last_track = None;
        self.set_playing(false, source);
    }

    fn report(&mut self, track: Track, source: Option<AppName>) {
        let is_playing = track.is_playing;
        if self.state.last_track.as_ref() != Some(&track) {
            debug!(track = %track.name, artist = %track.artist, is_playing, "track changed");
            self.emit(SourceEvent::TrackChanged {
                family: self.family,
                source,
                track: track.clone(),
            });
        }
        self.state.last_track = Some(track);
        self.set_playing(is_playing, source);
    }

    fn set_playing(&mut self, is_playing: bool, source: Option<AppName>) {
        if self.state.is_active == is_playing {
            return;
        }
        self.state.is_active = is_playing;
        self.emit(SourceEvent::PlayStateChanged {
            family: self.family,
            source,
            is_playing,
        });
    }

    fn emit(&self, event: SourceEvent) {
        // No subscriber is fine; the arbitrator may not be attached in tests.
        let _ = self.events.send(event);
    }

    fn maybe_sweep_artwork(&mut self, now: Instant) {
        let Some(cache) = self.artwork.as_ref() else {
            return;
        };
        let due = self
            .last_sweep
            .map(|at| now.saturating_duration_since(at) >= self.config.artwork_sweep_interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_sweep = Some(now);
        let removed = cache.sweep(self.config.artwork_max_age, SystemTime::now());
        if removed > 0 {
            debug!(removed, "stale artwork swept");
        }
    }
}
