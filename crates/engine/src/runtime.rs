use crate::arbitrator::{policy_for, Arbitrator, NowPlayingEvent, Outcome};
use crate::backoff::BackoffPolicy;
use crate::publisher::{ClientFactory, PresencePublisher, PublisherConfig};
use crate::source::{PollingSource, SourceConfig, SourceEvent};
use futures_util::stream::{self, select_all, BoxStream, StreamExt};
use playcord_core::{AppConfig, ArbitrationMode, AssetsConfig, SourceFamily};
use playcord_providers::{AdapterChain, AppPresence, ArtworkCache};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

const MIN_POLL: Duration = Duration::from_millis(100);
const MIN_TIMEOUT: Duration = Duration::from_millis(100);
const MIN_RECONNECT: Duration = Duration::from_secs(1);
const MIN_SWEEP: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub legacy_poll: Duration,
    pub media_poll: Duration,
    pub adapter_timeout: Duration,
    pub failure_threshold: u32,
    pub backoff_multiplier: u32,
    pub backoff_cooldown: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_delay: Duration,
    pub artwork_dir: Option<PathBuf>,
    pub artwork_max_age: Duration,
    pub artwork_sweep_interval: Duration,
    pub arbitration: ArbitrationMode,
    pub assets: AssetsConfig,
}

impl EngineConfig {
    /// Values below a safe floor are raised to it instead of being rejected.
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        let ms = Duration::from_millis;
        let iv = &cfg.intervals;
        Self {
            legacy_poll: ms(iv.legacy_poll_ms).max(MIN_POLL),
            media_poll: ms(iv.media_poll_ms).max(MIN_POLL),
            adapter_timeout: ms(iv.adapter_timeout_ms).max(MIN_TIMEOUT),
            failure_threshold: cfg.backoff.failure_threshold.max(1),
            backoff_multiplier: cfg.backoff.multiplier.max(1),
            backoff_cooldown: ms(cfg.backoff.cooldown_ms),
            reconnect_interval: ms(iv.reconnect_ms).max(MIN_RECONNECT),
            reconnect_delay: ms(iv.reconnect_delay_ms),
            artwork_dir: Some(ArtworkCache::in_temp_dir().dir().to_path_buf()),
            artwork_max_age: Duration::from_secs(cfg.artwork.max_age_secs),
            artwork_sweep_interval: ms(iv.artwork_sweep_ms).max(MIN_SWEEP),
            arbitration: cfg.arbitration,
            assets: cfg.assets.clone(),
        }
    }

    pub fn poll_interval(&self, family: SourceFamily) -> Duration {
        match family {
            SourceFamily::LegacyApp => self.legacy_poll,
            SourceFamily::MediaSession => self.media_poll,
        }
    }

    fn source_config(&self, family: SourceFamily) -> SourceConfig {
        SourceConfig {
            backoff: BackoffPolicy {
                interval: self.poll_interval(family),
                failure_threshold: self.failure_threshold,
                multiplier: self.backoff_multiplier,
                cooldown: self.backoff_cooldown,
            },
            artwork_max_age: self.artwork_max_age,
            artwork_sweep_interval: self.artwork_sweep_interval,
        }
    }

    fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            reconnect_interval: self.reconnect_interval,
            reconnect_delay: self.reconnect_delay,
            assets: self.assets.clone(),
        }
    }
}

/// Running detection pipeline: one task per source family, one arbitration
/// task, and the publisher.
pub struct Engine {
    stop: watch::Sender<bool>,
    sources: Vec<JoinHandle<()>>,
    arbitration: JoinHandle<()>,
    publisher: Arc<PresencePublisher>,
    events: broadcast::Sender<NowPlayingEvent>,
}

impl Engine {
    pub fn start(
        config: EngineConfig,
        detector: Arc<dyn AppPresence>,
        chains: Vec<(SourceFamily, AdapterChain)>,
        client_factory: ClientFactory,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let publisher = PresencePublisher::new(
            client_factory,
            config.publisher_config(),
            info_span!("publisher"),
        );
        publisher.spawn_listener();

        let mut receivers = Vec::with_capacity(chains.len());
        let mut sources = Vec::with_capacity(chains.len());
        for (family, chain) in chains {
            let span = info_span!("source", family = %family);
            let mut source = PollingSource::new(
                family,
                Arc::clone(&detector),
                chain,
                config.source_config(family),
                span,
            );
            if let Some(dir) = config.artwork_dir.as_ref() {
                source = source.with_artwork_sweep(ArtworkCache::new(dir));
            }
            receivers.push(source.subscribe());
            sources.push(tokio::spawn(source.run(stop_rx.clone())));
        }

        let arbitrator = Arbitrator::new(policy_for(config.arbitration));
        let span = info_span!("arbitrator", policy = arbitrator.policy_name());
        let arbitration = tokio::spawn(
            arbitrate(arbitrator, receivers, Arc::clone(&publisher), events.clone())
                .instrument(span),
        );

        info!(families = sources.len(), "engine started");
        Self {
            stop,
            sources,
            arbitration,
            publisher,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NowPlayingEvent> {
        self.events.subscribe()
    }

    pub fn publisher(&self) -> &Arc<PresencePublisher> {
        &self.publisher
    }

    /// Lets in-flight ticks finish, drains the arbitrator, then clears and
    /// releases the presence.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for source in self.sources {
            if let Err(err) = source.await {
                warn!(error = %err, "polling source task ended abnormally");
            }
        }
        if let Err(err) = self.arbitration.await {
            warn!(error = %err, "arbitration task ended abnormally");
        }
        self.publisher.clear_presence().await;
        self.publisher.shutdown().await;
        info!("engine stopped");
    }
}

async fn arbitrate(
    mut arbitrator: Arbitrator,
    receivers: Vec<broadcast::Receiver<SourceEvent>>,
    publisher: Arc<PresencePublisher>,
    events: broadcast::Sender<NowPlayingEvent>,
) {
    let mut merged = select_all(receivers.into_iter().map(event_stream));
    while let Some(event) = merged.next().await {
        for outcome in arbitrator.handle(event) {
            match outcome {
                Outcome::Publish { track, source } => {
                    publisher.update_presence(&track, source).await;
                }
                Outcome::Clear => publisher.clear_presence().await,
                Outcome::Notify(event) => {
                    let _ = events.send(event);
                }
            }
        }
    }
    info!(active = ?arbitrator.active_family(), "arbitration finished");
}

fn event_stream(rx: broadcast::Receiver<SourceEvent>) -> BoxStream<'static, SourceEvent> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "source events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
