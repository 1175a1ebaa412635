//! Connection to the external presence service and its self-healing loop.
//!
//! `Disconnected -> Initializing -> Ready`. Any failed publish, or a failure
//! the client reports on its own, moves to `Degraded`, after which a single
//! reconnect timer re-runs initialization until the client reports ready.

use crate::payload::{payload_from_track, PresencePayload};
use anyhow::Result;
use async_trait::async_trait;
use playcord_core::{AppName, AssetsConfig, Track};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Initializing,
    Ready,
    Degraded(String),
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Initializing => f.write_str("initializing"),
            ConnectionState::Ready => f.write_str("ready"),
            ConnectionState::Degraded(reason) => write!(f, "degraded ({reason})"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
        }
    }
}

/// Reported by a client outside of the call that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Ready,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("presence client is not ready")]
    NotReady,
    #[error("presence publisher is shut down")]
    ShutDown,
    #[error("presence transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait PresenceClient: Send {
    /// Opens the connection. Readiness may be signalled later through the
    /// event sender the client was built with.
    async fn connect(&mut self) -> Result<()>;
    async fn set_activity(&mut self, payload: &PresencePayload) -> Result<()>;
    async fn clear_activity(&mut self) -> Result<()>;
    async fn close(&mut self);
    fn is_ready(&self) -> bool;
}

/// Builds a fresh client for each initialization attempt.
pub type ClientFactory =
    Box<dyn Fn(mpsc::UnboundedSender<ConnectionEvent>) -> Box<dyn PresenceClient> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub reconnect_interval: Duration,
    pub reconnect_delay: Duration,
    pub assets: AssetsConfig,
}

pub struct PresencePublisher {
    factory: ClientFactory,
    config: PublisherConfig,
    client: Mutex<Option<Box<dyn PresenceClient>>>,
    state: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    listener: StdMutex<Option<JoinHandle<()>>>,
    reconnect_timer: StdMutex<Option<JoinHandle<()>>>,
    reconnect_scheduled: AtomicBool,
    reconnect_in_flight: AtomicBool,
    shut_down: AtomicBool,
    span: Span,
}

/// Clears an in-flight flag when the owning attempt ends, however it ends.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PresencePublisher {
    pub fn new(factory: ClientFactory, config: PublisherConfig, span: Span) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            factory,
            config,
            client: Mutex::new(None),
            state,
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            listener: StdMutex::new(None),
            reconnect_timer: StdMutex::new(None),
            reconnect_scheduled: AtomicBool::new(false),
            reconnect_in_flight: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            span,
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Starts handling the client's asynchronous callbacks. Calling it again
    /// is a no-op.
    pub fn spawn_listener(self: &Arc<Self>) {
        let Some(mut rx) = lock(&self.events_rx).take() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(
            async move {
                while let Some(event) = rx.recv().await {
                    let Some(this) = weak.upgrade() else {
                        break;
                    };
                    this.on_connection_event(event).await;
                }
            }
            .instrument(self.span.clone()),
        );
        *lock(&self.listener) = Some(handle);
    }

    /// Replaces the client with a fresh one and connects it.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), PublishError> {
        if self.is_shut_down() {
            return Err(PublishError::ShutDown);
        }
        self.set_state(ConnectionState::Initializing);

        let mut guard = self.client.lock().await;
        if let Some(mut old) = guard.take() {
            old.close().await;
        }
        let mut client = (self.factory)(self.events_tx.clone());
        match client.connect().instrument(self.span.clone()).await {
            Ok(()) => {
                let ready = client.is_ready();
                *guard = Some(client);
                drop(guard);
                if ready {
                    self.set_state(ConnectionState::Ready);
                }
                Ok(())
            }
            Err(err) => {
                drop(guard);
                let reason = err.to_string();
                self.set_state(ConnectionState::Degraded(reason.clone()));
                Err(PublishError::Transport(reason))
            }
        }
    }

    /// Publishes `track`. Never fails: problems degrade the connection and
    /// hand over to the reconnect loop.
    pub async fn update_presence(self: &Arc<Self>, track: &Track, source: Option<AppName>) {
        if self.is_shut_down() {
            return;
        }
        let payload = payload_from_track(track, source, &self.config.assets);

        if !self.client_ready().await {
            if let Err(err) = self.initialize().await {
                warn!(parent: &self.span, error = %err, "presence not published");
                self.schedule_reconnect();
                return;
            }
            if !self.client_ready().await {
                let err = PublishError::NotReady;
                warn!(parent: &self.span, error = %err, "presence not published");
                self.schedule_reconnect();
                return;
            }
        }

        let mut guard = self.client.lock().await;
        let Some(client) = guard.as_mut() else {
            return;
        };
        match client.set_activity(&payload).await {
            Ok(()) => {
                debug!(parent: &self.span, details = %payload.details, "presence published");
            }
            Err(err) => {
                drop(guard);
                self.degrade(format!("publish failed: {err}"));
            }
        }
    }

    /// Removes the visible status; the connection stays up.
    pub async fn clear_presence(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let mut guard = self.client.lock().await;
        let Some(client) = guard.as_mut().filter(|c| c.is_ready()) else {
            debug!(parent: &self.span, "nothing to clear; client not ready");
            return;
        };
        match client.clear_activity().await {
            Ok(()) => debug!(parent: &self.span, "presence cleared"),
            Err(err) => {
                drop(guard);
                self.degrade(format!("clear failed: {err}"));
            }
        }
    }

    /// Stops the reconnect loop and releases the client. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = lock(&self.reconnect_timer).take() {
            timer.abort();
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        if let Some(mut client) = self.client.lock().await.take() {
            client.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!(parent: &self.span, "presence publisher shut down");
    }

    async fn on_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        if self.is_shut_down() {
            return;
        }
        match event {
            // A late event from a replaced client must not mark the current one ready.
            ConnectionEvent::Ready if self.client_ready().await => {
                self.set_state(ConnectionState::Ready)
            }
            ConnectionEvent::Ready => debug!(parent: &self.span, "stale ready event ignored"),
            ConnectionEvent::Failed(reason) => self.degrade(reason),
        }
    }

    fn degrade(self: &Arc<Self>, reason: String) {
        warn!(parent: &self.span, reason = %reason, "presence connection degraded");
        self.set_state(ConnectionState::Degraded(reason));
        self.schedule_reconnect();
    }

    /// Starts the reconnect timer unless one is already running.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        if self
            .reconnect_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(parent: &self.span, "reconnect already scheduled");
            return;
        }
        self.set_state(ConnectionState::Reconnecting);

        let weak = Arc::downgrade(self);
        let delay = self.config.reconnect_delay;
        let interval = self.config.reconnect_interval;
        let handle = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                loop {
                    let done = match weak.upgrade() {
                        Some(this) => this.reconnect_once().await,
                        None => true,
                    };
                    if done {
                        break;
                    }
                    tokio::time::sleep(interval).await;
                }
                if let Some(this) = weak.upgrade() {
                    this.finish_reconnect();
                }
            }
            .instrument(self.span.clone()),
        );
        *lock(&self.reconnect_timer) = Some(handle);
    }

    /// Releases the timer slot. A degrade that arrived after the last attempt
    /// found the slot taken, so it is picked up here.
    fn finish_reconnect(self: &Arc<Self>) {
        self.reconnect_scheduled.store(false, Ordering::SeqCst);
        if !self.is_shut_down() && self.connection_state() != ConnectionState::Ready {
            debug!(parent: &self.span, "connection lost again; rescheduling reconnect");
            self.schedule_reconnect();
        }
    }

    /// One reconnect attempt. Returns `true` when the loop should stop.
    async fn reconnect_once(self: &Arc<Self>) -> bool {
        if self.is_shut_down() {
            return true;
        }
        if self.connection_state() == ConnectionState::Ready {
            return true;
        }
        if self
            .reconnect_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let _in_flight = FlagGuard(&self.reconnect_in_flight);

        info!("reconnecting to presence service");
        match self.initialize().await {
            Ok(()) if self.connection_state() == ConnectionState::Ready => {
                info!("presence service ready");
                true
            }
            Ok(()) => false,
            Err(err) => {
                debug!(error = %err, "reconnect attempt failed");
                if !self.is_shut_down() {
                    self.set_state(ConnectionState::Reconnecting);
                }
                false
            }
        }
    }

    async fn client_ready(&self) -> bool {
        self.client
            .lock()
            .await
            .as_ref()
            .map(|c| c.is_ready())
            .unwrap_or(false)
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            info!(parent: &self.span, state = %next, "presence connection state");
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::time::UNIX_EPOCH;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Connect,
        Set(String),
        Clear,
        Close,
    }

    /// Shared script for every client the factory builds.
    #[derive(Default)]
    pub(crate) struct Backend {
        pub calls: StdMutex<Vec<Call>>,
        pub refuse_connect: AtomicBool,
        pub fail_publish: AtomicBool,
        pub connects: AtomicUsize,
        pub payload: StdMutex<Option<PresencePayload>>,
    }

    impl Backend {
        pub(crate) fn calls(&self) -> Vec<Call> {
            lock(&self.calls).clone()
        }

        pub(crate) fn last_payload(&self) -> Option<PresencePayload> {
            lock(&self.payload).clone()
        }

        fn record(&self, call: Call) {
            lock(&self.calls).push(call);
        }
    }

    pub(crate) struct FakeClient {
        backend: Arc<Backend>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        ready: bool,
    }

    #[async_trait]
    impl PresenceClient for FakeClient {
        async fn connect(&mut self) -> Result<()> {
            self.backend.connects.fetch_add(1, Ordering::SeqCst);
            self.backend.record(Call::Connect);
            if self.backend.refuse_connect.load(Ordering::SeqCst) {
                return Err(anyhow!("discord not running"));
            }
            self.ready = true;
            let _ = self.events.send(ConnectionEvent::Ready);
            Ok(())
        }

        async fn set_activity(&mut self, payload: &PresencePayload) -> Result<()> {
            if self.backend.fail_publish.load(Ordering::SeqCst) {
                self.ready = false;
                return Err(anyhow!("pipe closed"));
            }
            self.backend.record(Call::Set(payload.details.clone()));
            *lock(&self.backend.payload) = Some(payload.clone());
            Ok(())
        }

        async fn clear_activity(&mut self) -> Result<()> {
            self.backend.record(Call::Clear);
            Ok(())
        }

        async fn close(&mut self) {
            self.ready = false;
            self.backend.record(Call::Close);
        }

        fn is_ready(&self) -> bool {
            self.ready
        }
    }

    pub(crate) fn factory(backend: Arc<Backend>) -> ClientFactory {
        Box::new(move |events| {
            Box::new(FakeClient {
                backend: backend.clone(),
                events,
                ready: false,
            })
        })
    }

    fn publisher(backend: Arc<Backend>, reconnect: Duration) -> Arc<PresencePublisher> {
        let publisher = PresencePublisher::new(
            factory(backend),
            PublisherConfig {
                reconnect_interval: reconnect,
                reconnect_delay: Duration::from_millis(1),
                assets: AssetsConfig::default(),
            },
            Span::none(),
        );
        publisher.spawn_listener();
        publisher
    }

    fn song(name: &str) -> Track {
        Track::with_window(
            name,
            "Artist X",
            "Album",
            true,
            Duration::ZERO,
            None,
            UNIX_EPOCH + Duration::from_secs(100),
        )
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("state reached in time")
            .expect("publisher alive");
    }

    #[tokio::test]
    async fn first_update_initializes_then_publishes() {
        let backend = Arc::new(Backend::default());
        let publisher = publisher(backend.clone(), Duration::from_secs(30));
        assert_eq!(publisher.connection_state(), ConnectionState::Disconnected);

        publisher.update_presence(&song("Song A"), None).await;
        assert_eq!(publisher.connection_state(), ConnectionState::Ready);
        assert_eq!(
            backend.calls(),
            vec![Call::Connect, Call::Set("Song A".to_string())]
        );

        publisher.clear_presence().await;
        assert_eq!(backend.calls().last(), Some(&Call::Clear));
        assert_eq!(publisher.connection_state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn unreachable_service_reconnects_until_ready() {
        let backend = Arc::new(Backend::default());
        backend.refuse_connect.store(true, Ordering::SeqCst);
        let publisher = publisher(backend.clone(), Duration::from_millis(20));
        let mut states = publisher.watch_state();

        publisher.update_presence(&song("Song A"), None).await;
        assert_eq!(publisher.connection_state(), ConnectionState::Reconnecting);

        backend.refuse_connect.store(false, Ordering::SeqCst);
        wait_for(&mut states, ConnectionState::Ready).await;
        assert!(backend.connects.load(Ordering::SeqCst) >= 2);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn publish_failure_degrades_without_propagating() {
        let backend = Arc::new(Backend::default());
        let publisher = publisher(backend.clone(), Duration::from_millis(20));
        let mut states = publisher.watch_state();
        publisher.update_presence(&song("Song A"), None).await;

        backend.fail_publish.store(true, Ordering::SeqCst);
        publisher.update_presence(&song("Song B"), None).await;
        assert_ne!(publisher.connection_state(), ConnectionState::Ready);

        backend.fail_publish.store(false, Ordering::SeqCst);
        wait_for(&mut states, ConnectionState::Ready).await;
        publisher.update_presence(&song("Song C"), None).await;
        assert_eq!(backend.calls().last(), Some(&Call::Set("Song C".to_string())));
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_reconnect_loop() {
        let backend = Arc::new(Backend::default());
        backend.refuse_connect.store(true, Ordering::SeqCst);
        let publisher = publisher(backend.clone(), Duration::from_secs(3_600));

        for _ in 0..5 {
            publisher.update_presence(&song("Song A"), None).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Five direct attempts plus exactly one attempt from the single timer.
        assert_eq!(backend.connects.load(Ordering::SeqCst), 6);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn externally_reported_failure_drives_reconnect() {
        let backend = Arc::new(Backend::default());
        let publisher = publisher(backend.clone(), Duration::from_millis(20));
        let mut states = publisher.watch_state();
        publisher.update_presence(&song("Song A"), None).await;

        publisher
            .events_tx
            .send(ConnectionEvent::Failed("discord closed the pipe".to_string()))
            .expect("send");
        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.connects.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnected in time");
        wait_for(&mut states, ConnectionState::Ready).await;
    }

    #[tokio::test]
    async fn degrade_racing_the_end_of_a_reconnect_is_not_lost() {
        let backend = Arc::new(Backend::default());
        let publisher = publisher(backend.clone(), Duration::from_millis(20));
        let mut states = publisher.watch_state();
        publisher.update_presence(&song("Song A"), None).await;
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);

        // The loop has made its last attempt but still owns the slot.
        publisher.reconnect_scheduled.store(true, Ordering::SeqCst);
        publisher.degrade("pipe closed".to_string());
        assert!(matches!(
            publisher.connection_state(),
            ConnectionState::Degraded(_)
        ));

        publisher.finish_reconnect();
        wait_for(&mut states, ConnectionState::Ready).await;
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn finishing_while_ready_schedules_nothing() {
        let backend = Arc::new(Backend::default());
        let publisher = publisher(backend.clone(), Duration::from_millis(20));
        publisher.update_presence(&song("Song A"), None).await;

        publisher.reconnect_scheduled.store(true, Ordering::SeqCst);
        publisher.finish_reconnect();
        assert!(!publisher.reconnect_scheduled.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.connection_state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn shutdown_twice_is_safe() {
        let backend = Arc::new(Backend::default());
        let publisher = publisher(backend.clone(), Duration::from_secs(30));
        publisher.update_presence(&song("Song A"), None).await;

        publisher.shutdown().await;
        publisher.shutdown().await;
        assert_eq!(publisher.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            backend.calls().iter().filter(|c| **c == Call::Close).count(),
            1
        );

        publisher.update_presence(&song("Song B"), None).await;
        assert!(matches!(
            publisher.initialize().await,
            Err(PublishError::ShutDown)
        ));
        assert!(!backend.calls().contains(&Call::Set("Song B".to_string())));
    }
}
