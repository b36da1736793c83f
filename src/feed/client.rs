//! Weight Feed Client
//!
//! Owns the one broker session, the latest reading, the reconnect counter
//! and the subscriber registry. Cloning a [`WeightFeed`] shares all of it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::FetchError;
use super::messages::{decode_weight, WeightReading};
use super::state::{ConnectionState, ReconnectPolicy};
use super::subscribers::{SubscriberRegistry, Subscription};
use crate::config::{BrokerConfig, FeedConfig};
use crate::transport::{SessionHandle, Transport, TransportEvent};

/// Live weight feed
///
/// Construct one per process and hand clones to whoever needs readings.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use weightfeed::{Config, MqttTransport, WeightFeed};
///
/// # async fn example() -> Result<(), weightfeed::FetchError> {
/// let config = Config::default();
/// let transport = Arc::new(MqttTransport::new(config.broker.clone()));
/// let feed = WeightFeed::new(config.broker, config.feed, transport);
///
/// let live = feed.on_weight_update(|grams| println!("{grams} g"));
/// let grams = feed.fetch_current_weight().await?;
/// println!("Scale reads {grams} g");
///
/// live.unsubscribe();
/// feed.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WeightFeed {
    inner: Arc<Inner>,
}

struct Inner {
    broker: BrokerConfig,
    feed: FeedConfig,
    policy: ReconnectPolicy,
    client_id: String,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    reading: watch::Sender<Option<WeightReading>>,
    attempts: AtomicU32,
    /// Bumped on every connect attempt and on disconnect; events tagged
    /// with an older generation are ignored
    generation: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    subscribers: Arc<SubscriberRegistry>,
}

struct ActiveSession {
    generation: u64,
    handle: Arc<dyn SessionHandle>,
    driver: JoinHandle<()>,
}

impl ActiveSession {
    /// Stop delivering events and close the broker link in the background
    fn retire(self) {
        self.driver.abort();
        let handle = self.handle;
        tokio::spawn(async move { handle.close().await });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `<prefix>-<6 hex chars>`; collisions are not guarded against
fn generate_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..6])
}

impl WeightFeed {
    /// Create a disconnected feed. Call [`connect`](Self::connect) to start.
    pub fn new(broker: BrokerConfig, feed: FeedConfig, transport: Arc<dyn Transport>) -> Self {
        let client_id = generate_client_id(&broker.client_id_prefix);
        let policy = feed.reconnect_policy();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (reading, _) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                broker,
                feed,
                policy,
                client_id,
                transport,
                state,
                reading,
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
                reconnect: Mutex::new(None),
                subscribers: Arc::new(SubscriberRegistry::new()),
            }),
        }
    }

    /// Start a connection attempt. No-op while connecting or connected.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Tear down the session, cancel any pending reconnect and force
    /// `Disconnected`. A later `connect` starts from scratch.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        // Under the state lock so an in-flight connect sees either both or neither
        inner.state.send_modify(|state| {
            inner.generation.fetch_add(1, Ordering::AcqRel);
            *state = ConnectionState::Disconnected;
        });

        if let Some(pending) = lock(&inner.reconnect).take() {
            pending.abort();
        }
        let session = lock(&inner.session).take();

        if let Some(session) = session {
            session.driver.abort();
            session.handle.close().await;
            tracing::info!(client_id = %inner.client_id, "Weight feed disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.connection_state().is_connecting()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every connection state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Latest weight in grams, `None` until the sensor has published
    pub fn last_weight(&self) -> Option<f64> {
        self.last_reading().map(|r| r.grams)
    }

    pub fn last_reading(&self) -> Option<WeightReading> {
        *self.inner.reading.borrow()
    }

    /// Consecutive failed or closed attempts since the last successful connect
    pub fn connection_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    /// Clear the attempt counter so automatic reconnects may resume
    pub fn reset_connection_attempts(&self) {
        self.inner.attempts.store(0, Ordering::Release);
    }

    /// Whether an automatic reconnect is waiting on its timer
    pub fn reconnect_scheduled(&self) -> bool {
        lock(&self.inner.reconnect)
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn topic(&self) -> &str {
        &self.inner.broker.topic
    }

    /// Register a push subscriber, invoked with every new weight in
    /// registration order
    pub fn on_weight_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.inner.subscribers.register(Arc::new(callback))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Wait for the next reading to arrive, up to `timeout`
    pub async fn wait_for_reading(&self, timeout: Duration) -> Option<WeightReading> {
        let mut readings = self.inner.reading.subscribe();
        match tokio::time::timeout(timeout, readings.changed()).await {
            Ok(Ok(())) => *readings.borrow_and_update(),
            _ => None,
        }
    }

    /// One-shot weight fetch.
    ///
    /// Connects if needed (resetting the attempt counter first) and waits
    /// for `Connected` within the fetch budget. Returns the latest reading,
    /// waiting for the first one if none has arrived yet, within the same
    /// budget.
    pub async fn fetch_current_weight(&self) -> Result<f64, FetchError> {
        let budget = self.inner.feed.fetch_timeout();
        let deadline = Instant::now() + budget;

        if !self.is_connected() {
            if !self.is_connecting() {
                self.reset_connection_attempts();
                self.connect();
            }

            let mut state = self.watch_state();
            let connected = matches!(
                tokio::time::timeout_at(deadline, state.wait_for(ConnectionState::is_connected))
                    .await,
                Ok(Ok(_))
            );
            if !connected {
                tracing::warn!(
                    client_id = %self.inner.client_id,
                    budget_ms = budget.as_millis() as u64,
                    "Weight fetch gave up waiting for the broker"
                );
                return Err(FetchError::ConnectionTimeout(budget));
            }
        }

        if let Some(grams) = self.last_weight() {
            return Ok(grams);
        }

        let mut readings = self.inner.reading.subscribe();
        let first = match tokio::time::timeout_at(deadline, readings.wait_for(Option::is_some)).await
        {
            Ok(Ok(reading)) => (*reading).map(|r| r.grams),
            _ => None,
        };

        first.ok_or_else(|| {
            tracing::warn!(
                client_id = %self.inner.client_id,
                topic = %self.inner.broker.topic,
                "Connected but no weight reading arrived"
            );
            FetchError::NoDataReceived
        })
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn connect(self: &Arc<Self>) {
        self.start_attempt(None);
    }

    /// Move `Disconnected` to `Connecting` and open a session. With
    /// `expected` set, only proceeds while that generation is still current.
    fn start_attempt(self: &Arc<Self>, expected: Option<u64>) {
        let mut generation = 0;
        let started = self.state.send_if_modified(|state| {
            if *state != ConnectionState::Disconnected {
                return false;
            }
            if expected.is_some_and(|g| !self.is_current(g)) {
                return false;
            }
            generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *state = ConnectionState::Connecting;
            true
        });
        if !started {
            let current = *self.state.borrow();
            tracing::debug!(
                state = %current,
                "Connect ignored, attempt already in flight or superseded"
            );
            return;
        }

        tracing::info!(
            client_id = %self.client_id,
            broker = %self.broker.url,
            attempt = self.attempts.load(Ordering::Acquire) + 1,
            "Connecting to weight feed broker"
        );

        match self.transport.open(&self.client_id) {
            Ok(session) => {
                let handle: Arc<dyn SessionHandle> = Arc::from(session.handle);
                // Hold the slot while spawning so a fast Closed cannot race the insert
                let mut slot = lock(&self.session);
                if !self.is_current(generation) {
                    drop(slot);
                    tracing::debug!(
                        client_id = %self.client_id,
                        "Disconnected while opening, dropping session"
                    );
                    tokio::spawn(async move { handle.close().await });
                    return;
                }

                let driver = tokio::spawn(drive_session(
                    Arc::clone(self),
                    generation,
                    session.events,
                    Arc::clone(&handle),
                ));
                let previous = slot.replace(ActiveSession {
                    generation,
                    handle,
                    driver,
                });
                drop(slot);

                if let Some(previous) = previous {
                    tracing::debug!(
                        generation = previous.generation,
                        "Closing session superseded by a new connect"
                    );
                    previous.retire();
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to open broker session");
                self.on_closed(generation);
            }
        }
    }

    fn on_connected(&self) {
        self.attempts.store(0, Ordering::Release);
        self.state.send_replace(ConnectionState::Connected);
        tracing::info!(
            client_id = %self.client_id,
            topic = %self.broker.topic,
            "Weight feed connected"
        );
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic != self.broker.topic {
            tracing::trace!(topic = %topic, "Ignoring message on foreign topic");
            return;
        }
        if self.feed.debug {
            tracing::debug!(payload = %String::from_utf8_lossy(payload), "Raw weight payload");
        }

        match decode_weight(payload) {
            Ok(grams) => {
                self.reading.send_replace(Some(WeightReading::now(grams)));
                let fired = self.subscribers.notify(grams);
                tracing::trace!(grams, subscribers = fired, "Weight updated");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed weight payload");
            }
        }
    }

    fn on_error(&self, message: &str) {
        tracing::warn!(client_id = %self.client_id, error = %message, "Broker link error");
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    fn on_broker_disconnect(&self) {
        tracing::info!(client_id = %self.client_id, "Broker sent disconnect");
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Session ended; apply the reconnect policy
    fn on_closed(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        {
            let mut slot = lock(&self.session);
            if slot.as_ref().map(|s| s.generation) == Some(generation) {
                // Detach rather than abort: this runs on the driver itself
                slot.take();
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);

        let attempts = self.attempts.load(Ordering::Acquire);
        let max = self.feed.max_reconnect_attempts;
        if attempts >= max {
            tracing::error!(
                client_id = %self.client_id,
                attempts,
                "Max reconnection attempts reached, giving up until reset"
            );
            return;
        }

        let delay = self.policy.delay_for(attempts);
        self.attempts.store(attempts + 1, Ordering::Release);
        tracing::info!(
            attempt = attempts + 1,
            max,
            delay_ms = delay.as_millis() as u64,
            "Broker session closed, scheduling reconnect"
        );

        let feed: Weak<Inner> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = feed.upgrade() {
                inner.start_attempt(Some(generation));
            }
        });

        if let Some(previous) = lock(&self.reconnect).replace(task) {
            previous.abort();
        }
    }
}

/// Feed one session's events into the client, in arrival order
async fn drive_session(
    inner: Arc<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    handle: Arc<dyn SessionHandle>,
) {
    while let Some(event) = events.recv().await {
        if !inner.is_current(generation) {
            return;
        }

        match event {
            TransportEvent::Connected => {
                inner.on_connected();
                if let Err(e) = handle.subscribe(&inner.broker.topic).await {
                    tracing::error!(error = %e, "Subscription error");
                } else {
                    tracing::debug!(topic = %inner.broker.topic, "Subscribe requested");
                }
            }
            TransportEvent::Message { topic, payload } => inner.on_message(&topic, &payload),
            TransportEvent::SubscribeFailed { topic } => {
                tracing::error!(topic = %topic, "Broker rejected subscription");
            }
            TransportEvent::Error(message) => inner.on_error(&message),
            TransportEvent::Disconnected => inner.on_broker_disconnect(),
            TransportEvent::Closed => {
                inner.on_closed(generation);
                return;
            }
        }
    }

    // Sender dropped without a Closed event
    inner.on_closed(generation);
}
