//! In-Process Transport
//!
//! A broker stand-in with no network behind it. Each `open` creates a
//! [`MemoryBroker`] through which the caller fires connection events and
//! publishes payloads by hand. Used by the test suite and for offline runs.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{Session, SessionHandle, Transport, TransportError, TransportEvent};

#[derive(Default)]
struct Shared {
    brokers: Vec<MemoryBroker>,
    open_attempts: usize,
    closed_sessions: usize,
    subscriptions: Vec<String>,
    fail_open: bool,
    fail_subscribe: bool,
}

/// Hand-driven transport
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `open` fail immediately
    pub fn set_fail_open(&self, fail: bool) {
        lock(&self.shared).fail_open = fail;
    }

    /// Make every following `subscribe` fail
    pub fn set_fail_subscribe(&self, fail: bool) {
        lock(&self.shared).fail_subscribe = fail;
    }

    /// Number of `open` calls, failed ones included
    pub fn open_attempts(&self) -> usize {
        lock(&self.shared).open_attempts
    }

    /// Number of sessions the client closed explicitly
    pub fn closed_sessions(&self) -> usize {
        lock(&self.shared).closed_sessions
    }

    /// Topics subscribed to, across all sessions, in order
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.shared).subscriptions.clone()
    }

    /// Broker side of the most recently opened session
    pub fn latest(&self) -> Option<MemoryBroker> {
        lock(&self.shared).brokers.last().cloned()
    }
}

impl Transport for MemoryTransport {
    fn open(&self, client_id: &str) -> Result<Session, TransportError> {
        let mut shared = lock(&self.shared);
        shared.open_attempts += 1;

        if shared.fail_open {
            return Err(TransportError::Connection(
                "memory transport refused the connection".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let broker = MemoryBroker {
            client_id: client_id.to_string(),
            events: tx,
            open: Arc::clone(&open),
        };
        shared.brokers.push(broker);

        Ok(Session {
            events: rx,
            handle: Box::new(MemorySession {
                shared: Arc::clone(&self.shared),
                open,
            }),
        })
    }
}

struct MemorySession {
    shared: Arc<Mutex<Shared>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl SessionHandle for MemorySession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut shared = lock(&self.shared);
        if shared.fail_subscribe {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "memory transport refused the subscription".to_string(),
            });
        }
        shared.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            lock(&self.shared).closed_sessions += 1;
        }
    }
}

/// Broker side of one memory session
///
/// Every method returns whether the event reached the client.
#[derive(Clone)]
pub struct MemoryBroker {
    client_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    open: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// Client identifier the session was opened with
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the client still holds this session open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.events.is_closed()
    }

    pub fn connect(&self) -> bool {
        self.send(TransportEvent::Connected)
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.send(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    pub fn reject_subscription(&self, topic: &str) -> bool {
        self.send(TransportEvent::SubscribeFailed {
            topic: topic.to_string(),
        })
    }

    pub fn error(&self, message: &str) -> bool {
        self.send(TransportEvent::Error(message.to_string()))
    }

    /// Broker-initiated DISCONNECT
    pub fn disconnect(&self) -> bool {
        self.send(TransportEvent::Disconnected)
    }

    /// End the session from the broker side
    pub fn close(&self) -> bool {
        let sent = self.send(TransportEvent::Closed);
        self.open.store(false, Ordering::Release);
        sent
    }

    fn send(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}
