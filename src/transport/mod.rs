//! Broker Transports
//!
//! The feed never talks to a socket directly. It asks a [`Transport`] to
//! open a [`Session`] and then consumes the session's event stream:
//!
//! - [`MqttTransport`]: MQTT 3.1.1 over WebSocket/TLS/TCP via `rumqttc`
//! - [`MemoryTransport`]: in-process broker stand-in driven by hand
//!
//! A session reports `Connected` once the broker accepts it, then any number
//! of `Message`s, and finishes with exactly one `Closed`. Transports do not
//! reconnect on their own; the feed owns the retry policy.

mod memory;
mod mqtt;

pub use memory::{MemoryBroker, MemoryTransport};
pub use mqtt::MqttTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// Something that can open broker sessions
pub trait Transport: Send + Sync + 'static {
    /// Start connecting with the given client identifier.
    ///
    /// Must be called from within a tokio runtime. Progress is reported on
    /// the returned session's event channel.
    fn open(&self, client_id: &str) -> Result<Session, TransportError>;
}

/// Control half of an open session
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Subscribe to a topic (QoS 0)
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Close the session and stop its background work
    async fn close(&self);
}

/// An opened session: events flow out, control flows in
pub struct Session {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub handle: Box<dyn SessionHandle>,
}

/// Events a session reports
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the connection
    Connected,
    /// A publish arrived
    Message { topic: String, payload: Bytes },
    /// The broker refused a subscription
    SubscribeFailed { topic: String },
    /// A transport-level error; a `Closed` follows when it ends the session
    Error(String),
    /// The broker sent DISCONNECT
    Disconnected,
    /// The session is over; no more events follow
    Closed,
}

/// Errors that can occur on the broker link
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker did not accept the connection within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Subscription to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Session already closed")]
    Closed,
}
