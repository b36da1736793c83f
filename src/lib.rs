//! # Weightfeed
//!
//! Live weight-sensor feed client. A scale publishes `{"weight": <grams>}`
//! to an MQTT topic on a public broker; this crate keeps a best-effort
//! subscription to it and serves the latest reading to the rest of the
//! application.
//!
//! ## Features
//!
//! - **Resilient link**: reconnects with a fixed or exponential delay, up to
//!   a bounded number of consecutive attempts
//! - **Push and pull**: callbacks for live displays, a one-shot awaitable
//!   fetch for "read the scale now" buttons
//! - **Pluggable transport**: MQTT over secure WebSocket in production, an
//!   in-process broker for tests
//!
//! ## Modules
//!
//! - [`feed`]: The weight feed client
//! - [`transport`]: Broker transports
//! - [`config`]: TOML + environment configuration
//! - [`telemetry`]: Logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weightfeed::{Config, MqttTransport, WeightFeed};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     weightfeed::telemetry::init(&config.logging);
//!
//!     let transport = Arc::new(MqttTransport::new(config.broker.clone()));
//!     let feed = WeightFeed::new(config.broker, config.feed, transport);
//!     feed.connect();
//!
//!     let grams = feed.fetch_current_weight().await?;
//!     println!("Scale reads {} g", grams);
//!
//!     feed.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod feed;
pub mod telemetry;
pub mod transport;

pub use feed::{
    decode_weight, ConnectionState, FetchError, MalformedMessage, ReconnectPolicy, Subscription,
    SubscriptionId, WeightCallback, WeightFeed, WeightReading,
};

pub use transport::{
    MemoryBroker, MemoryTransport, MqttTransport, Session, SessionHandle, Transport,
    TransportError, TransportEvent,
};

pub use config::{
    BrokerConfig, Config, ConfigError, FeedConfig, LoggingConfig, ReconnectMode,
};
