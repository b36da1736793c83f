//! Live Weight Feed
//!
//! Keeps a best-effort subscription to the scale's topic and answers "what
//! does the scale read right now?" two ways:
//!
//! - **Push**: [`WeightFeed::on_weight_update`] registers a callback that
//!   fires on every valid reading, in registration order
//! - **Pull**: [`WeightFeed::fetch_current_weight`] connects if needed and
//!   resolves to the latest reading, or fails with a [`FetchError`]
//!
//! ## Connection lifecycle
//!
//! `Disconnected → Connecting → Connected → Disconnected → …`
//!
//! Every closed or failed session bumps a reconnect counter and schedules a
//! retry according to the [`ReconnectPolicy`]. Once the counter reaches the
//! configured maximum, retries stop until
//! [`WeightFeed::reset_connection_attempts`] and [`WeightFeed::connect`] are
//! called. A successful connect resets the counter.
//!
//! Transport errors and malformed payloads are logged and absorbed; only
//! the pull-style fetch reports failure to its caller.

mod client;
mod error;
mod messages;
mod state;
mod subscribers;

pub use client::WeightFeed;
pub use error::{FetchError, MalformedMessage};
pub use messages::{decode_weight, WeightReading};
pub use state::{ConnectionState, ReconnectPolicy};
pub use subscribers::{Subscription, SubscriptionId, WeightCallback};
