//! Connection state and reconnect policy

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Where the broker link currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Delay schedule between automatic reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Wait the same amount before every retry
    Fixed { delay: Duration },
    /// Wait `base * 2^attempts`, never longer than `max`
    Exponential { base: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry that follows `attempts` consecutive failures
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay } => delay,
            ReconnectPolicy::Exponential { base, max } => {
                let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }
}
