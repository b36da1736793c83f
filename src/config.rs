//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `WEIGHTFEED_*` environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::feed::ReconnectPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker URL. `wss://`, `ws://`, `mqtts://` and `mqtt://` are understood.
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Topic the scale publishes `{"weight": <grams>}` to
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Client identifiers are `<prefix>-<6 hex chars>`
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_broker_url() -> String {
    "wss://test.mosquitto.org:8081/mqtt".to_string()
}

fn default_topic() -> String {
    "weight-sensor-FCAI/data".to_string()
}

fn default_client_id_prefix() -> String {
    "WebAppMQTTClient".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            topic: default_topic(),
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// How the delay between automatic reconnects is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// Same delay before every retry
    Fixed,
    /// Delay doubles with every consecutive failure
    Exponential,
}

impl std::str::FromStr for ReconnectMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(ReconnectMode::Fixed),
            "exponential" => Ok(ReconnectMode::Exponential),
            other => Err(ConfigError::Invalid(format!(
                "unknown reconnect mode '{}' (expected fixed or exponential)",
                other
            ))),
        }
    }
}

/// Feed client behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_reconnect_mode")]
    pub reconnect: ReconnectMode,

    /// Fixed delay, or the base delay for exponential backoff
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Upper bound for exponential backoff
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Budget for a pull-style fetch to get connected and see a reading
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// Log every raw payload at debug level
    #[serde(default)]
    pub debug: bool,
}

fn default_reconnect_mode() -> ReconnectMode {
    ReconnectMode::Fixed
}

fn default_reconnect_delay() -> u64 {
    5000 // 5 seconds
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_fetch_timeout() -> u64 {
    5000 // 10 polls x 500 ms
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect: default_reconnect_mode(),
            reconnect_delay_ms: default_reconnect_delay(),
            backoff_max_ms: default_backoff_max(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            fetch_timeout_ms: default_fetch_timeout(),
            debug: false,
        }
    }
}

impl FeedConfig {
    /// Build the reconnect policy described by this section
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let delay = Duration::from_millis(self.reconnect_delay_ms);
        match self.reconnect {
            ReconnectMode::Fixed => ReconnectPolicy::Fixed { delay },
            ReconnectMode::Exponential => ReconnectPolicy::Exponential {
                base: delay,
                max: Duration::from_millis(self.backoff_max_ms),
            },
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("weightfeed").join("config.toml")),
            Some(PathBuf::from("/etc/weightfeed/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Broker overrides
        if let Ok(url) = std::env::var("WEIGHTFEED_BROKER_URL") {
            self.broker.url = url;
        }
        if let Ok(topic) = std::env::var("WEIGHTFEED_TOPIC") {
            self.broker.topic = topic;
        }

        // Feed overrides
        if let Ok(attempts) = std::env::var("WEIGHTFEED_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                self.feed.max_reconnect_attempts = n;
            }
        }
        if let Ok(mode) = std::env::var("WEIGHTFEED_RECONNECT") {
            match mode.parse() {
                Ok(mode) => self.feed.reconnect = mode,
                Err(e) => tracing::warn!("Ignoring WEIGHTFEED_RECONNECT: {}", e),
            }
        }
        if let Ok(debug) = std::env::var("WEIGHTFEED_DEBUG") {
            self.feed.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }

        // Logging overrides
        if let Ok(level) = std::env::var("WEIGHTFEED_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("WEIGHTFEED_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Weightfeed Configuration
#
# Environment variables override these settings:
# - WEIGHTFEED_BROKER_URL
# - WEIGHTFEED_TOPIC
# - WEIGHTFEED_MAX_RECONNECT_ATTEMPTS
# - WEIGHTFEED_RECONNECT
# - WEIGHTFEED_DEBUG
# - WEIGHTFEED_LOG_LEVEL
# - WEIGHTFEED_LOG_FORMAT

[broker]
# Broker URL (wss://, ws://, mqtts:// or mqtt://)
url = "wss://test.mosquitto.org:8081/mqtt"

# Topic the scale publishes {"weight": <grams>} to
topic = "weight-sensor-FCAI/data"

# Client identifier prefix; a random 6 hex character suffix is appended
client_id_prefix = "WebAppMQTTClient"

# Keep alive interval (seconds)
keep_alive_secs = 60

# How long to wait for the broker to accept a connection (ms)
connect_timeout_ms = 10000

[feed]
# Reconnect delay policy: fixed or exponential
reconnect = "fixed"

# Fixed delay, or base delay for exponential backoff (ms)
reconnect_delay_ms = 5000

# Cap for exponential backoff (ms)
backoff_max_ms = 30000

# Consecutive failures before automatic reconnects stop
max_reconnect_attempts = 5

# How long a one-shot fetch waits for a connection and a reading (ms)
fetch_timeout_ms = 5000

# Log every raw payload at debug level
debug = false

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
