//! Bus configuration with validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

/// Default address of the broker's well-known queue.
pub const DEFAULT_BROKER_QUEUE: &str = "courier.broker";

/// How the bus runs its background work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusProfile {
    /// Periodic handshakes and concurrent multi-threaded handlers.
    #[default]
    Production,
    /// No handshake timer; every handler processes one message at a time.
    SynchronousTest,
}

impl std::str::FromStr for BusProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" => Ok(Self::Production),
            "synchronous_test" | "sync" | "test" => Ok(Self::SynchronousTest),
            other => Err(ConfigError::Invalid(format!("unknown profile: {other}"))),
        }
    }
}

/// Main bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Logical service name; the process name when unset
    pub service_name: Option<String>,
    /// Optional instance label sent with the service registration
    pub instance_name: Option<String>,
    /// Address of the broker's well-known queue
    pub broker_queue: String,
    /// Reply timeouts
    pub timeouts: TimeoutConfig,
    /// Period of the handshake timer
    #[serde(with = "humantime_serde")]
    pub handshake_interval: Duration,
    /// Consecutive handshake failures tolerated before the bus stops itself
    pub handshake_failure_threshold: u32,
    /// Receive wait used by handler consume loops
    #[serde(with = "humantime_serde")]
    pub receive_poll: Duration,
    /// Concurrent messages per multi-threaded handler
    pub max_concurrent_handlers: usize,
    /// Runtime profile
    pub profile: BusProfile,
    /// Register each subscription with the broker when it starts, in
    /// addition to announcing it in the handshake
    pub register_subscriptions_on_start: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            instance_name: None,
            broker_queue: DEFAULT_BROKER_QUEUE.to_string(),
            timeouts: TimeoutConfig::default(),
            handshake_interval: Duration::from_secs(30),
            handshake_failure_threshold: 20,
            receive_poll: Duration::from_secs(1),
            max_concurrent_handlers: 8,
            profile: BusProfile::Production,
            register_subscriptions_on_start: false,
        }
    }
}

impl BusConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COURIER_SERVICE_NAME`: Service name
    /// - `COURIER_INSTANCE_NAME`: Instance label
    /// - `COURIER_BROKER_QUEUE`: Broker queue address (default: courier.broker)
    /// - `COURIER_HANDSHAKE_INTERVAL`: Handshake period, e.g. `30s` or `500ms`
    /// - `COURIER_PROFILE`: `production` or `synchronous_test`
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = env::var("COURIER_SERVICE_NAME") {
            config.service_name = Some(name);
        }
        if let Ok(instance) = env::var("COURIER_INSTANCE_NAME") {
            config.instance_name = Some(instance);
        }
        if let Ok(queue) = env::var("COURIER_BROKER_QUEUE") {
            config.broker_queue = queue;
        }
        if let Ok(raw) = env::var("COURIER_HANDSHAKE_INTERVAL") {
            match humantime_serde::parse_duration(&raw) {
                Ok(interval) => config.handshake_interval = interval,
                Err(e) => warn!(value = %raw, error = e, "Ignoring COURIER_HANDSHAKE_INTERVAL"),
            }
        }
        if let Ok(raw) = env::var("COURIER_PROFILE") {
            match raw.parse() {
                Ok(profile) => config.profile = profile,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring COURIER_PROFILE"),
            }
        }

        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_queue.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_queue cannot be empty".into()));
        }

        let timeouts = [
            ("service_register", self.timeouts.service_register),
            ("handshake", self.timeouts.handshake),
            ("handler_register", self.timeouts.handler_register),
            ("publish_reply", self.timeouts.publish_reply),
            ("handshake_interval", self.handshake_interval),
            ("receive_poll", self.receive_poll),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::InvalidTimeout(format!("{name} cannot be 0")));
            }
        }

        if self.handshake_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "handshake_failure_threshold cannot be 0".into(),
            ));
        }

        if self.max_concurrent_handlers == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_concurrent_handlers cannot be 0".into(),
            ));
        }

        Ok(())
    }
}

/// Reply timeouts for the broker sub-protocols
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait for `ServiceRegisterReply`
    #[serde(with = "humantime_serde")]
    pub service_register: Duration,
    /// Wait for `HandshakeReply`
    #[serde(with = "humantime_serde")]
    pub handshake: Duration,
    /// Wait for subscribe/request registration replies
    #[serde(with = "humantime_serde")]
    pub handler_register: Duration,
    /// Wait for `PublishReply` on persistent publishes
    #[serde(with = "humantime_serde")]
    pub publish_reply: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            service_register: Duration::from_secs(30),
            handshake: Duration::from_secs(30),
            handler_register: Duration::from_secs(3),
            publish_reply: Duration::from_secs(3),
        }
    }
}

/// Where and how a message is published, or which topic a handler listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    pub topic: String,
    /// Wait for the broker to acknowledge the publish
    pub persistent: bool,
}

impl PublishConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            persistent: false,
        }
    }

    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Which request handler to call and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestConfig {
    pub name: String,
    pub timeout: Duration,
}

impl RequestConfig {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
        }
    }
}

/// Optional settings for a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Stable name; a unique name is generated when unset
    pub name: Option<String>,
    /// Defaults to true for named subscriptions, false otherwise
    pub durable: Option<bool>,
    /// Process several messages concurrently
    pub multi_threaded: bool,
}

impl SubscribeOptions {
    /// Options for a named (and therefore durable) subscription.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    #[must_use]
    pub fn multi_threaded(mut self, multi_threaded: bool) -> Self {
        self.multi_threaded = multi_threaded;
        self
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else {
            // Plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
