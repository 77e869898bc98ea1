//! Domain layer: configuration, queue naming and lifecycle rules.

pub mod config;
pub mod lifecycle;
pub mod naming;

pub use config::{
    BusConfig, BusProfile, ConfigError, PublishConfig, RequestConfig, SubscribeOptions,
    TimeoutConfig, DEFAULT_BROKER_QUEUE,
};
pub use lifecycle::{BusState, HandlerState, HandshakeFailures};
pub use naming::{QueueNames, FALLBACK_PREFIX, MAX_QUEUE_NAME_LENGTH};
