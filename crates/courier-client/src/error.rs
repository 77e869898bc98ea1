//! Error types for the bus client.

use crate::domain::config::ConfigError;
use shared_bus::TransportError;
use shared_types::{CodecError, ProtocolMessage, RemoteError, RequestMessage};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Bus client errors
#[derive(Debug, Error)]
pub enum BusError {
    /// No `ServiceRegisterReply` arrived in time
    #[error("service registration timed out after {timeout:?}")]
    ServiceRegisterTimeout {
        message: Box<ProtocolMessage>,
        timeout: Duration,
    },

    /// No `HandshakeReply` arrived in time
    #[error("handshake timed out after {timeout:?}")]
    HandshakeTimeout {
        message: Box<ProtocolMessage>,
        timeout: Duration,
    },

    /// No `SubscribeRegisterReply` arrived in time
    #[error("subscribe handler registration timed out after {timeout:?}")]
    SubscribeRegisterTimeout {
        message: Box<ProtocolMessage>,
        timeout: Duration,
    },

    /// No `RequestRegisterReply` arrived in time
    #[error("request handler registration timed out after {timeout:?}")]
    RequestRegisterTimeout {
        message: Box<ProtocolMessage>,
        timeout: Duration,
    },

    /// No `PublishReply` arrived in time for a persistent publish
    #[error("publish reply timed out after {timeout:?}")]
    PublishReplyTimeout {
        message: Box<ProtocolMessage>,
        timeout: Duration,
    },

    /// No response arrived in time for a request
    #[error("request timed out after {timeout:?}")]
    RequestResponseTimeout {
        message: Box<ProtocolMessage>,
        timeout: Duration,
    },

    /// Declared payload type differs from the bound or expected type
    #[error("invalid message type: expected {expected}, got {actual}")]
    InvalidMessageType { expected: String, actual: String },

    /// A handler with the same name (and topic) already exists
    #[error("handler {name} already registered{}", topic_suffix(.topic))]
    DoubleRegistration { name: String, topic: Option<String> },

    /// The broker queue is missing or the send retry was exhausted
    #[error("message broker unavailable at {queue}")]
    MessageBrokerUnavailable {
        queue: String,
        #[source]
        source: Option<TransportError>,
    },

    /// The remote request handler failed
    #[error("request handler for {} failed: {error}", .request.name)]
    RequestHandlerFailed {
        request: Box<RequestMessage>,
        error: RemoteError,
    },

    /// The bus stopped itself after repeated handshake failures
    #[error("bus stopped after {failures} consecutive handshake failures")]
    HandshakeFailed {
        failures: u32,
        #[source]
        trigger: Arc<BusError>,
    },

    /// Precondition violated by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn topic_suffix(topic: &Option<String>) -> String {
    topic
        .as_ref()
        .map(|t| format!(" on topic {t}"))
        .unwrap_or_default()
}

impl BusError {
    /// True for the six reply-timeout variants.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ServiceRegisterTimeout { .. }
                | Self::HandshakeTimeout { .. }
                | Self::SubscribeRegisterTimeout { .. }
                | Self::RequestRegisterTimeout { .. }
                | Self::PublishReplyTimeout { .. }
                | Self::RequestResponseTimeout { .. }
        )
    }

    /// The outbound message a timeout error was raised for.
    #[must_use]
    pub fn timed_out_message(&self) -> Option<&ProtocolMessage> {
        match self {
            Self::ServiceRegisterTimeout { message, .. }
            | Self::HandshakeTimeout { message, .. }
            | Self::SubscribeRegisterTimeout { message, .. }
            | Self::RequestRegisterTimeout { message, .. }
            | Self::PublishReplyTimeout { message, .. }
            | Self::RequestResponseTimeout { message, .. } => Some(message),
            _ => None,
        }
    }

    pub(crate) fn invalid_type(expected: impl ToString, actual: impl ToString) -> Self {
        Self::InvalidMessageType {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;
