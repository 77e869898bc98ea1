//! # Protocol Messages
//!
//! The messages a bus client exchanges with the central broker. Every message
//! is one variant of [`ProtocolMessage`]; on the wire the variant is carried
//! in an explicit `kind` field.
//!
//! ## Sub-protocols
//!
//! | Outbound | Reply | Reply expected |
//! |----------|-------|----------------|
//! | `ServiceRegister` | `ServiceRegisterReply` | always |
//! | `Handshake` | `HandshakeReply` | always |
//! | `SubscribeRegister` | `SubscribeRegisterReply` | always |
//! | `RequestRegister` | `RequestRegisterReply` | always |
//! | `Publish` | `PublishReply` | persistent publishes only |
//! | `Request` | `Response` / `ResponseError` | always |
//! | `SubscribeComplete`, `SubscribeError` | - | never |
//!
//! Completion timestamps (`completed_at`) are stamped by the receiver of a
//! reply, never by its sender.

use crate::correlation::CorrelationId;
use crate::entities::{RequestHandlerInfo, ServiceIdentity, SubscribeHandlerInfo, Timestamp};
use crate::errors::RemoteError;
use crate::message_type::MessageType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant of a [`ProtocolMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    ServiceRegister,
    ServiceRegisterReply,
    Handshake,
    HandshakeReply,
    SubscribeRegister,
    SubscribeRegisterReply,
    RequestRegister,
    RequestRegisterReply,
    Publish,
    PublishReply,
    SubscribeComplete,
    SubscribeError,
    Request,
    Response,
    ResponseError,
}

impl MessageKind {
    /// Stable name, used in reply addresses and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceRegister => "ServiceRegister",
            Self::ServiceRegisterReply => "ServiceRegisterReply",
            Self::Handshake => "Handshake",
            Self::HandshakeReply => "HandshakeReply",
            Self::SubscribeRegister => "SubscribeRegister",
            Self::SubscribeRegisterReply => "SubscribeRegisterReply",
            Self::RequestRegister => "RequestRegister",
            Self::RequestRegisterReply => "RequestRegisterReply",
            Self::Publish => "Publish",
            Self::PublishReply => "PublishReply",
            Self::SubscribeComplete => "SubscribeComplete",
            Self::SubscribeError => "SubscribeError",
            Self::Request => "Request",
            Self::Response => "Response",
            Self::ResponseError => "ResponseError",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every message that can travel between a bus client and the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ProtocolMessage {
    ServiceRegister(ServiceRegisterMessage),
    ServiceRegisterReply(ServiceRegisterReplyMessage),
    Handshake(HandshakeMessage),
    HandshakeReply(HandshakeReplyMessage),
    SubscribeRegister(SubscribeRegisterMessage),
    SubscribeRegisterReply(SubscribeRegisterReplyMessage),
    RequestRegister(RequestRegisterMessage),
    RequestRegisterReply(RequestRegisterReplyMessage),
    Publish(PublishMessage),
    PublishReply(PublishReplyMessage),
    SubscribeComplete(SubscribeCompleteMessage),
    SubscribeError(SubscribeErrorMessage),
    Request(RequestMessage),
    Response(ResponseMessage),
    ResponseError(ResponseErrorMessage),
}

impl ProtocolMessage {
    /// The discriminant of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ServiceRegister(_) => MessageKind::ServiceRegister,
            Self::ServiceRegisterReply(_) => MessageKind::ServiceRegisterReply,
            Self::Handshake(_) => MessageKind::Handshake,
            Self::HandshakeReply(_) => MessageKind::HandshakeReply,
            Self::SubscribeRegister(_) => MessageKind::SubscribeRegister,
            Self::SubscribeRegisterReply(_) => MessageKind::SubscribeRegisterReply,
            Self::RequestRegister(_) => MessageKind::RequestRegister,
            Self::RequestRegisterReply(_) => MessageKind::RequestRegisterReply,
            Self::Publish(_) => MessageKind::Publish,
            Self::PublishReply(_) => MessageKind::PublishReply,
            Self::SubscribeComplete(_) => MessageKind::SubscribeComplete,
            Self::SubscribeError(_) => MessageKind::SubscribeError,
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) => MessageKind::Response,
            Self::ResponseError(_) => MessageKind::ResponseError,
        }
    }

    /// The address a reply to this message must be sent to, if any.
    pub fn reply_to(&self) -> Option<&str> {
        match self {
            Self::ServiceRegister(m) => Some(&m.reply_to),
            Self::Handshake(m) => Some(&m.reply_to),
            Self::SubscribeRegister(m) => Some(&m.reply_to),
            Self::RequestRegister(m) => Some(&m.reply_to),
            Self::Publish(m) => m.reply_to.as_deref(),
            Self::Request(m) => Some(&m.reply_to),
            Self::Response(m) => Some(&m.reply_to),
            Self::ResponseError(m) => Some(&m.reply_to),
            Self::ServiceRegisterReply(_)
            | Self::HandshakeReply(_)
            | Self::SubscribeRegisterReply(_)
            | Self::RequestRegisterReply(_)
            | Self::PublishReply(_)
            | Self::SubscribeComplete(_)
            | Self::SubscribeError(_) => None,
        }
    }
}

// =============================================================================
// SERVICE REGISTRATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegisterMessage {
    pub origin: ServiceIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    pub reply_to: String,
    pub issued_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegisterReplyMessage {
    pub service_name: String,
    pub issued_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Full-state announcement of every handler a bus instance currently runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub origin: ServiceIdentity,
    pub subscribe_handlers: Vec<SubscribeHandlerInfo>,
    pub request_handlers: Vec<RequestHandlerInfo>,
    pub reply_to: String,
    pub issued_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReplyMessage {
    pub issued_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

// =============================================================================
// HANDLER REGISTRATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRegisterMessage {
    pub origin: ServiceIdentity,
    pub handler: SubscribeHandlerInfo,
    pub reply_to: String,
    pub issued_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRegisterReplyMessage {
    pub name: String,
    pub topic: String,
    pub issued_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRegisterMessage {
    pub origin: ServiceIdentity,
    pub handler: RequestHandlerInfo,
    pub reply_to: String,
    pub issued_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRegisterReplyMessage {
    pub name: String,
    pub issued_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

// =============================================================================
// PUBLISH / SUBSCRIBE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub origin: ServiceIdentity,
    pub correlation_id: CorrelationId,
    pub topic: String,
    pub persistent: bool,
    /// JSON-encoded payload.
    pub body: String,
    pub message_type: MessageType,
    /// Present only for persistent publishes.
    #[serde(default)]
    pub reply_to: Option<String>,
    pub issued_at: Timestamp,
    #[serde(default)]
    pub error_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReplyMessage {
    pub correlation_id: CorrelationId,
    pub topic: String,
    pub issued_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeCompleteMessage {
    pub publisher: ServiceIdentity,
    pub handler: ServiceIdentity,
    pub correlation_id: CorrelationId,
    pub name: String,
    pub topic: String,
    pub message_type: MessageType,
    pub persistent: bool,
    pub published_at: Timestamp,
    pub handled_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeErrorMessage {
    pub publisher: ServiceIdentity,
    pub handler: ServiceIdentity,
    pub correlation_id: CorrelationId,
    pub name: String,
    pub durable: bool,
    /// The publish that failed, for broker-side redelivery.
    pub message: PublishMessage,
    pub error: RemoteError,
    pub published_at: Timestamp,
    pub handled_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub requester: ServiceIdentity,
    pub correlation_id: CorrelationId,
    pub name: String,
    /// JSON-encoded payload.
    pub body: String,
    pub message_type: MessageType,
    pub reply_to: String,
    pub issued_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub requester: ServiceIdentity,
    pub responder: ServiceIdentity,
    pub correlation_id: CorrelationId,
    pub reply_to: String,
    /// JSON-encoded payload; `null` for an empty response.
    pub body: String,
    /// `None` for an empty response.
    #[serde(default)]
    pub message_type: Option<MessageType>,
    pub requested_at: Timestamp,
    pub responded_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseErrorMessage {
    pub requester: ServiceIdentity,
    pub responder: ServiceIdentity,
    pub correlation_id: CorrelationId,
    pub reply_to: String,
    pub request: RequestMessage,
    pub error: RemoteError,
    pub requested_at: Timestamp,
    pub responded_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}
