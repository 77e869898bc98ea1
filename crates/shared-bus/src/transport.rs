//! # Queue Transport Port
//!
//! The boundary between the bus client and whatever queuing product carries
//! its bytes. The client never touches a concrete transport; it asks a
//! [`QueueFactory`] for [`Queue`] handles by address.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How a queue handle binds to its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueMode {
    /// Attach to an existing durable queue; never creates it.
    Durable,
    /// Attach to a durable queue, creating it when missing.
    DurableCreate,
    /// Create a temporary queue owned by this handle. The queue is removed
    /// when the handle is dropped.
    TemporaryMaster,
    /// Attach to a temporary queue owned by someone else.
    TemporarySlave,
}

impl QueueMode {
    /// True for modes that bring the queue into existence.
    #[must_use]
    pub fn creates(&self) -> bool {
        matches!(self, Self::DurableCreate | Self::TemporaryMaster)
    }
}

/// Errors raised by the queue transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No queue exists at the address.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The transport refused or lost a message.
    #[error("send to {address} failed: {reason}")]
    SendFailed { address: String, reason: String },

    /// The connection to the queue was lost.
    #[error("disconnected from {0}")]
    Disconnected(String),
}

/// A handle on one named queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Address this handle is bound to.
    fn address(&self) -> &str;

    /// Enqueue one message.
    async fn send(&self, message: Bytes) -> Result<(), TransportError>;

    /// Dequeue one message, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout elapses or `cancel` fires first.
    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, TransportError>;

    /// Whether the queue currently exists.
    async fn exists(&self) -> bool;

    /// Drop and re-establish the connection behind this handle.
    async fn reconnect(&self) -> Result<(), TransportError>;
}

/// Creates queue handles.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    async fn create(
        &self,
        address: &str,
        durable: bool,
        mode: QueueMode,
        transactional: bool,
    ) -> Result<Arc<dyn Queue>, TransportError>;
}
