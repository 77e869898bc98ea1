//! Lifecycle states for the bus and its handlers, plus the handshake
//! failure counter that decides when the bus gives up.

use std::fmt;

/// Lifecycle of a [`MessageBus`](crate::MessageBus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Lifecycle of a subscription or request handler.
///
/// ```text
/// Unconfigured ──set──→ Configured ──start──→ Running ──stop──→ Stopped
///                                                ↑                 │
///                                                └─────start───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
    Disposed,
}

impl HandlerState {
    /// Whether `start` is allowed from this state.
    #[must_use]
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Configured | Self::Stopped)
    }
}

/// Consecutive handshake failures.
#[derive(Debug, Clone)]
pub struct HandshakeFailures {
    consecutive: u32,
    threshold: u32,
}

impl HandshakeFailures {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Count one failure. Returns true once the threshold is exceeded.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive > self.threshold
    }

    #[must_use]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
