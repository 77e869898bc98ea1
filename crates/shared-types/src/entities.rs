//! # Core Entities
//!
//! Identity and handler descriptors shared by every protocol message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wall-clock timestamp carried on the wire.
pub type Timestamp = DateTime<Utc>;

/// Current wall-clock time.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Identity of one service instance on one host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Host (machine) name.
    pub server_name: String,
    /// Logical service name.
    pub service_name: String,
}

impl ServiceIdentity {
    pub fn new(server_name: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            service_name: service_name.into(),
        }
    }

    /// True when both identities live on the same host.
    #[must_use]
    pub fn same_host(&self, other: &ServiceIdentity) -> bool {
        self.server_name == other.server_name
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_name, self.server_name)
    }
}

/// A subscription handler as announced to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeHandlerInfo {
    pub name: String,
    pub topic: String,
    pub queue_name: String,
    pub durable: bool,
}

/// A request handler as announced to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHandlerInfo {
    pub name: String,
    pub queue_name: String,
}
