//! # Queue Naming
//!
//! Deterministic, length-bounded queue addresses.
//!
//! ```text
//! durable:      {service}.{name}           or  Courier.{name}
//! non-durable:  #{service}.{name}.{key}    (truncated so the whole fits)
//! ```
//!
//! Durable addresses must be stable across restarts, so they are never
//! truncated; one that cannot fit is an argument error. Non-durable addresses
//! always end in a fresh unique key, which is what makes a reply address a
//! private mailbox.

use crate::error::{BusError, BusResult};
use shared_types::{CorrelationId, MessageKind};

/// Longest address any queue may have, in characters.
pub const MAX_QUEUE_NAME_LENGTH: usize = 99;

/// Prefix substituted for the service name when the natural address is too long.
pub const FALLBACK_PREFIX: &str = "Courier";

/// Marker prefix of non-durable addresses.
const TEMPORARY_MARKER: char = '#';

/// Builds queue addresses for one service.
#[derive(Debug, Clone)]
pub struct QueueNames {
    service_name: String,
}

impl QueueNames {
    /// `$` in service names is normalised to `.`.
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: normalize_service_name(service_name),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Address for `name`.
    ///
    /// Fails only for durable names that do not fit even behind the fallback
    /// prefix.
    pub fn build(&self, name: &str, durable: bool) -> BusResult<String> {
        let mut address = format!("{}.{}", self.service_name, name);

        if char_len(&address) > MAX_QUEUE_NAME_LENGTH {
            address = format!("{FALLBACK_PREFIX}.{name}");
        }

        if !durable {
            return Ok(temporary(&address));
        }

        if char_len(&address) > MAX_QUEUE_NAME_LENGTH {
            return Err(BusError::InvalidArgument(format!(
                "durable queue name too long: {name}"
            )));
        }

        Ok(address)
    }

    /// Address for subscription `name` on `topic`.
    pub fn build_for_topic(&self, topic: &str, name: &str, durable: bool) -> BusResult<String> {
        self.build(&format!("{topic}.{name}"), durable)
    }

    /// Private reply address for one outbound message of `kind`.
    pub fn reply_address(&self, kind: MessageKind, id: Option<&str>) -> String {
        let name = match id {
            Some(id) if !id.is_empty() => format!("Reply.{kind}.{id}"),
            _ => format!("Reply.{kind}"),
        };

        let mut address = format!("{}.{}", self.service_name, name);
        if char_len(&address) > MAX_QUEUE_NAME_LENGTH {
            address = format!("{FALLBACK_PREFIX}.{name}");
        }
        temporary(&address)
    }
}

/// Normalise a service name for use in addresses.
pub fn normalize_service_name(service_name: &str) -> String {
    service_name.replace('$', ".")
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Mark as temporary, then truncate and append a unique key.
fn temporary(address: &str) -> String {
    let key = CorrelationId::new().simple();
    let keep = MAX_QUEUE_NAME_LENGTH - key.len() - 1;
    let head: String = std::iter::once(TEMPORARY_MARKER)
        .chain(address.chars())
        .take(keep)
        .collect();
    format!("{head}.{key}")
}
