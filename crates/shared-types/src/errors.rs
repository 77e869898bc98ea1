//! Error types shared across crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from the wire codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A value could not be serialized.
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Bytes or a body string could not be deserialized.
    #[error("failed to deserialize {what}: {source}")]
    Deserialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Opaque, serializable description of a failure on the far side of the bus.
///
/// Handler errors cannot cross a queue as live error objects, so the error
/// and its `source()` chain are flattened into strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Short machine-readable category, e.g. `handler_error` or `panic`.
    pub kind: String,
    /// Top-level error message.
    pub message: String,
    /// Messages of the underlying causes, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            chain: Vec::new(),
        }
    }

    /// Flatten an error and its source chain.
    pub fn from_error(kind: impl Into<String>, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: kind.into(),
            message: error.to_string(),
            chain,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        for cause in &self.chain {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
