//! # Courier Telemetry
//!
//! Logging and metrics for services running the courier bus client.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_telemetry::{init_logging, register_metrics, TelemetryConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging(&TelemetryConfig::from_env())?;
//!     register_metrics()?;
//!     // ...
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RUST_LOG` | - | Full filter directive, overrides the level |
//! | `COURIER_LOG_LEVEL` | `info` | Log level filter |
//! | `COURIER_JSON_LOGS` | `false` (`true` in containers) | JSON output |
//! | `COURIER_SERVICE_NAME` | `courier` | Service name in the startup line |

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging};
pub use metrics::{gather_text, register_metrics, HandlerOutcome};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
