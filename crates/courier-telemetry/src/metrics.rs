//! Prometheus metrics for bus activity.
//!
//! All metrics follow the naming convention: `courier_<what>_<unit>`.
//! Collectors live in a private registry; [`register_metrics`] attaches them
//! and [`gather_text`] renders the text exposition format.
//!
//! Recording never fails: if a collector could not be built the recording
//! helpers do nothing.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Opts, Registry, TextEncoder};

use crate::TelemetryError;

/// Outcome label for [`record_handler_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed,
    Failed,
    Rejected,
}

impl HandlerOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

struct BusMetrics {
    messages_sent: CounterVec,
    send_retries: Counter,
    handshake_failures: Counter,
    request_timeouts: Counter,
    handler_outcomes: CounterVec,
}

impl BusMetrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            messages_sent: CounterVec::new(
                Opts::new("courier_messages_sent_total", "Protocol messages sent to the broker"),
                &["kind"],
            )?,
            send_retries: Counter::new(
                "courier_send_retries_total",
                "Broker sends retried after a reconnect",
            )?,
            handshake_failures: Counter::new(
                "courier_handshake_failures_total",
                "Periodic handshakes that failed",
            )?,
            request_timeouts: Counter::new(
                "courier_request_timeouts_total",
                "Requests that received no reply in time",
            )?,
            handler_outcomes: CounterVec::new(
                Opts::new("courier_handler_outcomes_total", "Inbound messages by handler and outcome"),
                &["handler", "outcome"],
            )?,
        })
    }

    fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(self.messages_sent.clone()),
            Box::new(self.send_retries.clone()),
            Box::new(self.handshake_failures.clone()),
            Box::new(self.request_timeouts.clone()),
            Box::new(self.handler_outcomes.clone()),
        ];

        for collector in collectors {
            match registry.register(collector) {
                Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref METRICS: Option<BusMetrics> = BusMetrics::new().ok();
}

/// Register all collectors with the registry. Safe to call repeatedly.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics = METRICS
        .as_ref()
        .ok_or_else(|| TelemetryError::MetricsInit("collector construction failed".into()))?;
    metrics
        .register(&REGISTRY)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// A protocol message of `kind` was handed to the transport.
pub fn record_message_sent(kind: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.messages_sent.with_label_values(&[kind]).inc();
    }
}

pub fn record_send_retry() {
    if let Some(m) = METRICS.as_ref() {
        m.send_retries.inc();
    }
}

pub fn record_handshake_failure() {
    if let Some(m) = METRICS.as_ref() {
        m.handshake_failures.inc();
    }
}

pub fn record_request_timeout() {
    if let Some(m) = METRICS.as_ref() {
        m.request_timeouts.inc();
    }
}

/// An inbound message finished processing on `handler`.
pub fn record_handler_outcome(handler: &str, outcome: HandlerOutcome) {
    if let Some(m) = METRICS.as_ref() {
        m.handler_outcomes
            .with_label_values(&[handler, outcome.as_label()])
            .inc();
    }
}
