//! Subscription handler: consumes publishes on one topic.

use super::{ConsumeSettings, Consumer, Processor};
use crate::adapters::MessageBroker;
use crate::domain::lifecycle::HandlerState;
use crate::error::{BusError, BusResult};
use crate::ports::inbound::{cancellable_subscribe_callback, subscribe_callback, SubscribeCallback};
use crate::ports::outbound::QueueMode;
use async_trait::async_trait;
use bytes::Bytes;
use courier_telemetry::metrics::{self, HandlerOutcome};
use parking_lot::Mutex;
use shared_types::{
    decode, BusMessage, MessageType, ProtocolMessage, PublishMessage, RemoteError,
    SubscribeHandlerInfo,
};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback bound to the payload type it accepts.
#[derive(Clone)]
struct Binding {
    message_type: MessageType,
    callback: SubscribeCallback,
}

struct Inner {
    state: HandlerState,
    binding: Option<Binding>,
    consumer: Option<Consumer>,
}

/// Receives every message published on `topic` under subscription `name`.
///
/// Durable subscriptions keep a stable queue that outlives the process;
/// non-durable ones get a fresh private queue per instance.
pub struct SubscribeHandler {
    name: String,
    topic: String,
    durable: bool,
    multi_threaded: bool,
    queue_name: String,
    broker: Arc<MessageBroker>,
    inner: Mutex<Inner>,
}

impl SubscribeHandler {
    pub fn new(
        broker: Arc<MessageBroker>,
        name: impl Into<String>,
        topic: impl Into<String>,
        durable: bool,
        multi_threaded: bool,
    ) -> BusResult<Self> {
        let name = name.into();
        let topic = topic.into();
        if name.is_empty() || topic.is_empty() {
            return Err(BusError::InvalidArgument(
                "subscription name and topic are required".into(),
            ));
        }
        let queue_name = broker.names().build_for_topic(&topic, &name, durable)?;

        Ok(Self {
            name,
            topic,
            durable,
            multi_threaded,
            queue_name,
            broker,
            inner: Mutex::new(Inner {
                state: HandlerState::Unconfigured,
                binding: None,
                consumer: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> HandlerState {
        self.inner.lock().state
    }

    /// Descriptor announced to the broker.
    pub fn info(&self) -> SubscribeHandlerInfo {
        SubscribeHandlerInfo {
            name: self.name.clone(),
            topic: self.topic.clone(),
            queue_name: self.queue_name.clone(),
            durable: self.durable,
        }
    }

    /// Bind the callback. Allowed once.
    pub fn set<T, F, Fut>(&self, handler: F) -> BusResult<()>
    where
        T: BusMessage,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bind(T::message_type(), subscribe_callback(handler))
    }

    /// Bind a callback that also receives the handler's cancellation token.
    pub fn set_cancellable<T, F, Fut>(&self, handler: F) -> BusResult<()>
    where
        T: BusMessage,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bind(T::message_type(), cancellable_subscribe_callback(handler))
    }

    fn bind(&self, message_type: MessageType, callback: SubscribeCallback) -> BusResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != HandlerState::Unconfigured {
            return Err(BusError::InvalidState(format!(
                "subscription {} already has a callback",
                self.name
            )));
        }
        inner.binding = Some(Binding {
            message_type,
            callback,
        });
        inner.state = HandlerState::Configured;
        Ok(())
    }

    /// Open the queue and begin consuming.
    pub async fn start(&self, cancel: &CancellationToken) -> BusResult<()> {
        let binding = {
            let inner = self.inner.lock();
            match (&inner.binding, inner.state.can_start()) {
                (Some(binding), true) => binding.clone(),
                _ => {
                    return Err(BusError::InvalidState(format!(
                        "subscription {} cannot start while {:?}",
                        self.name, inner.state
                    )))
                }
            }
        };

        let config = self.broker.config();
        if config.register_subscriptions_on_start {
            self.broker.register_subscribe_handler(self.info(), cancel).await?;
        }

        let mode = if self.durable {
            QueueMode::DurableCreate
        } else {
            QueueMode::TemporaryMaster
        };
        let queue = self
            .broker
            .queue_factory()
            .create(&self.queue_name, self.durable, mode, true)
            .await?;

        let processor = Arc::new(SubscribeProcessor {
            name: self.name.clone(),
            durable: self.durable,
            broker: Arc::clone(&self.broker),
            binding,
        });
        let settings = ConsumeSettings::from_config(config, self.multi_threaded);
        let consumer = Consumer::spawn(queue, processor, settings, cancel);

        let mut inner = self.inner.lock();
        inner.consumer = Some(consumer);
        inner.state = HandlerState::Running;
        info!(name = %self.name, topic = %self.topic, queue = %self.queue_name, "Subscription started");
        Ok(())
    }

    /// Stop consuming. No-op unless running.
    pub async fn stop(&self) {
        let consumer = {
            let mut inner = self.inner.lock();
            if inner.state != HandlerState::Running {
                return;
            }
            inner.state = HandlerState::Stopped;
            inner.consumer.take()
        };

        if let Some(consumer) = consumer {
            consumer.stop().await;
        }
        debug!(name = %self.name, "Subscription stopped");
    }

    /// Stop and release the callback.
    pub async fn dispose(&self) {
        self.stop().await;
        let mut inner = self.inner.lock();
        inner.binding = None;
        inner.state = HandlerState::Disposed;
    }
}

struct SubscribeProcessor {
    name: String,
    durable: bool,
    broker: Arc<MessageBroker>,
    binding: Binding,
}

impl SubscribeProcessor {
    async fn handle(&self, publish: &PublishMessage, cancel: CancellationToken) -> HandlerOutcome {
        if publish.message_type != self.binding.message_type {
            let mismatch = BusError::invalid_type(&self.binding.message_type, &publish.message_type);
            warn!(name = %self.name, error = %mismatch, "Rejecting publish");
            self.report_error(publish, RemoteError::from_error("invalid_message_type", &mismatch))
                .await;
            return HandlerOutcome::Rejected;
        }

        match (self.binding.callback)(publish.body.clone(), cancel).await {
            Ok(()) => {
                if let Err(e) = self.broker.report_subscribe_complete(&self.name, publish).await {
                    warn!(name = %self.name, error = %e, "Could not report completion");
                }
                HandlerOutcome::Completed
            }
            Err(failure) => {
                let remote = failure.to_remote();
                warn!(name = %self.name, correlation_id = %publish.correlation_id, error = %remote, "Subscription callback failed");
                self.report_error(publish, remote).await;
                HandlerOutcome::Failed
            }
        }
    }

    async fn report_error(&self, publish: &PublishMessage, error: RemoteError) {
        if let Err(e) = self
            .broker
            .report_subscribe_error(&self.name, self.durable, publish, error)
            .await
        {
            warn!(name = %self.name, error = %e, "Could not report subscription error");
        }
    }
}

#[async_trait]
impl Processor for SubscribeProcessor {
    async fn process(&self, message: Bytes, cancel: CancellationToken) {
        let publish = match decode(&message) {
            Ok(ProtocolMessage::Publish(publish)) => publish,
            Ok(other) => {
                warn!(name = %self.name, kind = %other.kind(), "Dropping unexpected message");
                return;
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "Dropping undecodable message");
                return;
            }
        };

        let outcome = self.handle(&publish, cancel).await;
        metrics::record_handler_outcome(&self.name, outcome);
    }
}
