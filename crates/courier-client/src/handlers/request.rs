//! Request handler: answers requests addressed to one name.

use super::{ConsumeSettings, Consumer, Processor};
use crate::adapters::MessageBroker;
use crate::domain::lifecycle::HandlerState;
use crate::error::{BusError, BusResult};
use crate::ports::inbound::{cancellable_request_callback, request_callback, RequestCallback};
use crate::ports::outbound::QueueMode;
use async_trait::async_trait;
use bytes::Bytes;
use courier_telemetry::metrics::{self, HandlerOutcome};
use parking_lot::Mutex;
use shared_types::{
    decode, BusMessage, MessageType, ProtocolMessage, RemoteError, RequestHandlerInfo,
    RequestMessage,
};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct Binding {
    request_type: MessageType,
    callback: RequestCallback,
}

struct Inner {
    state: HandlerState,
    binding: Option<Binding>,
    consumer: Option<Consumer>,
}

/// Serves requests named `name`.
///
/// The queue is private to this instance; the broker learns its address
/// from the registration sent on start and from every handshake.
pub struct RequestHandler {
    name: String,
    multi_threaded: bool,
    queue_name: String,
    broker: Arc<MessageBroker>,
    inner: Mutex<Inner>,
}

impl RequestHandler {
    pub fn new(
        broker: Arc<MessageBroker>,
        name: impl Into<String>,
        multi_threaded: bool,
    ) -> BusResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(BusError::InvalidArgument("request name is required".into()));
        }
        let queue_name = broker.names().build(&name, false)?;

        Ok(Self {
            name,
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

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> HandlerState {
        self.inner.lock().state
    }

    pub fn info(&self) -> RequestHandlerInfo {
        RequestHandlerInfo {
            name: self.name.clone(),
            queue_name: self.queue_name.clone(),
        }
    }

    /// Bind the callback. Allowed once.
    pub fn set<Req, Resp, F, Fut>(&self, handler: F) -> BusResult<()>
    where
        Req: BusMessage,
        Resp: BusMessage,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.bind(Req::message_type(), request_callback(handler))
    }

    pub fn set_cancellable<Req, Resp, F, Fut>(&self, handler: F) -> BusResult<()>
    where
        Req: BusMessage,
        Resp: BusMessage,
        F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.bind(Req::message_type(), cancellable_request_callback(handler))
    }

    fn bind(&self, request_type: MessageType, callback: RequestCallback) -> BusResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != HandlerState::Unconfigured {
            return Err(BusError::InvalidState(format!(
                "request handler {} already has a callback",
                self.name
            )));
        }
        inner.binding = Some(Binding {
            request_type,
            callback,
        });
        inner.state = HandlerState::Configured;
        Ok(())
    }

    /// Create the queue, register with the broker, then consume.
    pub async fn start(&self, cancel: &CancellationToken) -> BusResult<()> {
        let binding = {
            let inner = self.inner.lock();
            match (&inner.binding, inner.state.can_start()) {
                (Some(binding), true) => binding.clone(),
                _ => {
                    return Err(BusError::InvalidState(format!(
                        "request handler {} cannot start while {:?}",
                        self.name, inner.state
                    )))
                }
            }
        };

        let queue = self
            .broker
            .queue_factory()
            .create(&self.queue_name, false, QueueMode::TemporaryMaster, true)
            .await?;
        self.broker.register_request_handler(self.info(), cancel).await?;

        let processor = Arc::new(RequestProcessor {
            name: self.name.clone(),
            broker: Arc::clone(&self.broker),
            binding,
        });
        let settings = ConsumeSettings::from_config(self.broker.config(), self.multi_threaded);
        let consumer = Consumer::spawn(queue, processor, settings, cancel);

        let mut inner = self.inner.lock();
        inner.consumer = Some(consumer);
        inner.state = HandlerState::Running;
        info!(name = %self.name, queue = %self.queue_name, "Request handler started");
        Ok(())
    }

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
        debug!(name = %self.name, "Request handler stopped");
    }

    pub async fn dispose(&self) {
        self.stop().await;
        let mut inner = self.inner.lock();
        inner.binding = None;
        inner.state = HandlerState::Disposed;
    }
}

struct RequestProcessor {
    name: String,
    broker: Arc<MessageBroker>,
    binding: Binding,
}

impl RequestProcessor {
    async fn handle(&self, request: &RequestMessage, cancel: CancellationToken) -> HandlerOutcome {
        if request.message_type != self.binding.request_type {
            let mismatch = BusError::invalid_type(&self.binding.request_type, &request.message_type);
            warn!(name = %self.name, error = %mismatch, "Rejecting request");
            self.reply_error(request, RemoteError::from_error("invalid_message_type", &mismatch))
                .await;
            return HandlerOutcome::Rejected;
        }

        match (self.binding.callback)(request.body.clone(), cancel).await {
            Ok(payload) => {
                if let Err(e) = self
                    .broker
                    .send_response(&request.reply_to, request, payload)
                    .await
                {
                    warn!(name = %self.name, correlation_id = %request.correlation_id, error = %e, "Could not send response");
                }
                HandlerOutcome::Completed
            }
            Err(failure) => {
                let remote = failure.to_remote();
                warn!(name = %self.name, correlation_id = %request.correlation_id, error = %remote, "Request callback failed");
                self.reply_error(request, remote).await;
                HandlerOutcome::Failed
            }
        }
    }

    async fn reply_error(&self, request: &RequestMessage, error: RemoteError) {
        if let Err(e) = self
            .broker
            .send_response_error(&request.reply_to, request, error)
            .await
        {
            warn!(name = %self.name, error = %e, "Could not send response error");
        }
    }
}

#[async_trait]
impl Processor for RequestProcessor {
    async fn process(&self, message: Bytes, cancel: CancellationToken) {
        let request = match decode(&message) {
            Ok(ProtocolMessage::Request(request)) => request,
            Ok(other) => {
                warn!(name = %self.name, kind = %other.kind(), "Dropping unexpected message");
                return;
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "Dropping undecodable message");
                return;
            }
        };

        let outcome = self.handle(&request, cancel).await;
        metrics::record_handler_outcome(&self.name, outcome);
    }
}
