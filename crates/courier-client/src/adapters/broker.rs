//! # Message Broker Adapter
//!
//! The only channel between this process and the central broker. Every
//! outbound protocol message goes through [`MessageBroker::send_to_broker`],
//! which serialises senders on the single broker queue handle and applies the
//! retry policy:
//!
//! ```text
//! send ──fail──→ reconnect ──→ send ──fail──→ MessageBrokerUnavailable
//!   │                            │
//!   └─ok─────────────────────────┴─ok──→ done
//! ```
//!
//! Calls that expect a reply allocate a private temporary queue for it (see
//! [`QueueNames::reply_address`]), wait on that queue alone and tear it down
//! afterwards. There is no shared table of pending calls.

use crate::domain::config::BusConfig;
use crate::domain::naming::QueueNames;
use crate::error::{BusError, BusResult};
use crate::ports::inbound::ResponsePayload;
use crate::ports::outbound::{HostIdentity, Queue, QueueFactory, QueueMode};
use courier_telemetry::metrics;
use shared_types::{
    decode, decode_body, encode, encode_body, now, BusMessage, CorrelationId, HandshakeMessage,
    HandshakeReplyMessage, MessageKind, ProtocolMessage, PublishMessage, PublishReplyMessage,
    RemoteError, RequestHandlerInfo, RequestMessage, RequestRegisterMessage,
    RequestRegisterReplyMessage, ResponseErrorMessage, ResponseMessage, ServiceIdentity,
    ServiceRegisterMessage, ServiceRegisterReplyMessage, SubscribeCompleteMessage,
    SubscribeErrorMessage, SubscribeHandlerInfo, SubscribeRegisterMessage,
    SubscribeRegisterReplyMessage, NULL_BODY,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client half of the broker protocol.
pub struct MessageBroker {
    config: Arc<BusConfig>,
    identity: ServiceIdentity,
    names: QueueNames,
    queue_factory: Arc<dyn QueueFactory>,
    /// Opened on first use; `None` again after dispose.
    broker_queue: Mutex<Option<Arc<dyn Queue>>>,
}

impl MessageBroker {
    pub fn new(
        config: Arc<BusConfig>,
        service_name: &str,
        host: &dyn HostIdentity,
        queue_factory: Arc<dyn QueueFactory>,
    ) -> Self {
        let names = QueueNames::new(service_name);
        let identity = ServiceIdentity::new(host.machine_name(), names.service_name());

        Self {
            config,
            identity,
            names,
            queue_factory,
            broker_queue: Mutex::new(None),
        }
    }

    /// This service instance as seen by the broker.
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn queue_factory(&self) -> &Arc<dyn QueueFactory> {
        &self.queue_factory
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// Fails with `MessageBrokerUnavailable` unless the broker queue exists.
    pub async fn check_reachable(&self) -> BusResult<()> {
        let mut slot = self.broker_queue.lock().await;
        let queue = self.open_broker_queue(&mut slot).await?;

        if queue.exists().await {
            Ok(())
        } else {
            Err(self.unavailable(None))
        }
    }

    pub async fn register_service(
        &self,
        cancel: &CancellationToken,
    ) -> BusResult<ServiceRegisterReplyMessage> {
        let timeout = self.config.timeouts.service_register;
        let message = ProtocolMessage::ServiceRegister(ServiceRegisterMessage {
            origin: self.identity.clone(),
            instance_name: self.config.instance_name.clone(),
            reply_to: self.names.reply_address(MessageKind::ServiceRegister, None),
            issued_at: now(),
        });

        debug!(service = %self.identity, "Registering service");

        match self.exchange(&message, timeout, cancel).await? {
            Some(ProtocolMessage::ServiceRegisterReply(mut reply)) => {
                reply.completed_at = Some(now());
                info!(service = %self.identity, "Service registered with broker");
                Ok(reply)
            }
            Some(other) => Err(unexpected_reply(MessageKind::ServiceRegisterReply, &other)),
            None => Err(BusError::ServiceRegisterTimeout {
                message: Box::new(message),
                timeout,
            }),
        }
    }

    pub async fn register_subscribe_handler(
        &self,
        handler: SubscribeHandlerInfo,
        cancel: &CancellationToken,
    ) -> BusResult<SubscribeRegisterReplyMessage> {
        let timeout = self.config.timeouts.handler_register;
        let message = ProtocolMessage::SubscribeRegister(SubscribeRegisterMessage {
            origin: self.identity.clone(),
            handler,
            reply_to: self.names.reply_address(MessageKind::SubscribeRegister, None),
            issued_at: now(),
        });

        match self.exchange(&message, timeout, cancel).await? {
            Some(ProtocolMessage::SubscribeRegisterReply(mut reply)) => {
                reply.completed_at = Some(now());
                debug!(name = %reply.name, topic = %reply.topic, "Subscribe handler registered");
                Ok(reply)
            }
            Some(other) => Err(unexpected_reply(MessageKind::SubscribeRegisterReply, &other)),
            None => Err(BusError::SubscribeRegisterTimeout {
                message: Box::new(message),
                timeout,
            }),
        }
    }

    pub async fn register_request_handler(
        &self,
        handler: RequestHandlerInfo,
        cancel: &CancellationToken,
    ) -> BusResult<RequestRegisterReplyMessage> {
        let timeout = self.config.timeouts.handler_register;
        let message = ProtocolMessage::RequestRegister(RequestRegisterMessage {
            origin: self.identity.clone(),
            handler,
            reply_to: self.names.reply_address(MessageKind::RequestRegister, None),
            issued_at: now(),
        });

        match self.exchange(&message, timeout, cancel).await? {
            Some(ProtocolMessage::RequestRegisterReply(mut reply)) => {
                reply.completed_at = Some(now());
                debug!(name = %reply.name, "Request handler registered");
                Ok(reply)
            }
            Some(other) => Err(unexpected_reply(MessageKind::RequestRegisterReply, &other)),
            None => Err(BusError::RequestRegisterTimeout {
                message: Box::new(message),
                timeout,
            }),
        }
    }

    /// Announce the complete current handler set.
    pub async fn send_handshake(
        &self,
        subscribe_handlers: Vec<SubscribeHandlerInfo>,
        request_handlers: Vec<RequestHandlerInfo>,
        cancel: &CancellationToken,
    ) -> BusResult<HandshakeReplyMessage> {
        let timeout = self.config.timeouts.handshake;
        let message = ProtocolMessage::Handshake(HandshakeMessage {
            origin: self.identity.clone(),
            subscribe_handlers,
            request_handlers,
            reply_to: self.names.reply_address(MessageKind::Handshake, None),
            issued_at: now(),
        });

        match self.exchange(&message, timeout, cancel).await? {
            Some(ProtocolMessage::HandshakeReply(mut reply)) => {
                reply.completed_at = Some(now());
                Ok(reply)
            }
            Some(other) => Err(unexpected_reply(MessageKind::HandshakeReply, &other)),
            None => Err(BusError::HandshakeTimeout {
                message: Box::new(message),
                timeout,
            }),
        }
    }

    // =========================================================================
    // PUBLISH / SUBSCRIBE
    // =========================================================================

    /// Publish `payload` on `topic`.
    ///
    /// Persistent publishes wait for the broker's acknowledgement; the rest
    /// are fire-and-forget and get a locally synthesised reply.
    pub async fn publish<T: BusMessage>(
        &self,
        topic: &str,
        payload: &T,
        persistent: bool,
        cancel: &CancellationToken,
    ) -> BusResult<PublishReplyMessage> {
        let correlation_id = CorrelationId::new();
        let publish = PublishMessage {
            origin: self.identity.clone(),
            correlation_id,
            topic: topic.to_string(),
            persistent,
            body: encode_body(payload)?,
            message_type: T::message_type(),
            reply_to: persistent.then(|| {
                self.names
                    .reply_address(MessageKind::Publish, Some(&correlation_id.simple()))
            }),
            issued_at: now(),
            error_count: 0,
        };

        debug!(topic, %correlation_id, persistent, "Publishing");

        if !persistent {
            let issued_at = publish.issued_at;
            self.send_to_broker(&ProtocolMessage::Publish(publish)).await?;
            return Ok(PublishReplyMessage {
                correlation_id,
                topic: topic.to_string(),
                issued_at,
                completed_at: Some(now()),
            });
        }

        let timeout = self.config.timeouts.publish_reply;
        let message = ProtocolMessage::Publish(publish);
        match self.exchange(&message, timeout, cancel).await? {
            Some(ProtocolMessage::PublishReply(mut reply)) => {
                reply.completed_at = Some(now());
                Ok(reply)
            }
            Some(other) => Err(unexpected_reply(MessageKind::PublishReply, &other)),
            None => Err(BusError::PublishReplyTimeout {
                message: Box::new(message),
                timeout,
            }),
        }
    }

    pub async fn report_subscribe_complete(
        &self,
        name: &str,
        publish: &PublishMessage,
    ) -> BusResult<()> {
        let message = ProtocolMessage::SubscribeComplete(SubscribeCompleteMessage {
            publisher: publish.origin.clone(),
            handler: self.identity.clone(),
            correlation_id: publish.correlation_id,
            name: name.to_string(),
            topic: publish.topic.clone(),
            message_type: publish.message_type.clone(),
            persistent: publish.persistent,
            published_at: publish.issued_at,
            handled_at: now(),
            completed_at: None,
        });
        self.send_to_broker(&message).await
    }

    /// Report a failed subscription callback. Redelivery is the broker's call.
    pub async fn report_subscribe_error(
        &self,
        name: &str,
        durable: bool,
        publish: &PublishMessage,
        error: RemoteError,
    ) -> BusResult<()> {
        let message = ProtocolMessage::SubscribeError(SubscribeErrorMessage {
            publisher: publish.origin.clone(),
            handler: self.identity.clone(),
            correlation_id: publish.correlation_id,
            name: name.to_string(),
            durable,
            message: publish.clone(),
            error,
            published_at: publish.issued_at,
            handled_at: now(),
            completed_at: None,
        });
        self.send_to_broker(&message).await
    }

    // =========================================================================
    // REQUEST / RESPONSE
    // =========================================================================

    /// Send a request and wait up to `timeout` for its response.
    pub async fn request_response<Req, Resp>(
        &self,
        name: &str,
        request: &Req,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BusResult<Resp>
    where
        Req: BusMessage,
        Resp: BusMessage,
    {
        let correlation_id = CorrelationId::new();
        let message = ProtocolMessage::Request(RequestMessage {
            requester: self.identity.clone(),
            correlation_id,
            name: name.to_string(),
            body: encode_body(request)?,
            message_type: Req::message_type(),
            reply_to: self.names.reply_address(MessageKind::Request, Some(name)),
            issued_at: now(),
        });

        debug!(name, %correlation_id, ?timeout, "Sending request");

        match self.exchange(&message, timeout, cancel).await? {
            None => {
                metrics::record_request_timeout();
                Err(BusError::RequestResponseTimeout {
                    message: Box::new(message),
                    timeout,
                })
            }
            Some(ProtocolMessage::Response(mut response)) => {
                response.completed_at = Some(now());
                decode_response(&response)
            }
            Some(ProtocolMessage::ResponseError(response)) => {
                Err(BusError::RequestHandlerFailed {
                    request: Box::new(response.request),
                    error: response.error,
                })
            }
            Some(other) => Err(unexpected_reply(MessageKind::Response, &other)),
        }
    }

    /// Deliver a response to the requester.
    ///
    /// When the requester runs on this host the response goes straight to its
    /// reply queue; if that fails, or the requester is remote, it goes
    /// through the broker.
    pub async fn send_response(
        &self,
        reply_to: &str,
        request: &RequestMessage,
        payload: ResponsePayload,
    ) -> BusResult<()> {
        let message = ProtocolMessage::Response(ResponseMessage {
            requester: request.requester.clone(),
            responder: self.identity.clone(),
            correlation_id: request.correlation_id,
            reply_to: reply_to.to_string(),
            body: payload.body,
            message_type: payload.message_type,
            requested_at: request.issued_at,
            responded_at: now(),
            completed_at: None,
        });

        if request.requester.same_host(&self.identity) {
            match self.send_direct(reply_to, &message).await {
                Ok(()) => {
                    debug!(queue = reply_to, correlation_id = %request.correlation_id, "Response delivered directly");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        queue = reply_to,
                        correlation_id = %request.correlation_id,
                        error = %e,
                        "Direct response delivery failed, routing through broker"
                    );
                }
            }
        }

        self.send_to_broker(&message).await
    }

    pub async fn send_response_error(
        &self,
        reply_to: &str,
        request: &RequestMessage,
        error: RemoteError,
    ) -> BusResult<()> {
        let message = ProtocolMessage::ResponseError(ResponseErrorMessage {
            requester: request.requester.clone(),
            responder: self.identity.clone(),
            correlation_id: request.correlation_id,
            reply_to: reply_to.to_string(),
            request: request.clone(),
            error,
            requested_at: request.issued_at,
            responded_at: now(),
            completed_at: None,
        });
        self.send_to_broker(&message).await
    }

    /// Release the broker queue handle. A later call reopens it.
    pub async fn dispose(&self) {
        if self.broker_queue.lock().await.take().is_some() {
            debug!(queue = %self.config.broker_queue, "Broker queue released");
        }
    }

    // =========================================================================
    // TRANSPORT
    // =========================================================================

    /// Send one message to the broker queue, reconnecting and retrying once.
    async fn send_to_broker(&self, message: &ProtocolMessage) -> BusResult<()> {
        let bytes = encode(message)?;
        let kind = message.kind();

        let mut slot = self.broker_queue.lock().await;
        let queue = self.open_broker_queue(&mut slot).await?;

        if let Err(first) = queue.send(bytes.clone()).await {
            warn!(
                queue = %self.config.broker_queue,
                %kind,
                error = %first,
                "Send to broker failed, reconnecting and retrying once"
            );
            metrics::record_send_retry();

            queue
                .reconnect()
                .await
                .map_err(|e| self.unavailable(Some(e)))?;
            queue
                .send(bytes)
                .await
                .map_err(|e| self.unavailable(Some(e)))?;
        }

        metrics::record_message_sent(kind.as_str());
        Ok(())
    }

    async fn open_broker_queue(
        &self,
        slot: &mut Option<Arc<dyn Queue>>,
    ) -> BusResult<Arc<dyn Queue>> {
        if let Some(queue) = slot.as_ref() {
            return Ok(Arc::clone(queue));
        }

        let queue = self
            .queue_factory
            .create(&self.config.broker_queue, true, QueueMode::Durable, true)
            .await
            .map_err(|e| self.unavailable(Some(e)))?;
        *slot = Some(Arc::clone(&queue));
        Ok(queue)
    }

    /// Send on a caller-owned temporary queue, bypassing the broker.
    async fn send_direct(&self, address: &str, message: &ProtocolMessage) -> BusResult<()> {
        let bytes = encode(message)?;
        let queue = self
            .queue_factory
            .create(address, true, QueueMode::TemporarySlave, true)
            .await?;
        queue.send(bytes).await?;
        metrics::record_message_sent(message.kind().as_str());
        Ok(())
    }

    /// Send `message` and wait for one reply on its private reply queue.
    ///
    /// `Ok(None)` means the timeout elapsed.
    async fn exchange(
        &self,
        message: &ProtocolMessage,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BusResult<Option<ProtocolMessage>> {
        let reply_to = message.reply_to().ok_or_else(|| {
            BusError::InvalidArgument(format!("{} carries no reply address", message.kind()))
        })?;

        let reply_queue = self
            .queue_factory
            .create(reply_to, true, QueueMode::TemporaryMaster, false)
            .await?;

        self.send_to_broker(message).await?;

        let received = reply_queue.receive(timeout, cancel).await?;
        if received.is_none() && cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        received.map(|bytes| decode(&bytes)).transpose().map_err(Into::into)
    }

    fn unavailable(&self, source: Option<shared_bus::TransportError>) -> BusError {
        BusError::MessageBrokerUnavailable {
            queue: self.config.broker_queue.clone(),
            source,
        }
    }
}

/// Classify a `Response` against the expected payload type.
fn decode_response<Resp: BusMessage>(response: &ResponseMessage) -> BusResult<Resp> {
    let expected = Resp::message_type();

    match &response.message_type {
        None if response.body == NULL_BODY => {
            decode_body(NULL_BODY).map_err(|_| BusError::invalid_type(&expected, "null"))
        }
        Some(actual) if *actual == expected => Ok(decode_body(&response.body)?),
        Some(actual) => Err(BusError::invalid_type(&expected, actual)),
        None => Err(BusError::invalid_type(&expected, "untagged")),
    }
}

fn unexpected_reply(expected: MessageKind, actual: &ProtocolMessage) -> BusError {
    BusError::invalid_type(expected, actual.kind())
}
