//! # courier-testkit
//!
//! A simulated broker for exercising courier services in-process.
//!
//! [`TestBroker`] listens on the broker queue of an [`InMemoryQueueFactory`]
//! and plays the broker's side of the protocol:
//!
//! | Inbound | Broker behaviour |
//! |---------|------------------|
//! | `ServiceRegister` | record, reply |
//! | `Handshake` | replace the sender's routes, reply |
//! | `SubscribeRegister` / `RequestRegister` | add one route, reply |
//! | `Publish` | copy to every subscription queue on the topic; reply if persistent |
//! | `Request` | answer from a mock, else forward to the named request queue, else `ResponseError` |
//! | `Response` / `ResponseError` | forward to the carried reply address |
//! | `SubscribeComplete` / `SubscribeError` | record |
//!
//! Everything received is recorded in [`Records`].

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use courier_client::DEFAULT_BROKER_QUEUE;
use parking_lot::Mutex;
use shared_bus::{InMemoryQueueFactory, Queue, QueueFactory, QueueMode, TransportError};
use shared_types::{
    decode, decode_body, encode, encode_body, now, BusMessage, CodecError, HandshakeMessage,
    HandshakeReplyMessage, MessageType, ProtocolMessage, PublishMessage, PublishReplyMessage,
    RemoteError, RequestHandlerInfo, RequestMessage, RequestRegisterReplyMessage,
    ResponseErrorMessage, ResponseMessage, ServiceIdentity, ServiceRegisterMessage,
    ServiceRegisterReplyMessage, SubscribeCompleteMessage, SubscribeErrorMessage,
    SubscribeHandlerInfo, SubscribeRegisterReplyMessage, NULL_BODY,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors raised by the test broker.
#[derive(Debug, Error)]
pub enum TestBrokerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// `wait_for` gave up
    #[error("condition not met within {0:?}")]
    Timeout(Duration),
}

/// Everything the broker has received, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Records {
    pub service_registers: Vec<ServiceRegisterMessage>,
    pub handshakes: Vec<HandshakeMessage>,
    pub subscribe_registers: Vec<SubscribeHandlerInfo>,
    pub request_registers: Vec<RequestHandlerInfo>,
    pub published: Vec<PublishMessage>,
    pub subscribe_completed: Vec<SubscribeCompleteMessage>,
    pub subscribe_failed: Vec<SubscribeErrorMessage>,
    pub requests: Vec<RequestMessage>,
    pub responses: Vec<ResponseMessage>,
    pub response_errors: Vec<ResponseErrorMessage>,
}

/// Handlers one service instance has announced.
#[derive(Debug, Default)]
struct Routes {
    subscriptions: Vec<SubscribeHandlerInfo>,
    requests: Vec<RequestHandlerInfo>,
}

type Predicate = Box<dyn Fn(&RequestMessage) -> bool + Send + Sync>;

struct Mock {
    name: String,
    matches: Predicate,
    body: String,
    message_type: Option<MessageType>,
}

struct BrokerState {
    records: Mutex<Records>,
    routes: Mutex<HashMap<ServiceIdentity, Routes>>,
    mocks: Mutex<Vec<Mock>>,
    auto_reply: AtomicBool,
    identity: ServiceIdentity,
}

/// An in-process broker bound to one in-memory queue address.
pub struct TestBroker {
    factory: InMemoryQueueFactory,
    address: String,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TestBroker {
    /// Listen on [`DEFAULT_BROKER_QUEUE`].
    pub async fn start(factory: InMemoryQueueFactory) -> Result<Self, TestBrokerError> {
        Self::start_at(factory, DEFAULT_BROKER_QUEUE).await
    }

    /// Listen on `address`.
    pub async fn start_at(
        factory: InMemoryQueueFactory,
        address: &str,
    ) -> Result<Self, TestBrokerError> {
        let queue = factory
            .create(address, true, QueueMode::DurableCreate, true)
            .await?;

        let state = Arc::new(BrokerState {
            records: Mutex::new(Records::default()),
            routes: Mutex::new(HashMap::new()),
            mocks: Mutex::new(Vec::new()),
            auto_reply: AtomicBool::new(true),
            identity: ServiceIdentity::new("broker", "courier-broker"),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            queue,
            factory.clone(),
            Arc::clone(&state),
            cancel.clone(),
        ));

        debug!(queue = address, "Test broker listening");
        Ok(Self {
            factory,
            address: address.to_string(),
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn factory(&self) -> &InMemoryQueueFactory {
        &self.factory
    }

    /// Snapshot of everything received so far.
    pub fn records(&self) -> Records {
        self.state.records.lock().clone()
    }

    /// Stop answering calls. Forwarding of responses continues.
    pub fn set_auto_reply(&self, enabled: bool) {
        self.state.auto_reply.store(enabled, Ordering::SeqCst);
    }

    /// Answer requests named `name` whose payload satisfies `predicate`
    /// with `response`, without involving any request handler.
    ///
    /// Mocks are tried in registration order.
    pub fn mock_response<Req, Resp>(
        &self,
        name: &str,
        predicate: impl Fn(&Req) -> bool + Send + Sync + 'static,
        response: Resp,
    ) -> Result<(), TestBrokerError>
    where
        Req: BusMessage,
        Resp: BusMessage,
    {
        let body = encode_body(&response)?;
        let message_type = (body != NULL_BODY).then(Resp::message_type);
        let matches: Predicate = Box::new(move |request: &RequestMessage| {
            request.message_type == Req::message_type()
                && decode_body::<Req>(&request.body).is_ok_and(|value| predicate(&value))
        });

        self.state.mocks.lock().push(Mock {
            name: name.to_string(),
            matches,
            body,
            message_type,
        });
        Ok(())
    }

    /// Poll the records until `predicate` holds.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&Records) -> bool,
        timeout: Duration,
    ) -> Result<Records, TestBrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.records();
            if predicate(&records) {
                return Ok(records);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TestBrokerError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop listening and delete the broker queue, making the broker
    /// unreachable.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Test broker loop ended abnormally");
            }
        }
        self.factory.delete(&self.address);
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    queue: Arc<dyn Queue>,
    factory: InMemoryQueueFactory,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let bytes = match queue.receive(Duration::from_millis(50), &cancel).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "Test broker queue gone");
                return;
            }
        };

        match decode(&bytes) {
            Ok(message) => {
                for (address, reply) in state.handle(message) {
                    deliver(&factory, &address, &reply).await;
                }
            }
            Err(e) => warn!(error = %e, "Test broker dropped undecodable message"),
        }
    }
}

async fn deliver(factory: &InMemoryQueueFactory, address: &str, message: &ProtocolMessage) {
    let bytes = match encode(message) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Test broker could not encode message");
            return;
        }
    };

    let sent = match factory
        .create(address, true, QueueMode::TemporarySlave, false)
        .await
    {
        Ok(queue) => queue.send(bytes).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        debug!(queue = address, kind = %message.kind(), error = %e, "Test broker delivery failed");
    }
}

impl BrokerState {
    fn auto_reply(&self) -> bool {
        self.auto_reply.load(Ordering::SeqCst)
    }

    /// Record one message and return what to send where.
    fn handle(&self, message: ProtocolMessage) -> Vec<(String, ProtocolMessage)> {
        let mut out = Vec::new();
        let reply_to = message.reply_to().map(str::to_string);

        let reply = match message {
            ProtocolMessage::ServiceRegister(m) => {
                let service_name = m.origin.service_name.clone();
                self.records.lock().service_registers.push(m);
                Some(ProtocolMessage::ServiceRegisterReply(ServiceRegisterReplyMessage {
                    service_name,
                    issued_at: now(),
                    completed_at: None,
                }))
            }
            ProtocolMessage::Handshake(m) => {
                self.routes.lock().insert(
                    m.origin.clone(),
                    Routes {
                        subscriptions: m.subscribe_handlers.clone(),
                        requests: m.request_handlers.clone(),
                    },
                );
                self.records.lock().handshakes.push(m);
                Some(ProtocolMessage::HandshakeReply(HandshakeReplyMessage {
                    issued_at: now(),
                    completed_at: None,
                }))
            }
            ProtocolMessage::SubscribeRegister(m) => {
                {
                    let mut routes = self.routes.lock();
                    let entry = routes.entry(m.origin.clone()).or_default();
                    entry.subscriptions.retain(|h| h.queue_name != m.handler.queue_name);
                    entry.subscriptions.push(m.handler.clone());
                }
                self.records.lock().subscribe_registers.push(m.handler.clone());
                Some(ProtocolMessage::SubscribeRegisterReply(SubscribeRegisterReplyMessage {
                    name: m.handler.name,
                    topic: m.handler.topic,
                    issued_at: now(),
                    completed_at: None,
                }))
            }
            ProtocolMessage::RequestRegister(m) => {
                {
                    let mut routes = self.routes.lock();
                    let entry = routes.entry(m.origin.clone()).or_default();
                    entry.requests.retain(|h| h.name != m.handler.name);
                    entry.requests.push(m.handler.clone());
                }
                self.records.lock().request_registers.push(m.handler.clone());
                Some(ProtocolMessage::RequestRegisterReply(RequestRegisterReplyMessage {
                    name: m.handler.name,
                    issued_at: now(),
                    completed_at: None,
                }))
            }
            ProtocolMessage::Publish(m) => {
                let encoded = ProtocolMessage::Publish(m.clone());
                for queue in self.subscription_queues(&m.topic) {
                    out.push((queue, encoded.clone()));
                }
                let reply = m.reply_to.is_some().then(|| {
                    ProtocolMessage::PublishReply(PublishReplyMessage {
                        correlation_id: m.correlation_id,
                        topic: m.topic.clone(),
                        issued_at: now(),
                        completed_at: None,
                    })
                });
                self.records.lock().published.push(m);
                reply
            }
            ProtocolMessage::Request(m) => {
                self.records.lock().requests.push(m.clone());
                if let Some(answer) = self.mocked(&m) {
                    Some(answer)
                } else if let Some(queue) = self.request_queue(&m.name) {
                    out.push((queue, ProtocolMessage::Request(m)));
                    None
                } else {
                    Some(self.no_handler(m))
                }
            }
            ProtocolMessage::Response(m) => {
                out.push((m.reply_to.clone(), ProtocolMessage::Response(m.clone())));
                self.records.lock().responses.push(m);
                None
            }
            ProtocolMessage::ResponseError(m) => {
                out.push((m.reply_to.clone(), ProtocolMessage::ResponseError(m.clone())));
                self.records.lock().response_errors.push(m);
                None
            }
            ProtocolMessage::SubscribeComplete(m) => {
                self.records.lock().subscribe_completed.push(m);
                None
            }
            ProtocolMessage::SubscribeError(m) => {
                self.records.lock().subscribe_failed.push(m);
                None
            }
            other => {
                warn!(kind = %other.kind(), "Test broker ignoring reply-kind message");
                None
            }
        };

        if let (Some(reply), Some(address)) = (reply, reply_to) {
            if self.auto_reply() {
                out.push((address, reply));
            }
        }
        out
    }

    /// Distinct queues subscribed to `topic`.
    fn subscription_queues(&self, topic: &str) -> Vec<String> {
        let mut queues: Vec<String> = self
            .routes
            .lock()
            .values()
            .flat_map(|r| r.subscriptions.iter())
            .filter(|h| h.topic == topic)
            .map(|h| h.queue_name.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    fn request_queue(&self, name: &str) -> Option<String> {
        self.routes
            .lock()
            .values()
            .flat_map(|r| r.requests.iter())
            .find(|h| h.name == name)
            .map(|h| h.queue_name.clone())
    }

    fn mocked(&self, request: &RequestMessage) -> Option<ProtocolMessage> {
        let mocks = self.mocks.lock();
        let mock = mocks
            .iter()
            .find(|mock| mock.name == request.name && (mock.matches)(request))?;

        Some(ProtocolMessage::Response(ResponseMessage {
            requester: request.requester.clone(),
            responder: self.identity.clone(),
            correlation_id: request.correlation_id,
            reply_to: request.reply_to.clone(),
            body: mock.body.clone(),
            message_type: mock.message_type.clone(),
            requested_at: request.issued_at,
            responded_at: now(),
            completed_at: None,
        }))
    }

    fn no_handler(&self, request: RequestMessage) -> ProtocolMessage {
        ProtocolMessage::ResponseError(ResponseErrorMessage {
            requester: request.requester.clone(),
            responder: self.identity.clone(),
            correlation_id: request.correlation_id,
            reply_to: request.reply_to.clone(),
            error: RemoteError::new(
                "no_handler",
                format!("no request handler registered for {}", request.name),
            ),
            requested_at: request.issued_at,
            responded_at: now(),
            completed_at: None,
            request,
        })
    }
}
