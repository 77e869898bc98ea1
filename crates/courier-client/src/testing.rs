//! Unit-test support: a minimal auto-replying broker and message helpers.

use crate::adapters::MessageBroker;
use crate::domain::config::{BusConfig, TimeoutConfig};
use crate::ports::outbound::{Queue, QueueFactory, QueueMode, StaticHostIdentity};
use parking_lot::Mutex;
use shared_bus::InMemoryQueueFactory;
use shared_types::{
    decode, encode, encode_body, now, BusMessage, CorrelationId, HandshakeReplyMessage,
    MessageKind, ProtocolMessage, PublishMessage, PublishReplyMessage, RequestMessage,
    RequestRegisterReplyMessage, ServiceIdentity, ServiceRegisterReplyMessage,
    SubscribeRegisterReplyMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) const BROKER: &str = "test.broker";

pub(crate) type Seen = Arc<Mutex<Vec<ProtocolMessage>>>;

pub(crate) fn test_config() -> BusConfig {
    BusConfig {
        broker_queue: BROKER.to_string(),
        timeouts: TimeoutConfig {
            service_register: Duration::from_millis(300),
            handshake: Duration::from_millis(300),
            handler_register: Duration::from_millis(300),
            publish_reply: Duration::from_millis(300),
        },
        handshake_interval: Duration::from_millis(100),
        handshake_failure_threshold: 2,
        receive_poll: Duration::from_millis(20),
        ..BusConfig::default()
    }
}

pub(crate) fn broker(factory: &InMemoryQueueFactory) -> Arc<MessageBroker> {
    broker_on(factory, "host-a")
}

pub(crate) fn broker_on(factory: &InMemoryQueueFactory, machine: &str) -> Arc<MessageBroker> {
    Arc::new(MessageBroker::new(
        Arc::new(test_config()),
        "orders",
        &StaticHostIdentity::new(machine, "orders"),
        Arc::new(factory.clone()),
    ))
}

pub(crate) async fn broker_queue(factory: &InMemoryQueueFactory) -> Arc<dyn Queue> {
    factory
        .create(BROKER, true, QueueMode::DurableCreate, true)
        .await
        .expect("broker queue")
}

/// Aborts the broker loop when dropped.
pub(crate) struct ReplyLoop(JoinHandle<()>);

impl Drop for ReplyLoop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Start a broker that records everything and answers every call.
pub(crate) async fn reply_loop(factory: &InMemoryQueueFactory) -> (ReplyLoop, Seen) {
    let queue = broker_queue(factory).await;
    let seen: Seen = Arc::default();
    let factory = factory.clone();
    let record = Arc::clone(&seen);

    let handle = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        loop {
            let bytes = match queue.receive(Duration::from_millis(50), &cancel).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(_) => return,
            };
            let Ok(message) = decode(&bytes) else {
                continue;
            };
            record.lock().push(message.clone());

            if let Some((address, reply)) = answer(message) {
                if let Ok(target) = factory
                    .create(&address, true, QueueMode::TemporarySlave, false)
                    .await
                {
                    let _ = target.send(encode(&reply).expect("encode reply")).await;
                }
            }
        }
    });

    (ReplyLoop(handle), seen)
}

fn answer(message: ProtocolMessage) -> Option<(String, ProtocolMessage)> {
    let reply = match &message {
        ProtocolMessage::ServiceRegister(m) => {
            ProtocolMessage::ServiceRegisterReply(ServiceRegisterReplyMessage {
                service_name: m.origin.service_name.clone(),
                issued_at: now(),
                completed_at: None,
            })
        }
        ProtocolMessage::Handshake(_) => ProtocolMessage::HandshakeReply(HandshakeReplyMessage {
            issued_at: now(),
            completed_at: None,
        }),
        ProtocolMessage::SubscribeRegister(m) => {
            ProtocolMessage::SubscribeRegisterReply(SubscribeRegisterReplyMessage {
                name: m.handler.name.clone(),
                topic: m.handler.topic.clone(),
                issued_at: now(),
                completed_at: None,
            })
        }
        ProtocolMessage::RequestRegister(m) => {
            ProtocolMessage::RequestRegisterReply(RequestRegisterReplyMessage {
                name: m.handler.name.clone(),
                issued_at: now(),
                completed_at: None,
            })
        }
        ProtocolMessage::Publish(m) if m.reply_to.is_some() => {
            ProtocolMessage::PublishReply(PublishReplyMessage {
                correlation_id: m.correlation_id,
                topic: m.topic.clone(),
                issued_at: now(),
                completed_at: None,
            })
        }
        ProtocolMessage::Response(_) | ProtocolMessage::ResponseError(_) => message.clone(),
        _ => return None,
    };

    let address = message.reply_to()?.to_string();
    Some((address, reply))
}

/// Put a publish for `topic` straight onto a handler queue.
pub(crate) async fn publish_to<T: BusMessage>(
    factory: &InMemoryQueueFactory,
    queue: &str,
    topic: &str,
    payload: &T,
) {
    let message = ProtocolMessage::Publish(PublishMessage {
        origin: ServiceIdentity::new("host-p", "publisher"),
        correlation_id: CorrelationId::new(),
        topic: topic.to_string(),
        persistent: false,
        body: encode_body(payload).expect("encode body"),
        message_type: T::message_type(),
        reply_to: None,
        issued_at: now(),
        error_count: 0,
    });
    send(factory, queue, &message).await;
}

/// Put a request straight onto a handler queue and wait for whatever
/// arrives on its reply queue.
pub(crate) async fn request_to<T: BusMessage>(
    factory: &InMemoryQueueFactory,
    queue: &str,
    requester_host: &str,
    payload: &T,
) -> ProtocolMessage {
    let reply_to = format!("#client.Reply.{}", CorrelationId::new().simple());
    let reply_queue = factory
        .create(&reply_to, true, QueueMode::TemporaryMaster, false)
        .await
        .expect("reply queue");

    let message = ProtocolMessage::Request(RequestMessage {
        requester: ServiceIdentity::new(requester_host, "client"),
        correlation_id: CorrelationId::new(),
        name: "GetOrder".into(),
        body: encode_body(payload).expect("encode body"),
        message_type: T::message_type(),
        reply_to: reply_to.clone(),
        issued_at: now(),
    });
    send(factory, queue, &message).await;

    let bytes = reply_queue
        .receive(Duration::from_secs(2), &CancellationToken::new())
        .await
        .expect("receive")
        .expect("reply before timeout");
    decode(&bytes).expect("decode reply")
}

async fn send(factory: &InMemoryQueueFactory, queue: &str, message: &ProtocolMessage) {
    factory
        .create(queue, true, QueueMode::TemporarySlave, false)
        .await
        .expect("handle")
        .send(encode(message).expect("encode"))
        .await
        .expect("send");
}

/// Wait until the broker has seen a message of `kind` and return it.
pub(crate) async fn wait_for_kind(seen: &Seen, kind: MessageKind) -> ProtocolMessage {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(found) = seen.lock().iter().find(|m| m.kind() == kind).cloned() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("broker never saw {kind}"))
}
