//! Driving Ports (API - Inbound)
//!
//! User code drives the bus by handing it callbacks. Callbacks are async
//! closures returning `anyhow::Result`; the bus erases their payload types
//! behind [`SubscribeCallback`] and [`RequestCallback`] so a handler can
//! hold any of them.
//!
//! Decoding the inbound body, invoking the closure and catching its panics
//! all happen inside the erased callback, so every way a callback can fail
//! comes back as a [`HandlerFailure`].

use futures::future::BoxFuture;
use futures::FutureExt;
use shared_types::{decode_body, encode_body, BusMessage, CodecError, MessageType, RemoteError, NULL_BODY};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Type-erased subscription callback: body in, outcome out.
pub type SubscribeCallback =
    Arc<dyn Fn(String, CancellationToken) -> BoxFuture<'static, Result<(), HandlerFailure>> + Send + Sync>;

/// Type-erased request callback: body in, encoded response out.
pub type RequestCallback = Arc<
    dyn Fn(String, CancellationToken) -> BoxFuture<'static, Result<ResponsePayload, HandlerFailure>>
        + Send
        + Sync,
>;

/// An encoded response ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePayload {
    pub body: String,
    /// `None` when the response encodes to `null`.
    pub message_type: Option<MessageType>,
}

impl ResponsePayload {
    /// Encode `value`, tagging it unless it is empty.
    pub fn encode<R: BusMessage>(value: &R) -> Result<Self, CodecError> {
        let body = encode_body(value)?;
        let message_type = (body != NULL_BODY).then(R::message_type);
        Ok(Self { body, message_type })
    }
}

/// Why a callback did not complete.
#[derive(Debug)]
pub enum HandlerFailure {
    /// The inbound body did not decode as the bound type.
    Decode(CodecError),
    /// The callback returned an error.
    Callback(anyhow::Error),
    /// The callback panicked.
    Panicked(String),
}

impl HandlerFailure {
    /// Flatten into a description that can cross the broker.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Decode(e) => RemoteError::from_error("deserialize", e),
            Self::Callback(e) => RemoteError {
                kind: "handler_error".into(),
                message: e.to_string(),
                chain: e.chain().skip(1).map(ToString::to_string).collect(),
            },
            Self::Panicked(message) => RemoteError::new("panic", message.clone()),
        }
    }
}

/// Erase a plain subscription closure.
pub fn subscribe_callback<T, F, Fut>(handler: F) -> SubscribeCallback
where
    T: BusMessage,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    cancellable_subscribe_callback(move |value: T, _cancel| handler(value))
}

/// Erase a cancellation-aware subscription closure.
pub fn cancellable_subscribe_callback<T, F, Fut>(handler: F) -> SubscribeCallback
where
    T: BusMessage,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |body: String, cancel: CancellationToken| {
        let handler = Arc::clone(&handler);
        async move {
            let value: T = decode_body(&body).map_err(HandlerFailure::Decode)?;
            invoke(move || handler(value, cancel)).await
        }
        .boxed()
    })
}

/// Erase a plain request closure.
pub fn request_callback<Req, Resp, F, Fut>(handler: F) -> RequestCallback
where
    Req: BusMessage,
    Resp: BusMessage,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    cancellable_request_callback(move |request: Req, _cancel| handler(request))
}

/// Erase a cancellation-aware request closure.
pub fn cancellable_request_callback<Req, Resp, F, Fut>(handler: F) -> RequestCallback
where
    Req: BusMessage,
    Resp: BusMessage,
    F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |body: String, cancel: CancellationToken| {
        let handler = Arc::clone(&handler);
        async move {
            let request: Req = decode_body(&body).map_err(HandlerFailure::Decode)?;
            let response = invoke(move || handler(request, cancel)).await?;
            ResponsePayload::encode(&response).map_err(HandlerFailure::Decode)
        }
        .boxed()
    })
}

/// Run a callback, turning errors and panics into [`HandlerFailure`].
async fn invoke<R, F, Fut>(call: F) -> Result<R, HandlerFailure>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let future = std::panic::catch_unwind(AssertUnwindSafe(call))
        .map_err(|payload| HandlerFailure::Panicked(panic_message(payload.as_ref())))?;

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result.map_err(HandlerFailure::Callback),
        Err(payload) => Err(HandlerFailure::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}
