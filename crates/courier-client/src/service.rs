//! # Message Bus Service
//!
//! The orchestrator that hosts call into. It owns the broker adapter and
//! every registered handler, and runs the handshake supervisor.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──start──→ Running ──stop / cancel / fatal handshake──→ Stopped
//!                       ↑                                           │
//!                       └──────────────────start────────────────────┘
//! ```
//!
//! `start` checks the broker is reachable, registers the service, starts
//! every handler and sends the first handshake. While running, the
//! supervisor resends the full handler set on every tick; more than
//! `handshake_failure_threshold` consecutive failures stop the bus, and the
//! triggering error is handed to whoever is blocked in [`MessageBus::wait`].

use crate::adapters::MessageBroker;
use crate::builder::MessageBusBuilder;
use crate::domain::config::{BusConfig, BusProfile, PublishConfig, RequestConfig, SubscribeOptions};
use crate::domain::lifecycle::{BusState, HandshakeFailures};
use crate::error::{BusError, BusResult};
use crate::handlers::{RequestHandler, SubscribeHandler};
use crate::ports::outbound::{HostIdentity, QueueFactory};
use courier_telemetry::metrics;
use parking_lot::Mutex;
use shared_types::{
    BusMessage, CorrelationId, PublishReplyMessage, RequestHandlerInfo, ServiceIdentity,
    SubscribeHandlerInfo,
};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-run resources, present only between `start` and `stop`.
#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    /// Bumped by every `start`, so a start can tell whether it was stopped.
    run: u64,
    supervisor: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
}

struct BusInner {
    broker: Arc<MessageBroker>,
    subscriptions: Mutex<Vec<Arc<SubscribeHandler>>>,
    request_handlers: Mutex<Vec<Arc<RequestHandler>>>,
    state: watch::Sender<BusState>,
    lifecycle: Mutex<Lifecycle>,
    failures: Mutex<HandshakeFailures>,
    /// Consecutive failure count and triggering error of a fatal handshake.
    fatal: Mutex<Option<(u32, Arc<BusError>)>>,
}

/// A service's connection to the message bus.
///
/// Cheap to clone; clones share one bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder::new()
    }

    pub(crate) fn new(
        config: BusConfig,
        service_name: &str,
        host: &dyn HostIdentity,
        queue_factory: Arc<dyn QueueFactory>,
    ) -> Self {
        let threshold = config.handshake_failure_threshold;
        let broker = MessageBroker::new(Arc::new(config), service_name, host, queue_factory);
        let (state, _) = watch::channel(BusState::Created);

        Self {
            inner: Arc::new(BusInner {
                broker: Arc::new(broker),
                subscriptions: Mutex::new(Vec::new()),
                request_handlers: Mutex::new(Vec::new()),
                state,
                lifecycle: Mutex::new(Lifecycle::default()),
                failures: Mutex::new(HandshakeFailures::new(threshold)),
                fatal: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> BusState {
        *self.inner.state.borrow()
    }

    /// Normalised service name used in every queue address.
    pub fn service_name(&self) -> &str {
        self.inner.broker.names().service_name()
    }

    pub fn identity(&self) -> &ServiceIdentity {
        self.inner.broker.identity()
    }

    pub fn config(&self) -> &BusConfig {
        self.inner.broker.config()
    }

    /// Descriptors of every registered subscription.
    pub fn subscriptions(&self) -> Vec<SubscribeHandlerInfo> {
        self.inner.subscribe_infos()
    }

    /// Descriptors of every registered request handler.
    pub fn request_handlers(&self) -> Vec<RequestHandlerInfo> {
        self.inner.request_infos()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Connect to the broker and start every handler.
    ///
    /// Cancelling `cancel` stops the bus. On error the bus is left stopped.
    pub async fn start(&self, cancel: &CancellationToken) -> BusResult<()> {
        let token = cancel.child_token();
        let run = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.cancel.is_some() {
                return Err(BusError::InvalidState("bus already started".into()));
            }
            lifecycle.cancel = Some(token.clone());
            lifecycle.runtime = Handle::try_current().ok();
            lifecycle.run += 1;
            lifecycle.run
        };
        *self.inner.fatal.lock() = None;
        self.inner.failures.lock().record_success();

        info!(service = %self.identity(), "Starting message bus");

        if let Err(e) = self.inner.start_up(&token).await {
            warn!(service = %self.identity(), error = %e, "Message bus failed to start");
            self.inner.shutdown(false, false).await;
            return Err(e);
        }

        {
            // A concurrent `stop` may already have taken this run's token.
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.run != run || lifecycle.cancel.is_none() {
                info!(service = %self.identity(), "Message bus stopped while starting");
                return Err(BusError::Cancelled);
            }
            self.inner.state.send_replace(BusState::Running);
            lifecycle.supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.inner), token)));
        }

        info!(
            service = %self.identity(),
            subscriptions = self.inner.subscriptions.lock().len(),
            request_handlers = self.inner.request_handlers.lock().len(),
            "Message bus running"
        );
        Ok(())
    }

    /// Deregister from the broker and stop every handler. Idempotent.
    pub async fn stop(&self) {
        self.inner.shutdown(true, false).await;
    }

    /// Resolve once the bus is no longer running.
    ///
    /// Returns [`BusError::HandshakeFailed`] if the bus stopped itself.
    pub async fn wait(&self) -> BusResult<()> {
        let mut state = self.inner.state.subscribe();
        // The sender lives in `inner`, so the channel cannot close here.
        let _ = state.wait_for(|s| *s != BusState::Running).await;

        match self.inner.fatal.lock().clone() {
            Some((failures, trigger)) => Err(BusError::HandshakeFailed { failures, trigger }),
            None => Ok(()),
        }
    }

    /// The error that made the bus stop itself, if any.
    pub fn fatal_error(&self) -> Option<Arc<BusError>> {
        self.inner
            .fatal
            .lock()
            .as_ref()
            .map(|(_, trigger)| Arc::clone(trigger))
    }

    /// Run one supervisor tick now: reachability check plus full handshake.
    ///
    /// Counts towards the failure threshold like a timer tick.
    pub async fn handshake_now(&self) -> BusResult<()> {
        let token = self.inner.running_token()?;
        let outcome = self.inner.heartbeat(&token).await;
        let fatal = self.inner.fatal.lock().is_some();
        if fatal {
            self.inner.shutdown(false, false).await;
        }
        outcome
    }

    /// Stop the bus and release every handler and the broker queue.
    pub async fn dispose(self) {
        self.inner.shutdown(true, false).await;

        let subscriptions: Vec<_> = self.inner.subscriptions.lock().drain(..).collect();
        for handler in subscriptions {
            handler.dispose().await;
        }
        let request_handlers: Vec<_> = self.inner.request_handlers.lock().drain(..).collect();
        for handler in request_handlers {
            handler.dispose().await;
        }

        self.inner.broker.dispose().await;
        debug!(service = %self.identity(), "Message bus disposed");
    }

    // =========================================================================
    // PUBLISH / REQUEST
    // =========================================================================

    /// Publish `payload` on the configured topic.
    pub async fn publish<T: BusMessage>(
        &self,
        config: &PublishConfig,
        payload: &T,
    ) -> BusResult<PublishReplyMessage> {
        if config.topic.trim().is_empty() {
            return Err(BusError::InvalidArgument("publish topic is required".into()));
        }
        let token = self.inner.running_token()?;

        self.inner
            .broker
            .publish(&config.topic, payload, config.persistent, &token)
            .await
    }

    /// Send a request and wait for its response.
    pub async fn request<Req, Resp>(&self, config: &RequestConfig, request: &Req) -> BusResult<Resp>
    where
        Req: BusMessage,
        Resp: BusMessage,
    {
        self.request_cancellable(config, request, &CancellationToken::new())
            .await
    }

    /// As [`request`](Self::request), abandoned early when `cancel` fires.
    pub async fn request_cancellable<Req, Resp>(
        &self,
        config: &RequestConfig,
        request: &Req,
        cancel: &CancellationToken,
    ) -> BusResult<Resp>
    where
        Req: BusMessage,
        Resp: BusMessage,
    {
        if config.name.trim().is_empty() {
            return Err(BusError::InvalidArgument("request name is required".into()));
        }
        if config.timeout.is_zero() {
            return Err(BusError::InvalidArgument(
                "request timeout must be positive".into(),
            ));
        }
        let token = self.inner.running_token()?.child_token();

        tokio::select! {
            result = self.inner.broker.request_response(&config.name, request, config.timeout, &token) => result,
            _ = cancel.cancelled() => {
                token.cancel();
                Err(BusError::Cancelled)
            }
        }
    }

    /// Blocking form of [`request`](Self::request).
    ///
    /// Drives the request on the runtime the bus was started on, from a
    /// helper thread outside any runtime context. Callable from a runtime
    /// thread as long as another worker is free to run the bus tasks.
    pub fn request_blocking<Req, Resp>(&self, config: &RequestConfig, request: &Req) -> BusResult<Resp>
    where
        Req: BusMessage,
        Resp: BusMessage,
    {
        let runtime = self
            .inner
            .lifecycle
            .lock()
            .runtime
            .clone()
            .ok_or_else(|| BusError::InvalidState("bus was not started on a runtime".into()))?;

        std::thread::scope(|scope| {
            scope
                .spawn(|| runtime.block_on(self.request(config, request)))
                .join()
                .unwrap_or_else(|_| {
                    Err(BusError::InvalidState("blocking request thread panicked".into()))
                })
        })
    }

    // =========================================================================
    // HANDLER REGISTRATION
    // =========================================================================

    /// Register a subscription on `topic`.
    ///
    /// Without an explicit name the subscription gets a unique generated name
    /// and is non-durable; an explicit name makes it durable unless
    /// `options.durable` says otherwise.
    pub fn subscribe_handler<T, F, Fut>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> BusResult<()>
    where
        T: BusMessage,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_subscription(topic, options, |h| h.set(handler))
    }

    /// Register a subscription whose callback also receives a cancellation token.
    pub fn subscribe_handler_cancellable<T, F, Fut>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> BusResult<()>
    where
        T: BusMessage,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_subscription(topic, options, |h| h.set_cancellable(handler))
    }

    /// Chaining form of [`subscribe_handler`](Self::subscribe_handler).
    pub fn add_subscribe_handler<T, F, Fut>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> BusResult<&Self>
    where
        T: BusMessage,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_handler(topic, options, handler).map(|()| self)
    }

    /// Register the handler for requests named `name`.
    pub fn request_handler<Req, Resp, F, Fut>(
        &self,
        name: &str,
        multi_threaded: bool,
        handler: F,
    ) -> BusResult<()>
    where
        Req: BusMessage,
        Resp: BusMessage,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.register_request(name, multi_threaded, |h| h.set(handler))
    }

    pub fn request_handler_cancellable<Req, Resp, F, Fut>(
        &self,
        name: &str,
        multi_threaded: bool,
        handler: F,
    ) -> BusResult<()>
    where
        Req: BusMessage,
        Resp: BusMessage,
        F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.register_request(name, multi_threaded, |h| h.set_cancellable(handler))
    }

    /// Chaining form of [`request_handler`](Self::request_handler).
    pub fn add_request_handler<Req, Resp, F, Fut>(
        &self,
        name: &str,
        multi_threaded: bool,
        handler: F,
    ) -> BusResult<&Self>
    where
        Req: BusMessage,
        Resp: BusMessage,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.request_handler(name, multi_threaded, handler).map(|()| self)
    }

    fn register_subscription(
        &self,
        topic: &str,
        options: SubscribeOptions,
        bind: impl FnOnce(&SubscribeHandler) -> BusResult<()>,
    ) -> BusResult<()> {
        if topic.trim().is_empty() {
            return Err(BusError::InvalidArgument("subscription topic is required".into()));
        }
        if matches!(&options.name, Some(name) if name.trim().is_empty()) {
            return Err(BusError::InvalidArgument("subscription name cannot be empty".into()));
        }
        // Held until the push so `start` cannot snapshot the handlers in between.
        let lifecycle = self.inner.lifecycle.lock();
        ensure_not_running(&lifecycle)?;

        let durable = options.durable.unwrap_or(options.name.is_some());
        let name = options
            .name
            .unwrap_or_else(|| CorrelationId::new().simple());

        let mut subscriptions = self.inner.subscriptions.lock();
        if subscriptions
            .iter()
            .any(|h| h.name() == name && h.topic() == topic)
        {
            return Err(BusError::DoubleRegistration {
                name,
                topic: Some(topic.to_string()),
            });
        }

        let handler = SubscribeHandler::new(
            Arc::clone(&self.inner.broker),
            name,
            topic,
            durable,
            options.multi_threaded,
        )?;
        bind(&handler)?;

        debug!(name = handler.name(), topic, durable, "Subscription registered");
        subscriptions.push(Arc::new(handler));
        drop(lifecycle);
        Ok(())
    }

    fn register_request(
        &self,
        name: &str,
        multi_threaded: bool,
        bind: impl FnOnce(&RequestHandler) -> BusResult<()>,
    ) -> BusResult<()> {
        if name.trim().is_empty() {
            return Err(BusError::InvalidArgument("request name is required".into()));
        }
        let lifecycle = self.inner.lifecycle.lock();
        ensure_not_running(&lifecycle)?;

        let mut handlers = self.inner.request_handlers.lock();
        if handlers.iter().any(|h| h.name() == name) {
            return Err(BusError::DoubleRegistration {
                name: name.to_string(),
                topic: None,
            });
        }

        let handler = RequestHandler::new(Arc::clone(&self.inner.broker), name, multi_threaded)?;
        bind(&handler)?;

        debug!(name, "Request handler registered");
        handlers.push(Arc::new(handler));
        drop(lifecycle);
        Ok(())
    }
}

fn ensure_not_running(lifecycle: &Lifecycle) -> BusResult<()> {
    if lifecycle.cancel.is_some() {
        return Err(BusError::InvalidState(
            "handlers cannot be registered while the bus is running".into(),
        ));
    }
    Ok(())
}

impl BusInner {
    fn subscribe_infos(&self) -> Vec<SubscribeHandlerInfo> {
        self.subscriptions.lock().iter().map(|h| h.info()).collect()
    }

    fn request_infos(&self) -> Vec<RequestHandlerInfo> {
        self.request_handlers.lock().iter().map(|h| h.info()).collect()
    }

    fn running_token(&self) -> BusResult<CancellationToken> {
        let state = *self.state.borrow();
        let token = self.lifecycle.lock().cancel.clone();
        match (state, token) {
            (BusState::Running, Some(token)) => Ok(token),
            (state, _) => Err(BusError::InvalidState(format!("bus is {state}"))),
        }
    }

    async fn start_up(&self, cancel: &CancellationToken) -> BusResult<()> {
        self.broker.check_reachable().await?;
        self.broker.register_service(cancel).await?;

        let subscriptions: Vec<_> = self.subscriptions.lock().clone();
        for handler in subscriptions {
            handler.start(cancel).await?;
        }
        let request_handlers: Vec<_> = self.request_handlers.lock().clone();
        for handler in request_handlers {
            handler.start(cancel).await?;
        }

        self.broker
            .send_handshake(self.subscribe_infos(), self.request_infos(), cancel)
            .await?;
        Ok(())
    }

    /// One supervisor tick. Updates the failure counter and, past the
    /// threshold, records the fatal error.
    async fn heartbeat(&self, cancel: &CancellationToken) -> BusResult<()> {
        let result = match self.broker.check_reachable().await {
            Ok(()) => self
                .broker
                .send_handshake(self.subscribe_infos(), self.request_infos(), cancel)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };

        let e = match result {
            Ok(()) => {
                self.failures.lock().record_success();
                return Ok(());
            }
            Err(e) if cancel.is_cancelled() => return Err(e),
            Err(e) => e,
        };

        metrics::record_handshake_failure();
        let (exceeded, failures) = {
            let mut counter = self.failures.lock();
            (counter.record_failure(), counter.consecutive())
        };

        if !exceeded {
            warn!(service = %self.broker.identity(), failures, error = %e, "Handshake failed");
            return Err(e);
        }

        error!(
            service = %self.broker.identity(),
            failures,
            error = %e,
            "Handshake failure threshold exceeded, stopping message bus"
        );
        let trigger = Arc::new(e);
        *self.fatal.lock() = Some((failures, Arc::clone(&trigger)));
        Err(BusError::HandshakeFailed { failures, trigger })
    }

    /// Stop once; later calls return immediately.
    async fn shutdown(&self, goodbye: bool, from_supervisor: bool) {
        let (token, supervisor) = {
            let mut lifecycle = self.lifecycle.lock();
            let Some(token) = lifecycle.cancel.take() else {
                return;
            };
            (token, lifecycle.supervisor.take())
        };

        info!(service = %self.broker.identity(), "Stopping message bus");

        let announced = *self.state.borrow() == BusState::Running;
        if goodbye && announced {
            let farewell = CancellationToken::new();
            if let Err(e) = self.broker.send_handshake(Vec::new(), Vec::new(), &farewell).await {
                warn!(service = %self.broker.identity(), error = %e, "Deregistration handshake failed");
            }
        }

        token.cancel();

        let subscriptions: Vec<_> = self.subscriptions.lock().clone();
        for handler in subscriptions {
            handler.stop().await;
        }
        let request_handlers: Vec<_> = self.request_handlers.lock().clone();
        for handler in request_handlers {
            handler.stop().await;
        }

        self.state.send_replace(BusState::Stopped);

        if !from_supervisor {
            if let Some(supervisor) = supervisor {
                if let Err(e) = supervisor.await {
                    warn!(error = %e, "Handshake supervisor ended abnormally");
                }
            }
        }
        info!(service = %self.broker.identity(), "Message bus stopped");
    }
}

/// Handshake timer. Stops the bus on cancellation or a fatal tick.
async fn supervise(inner: Arc<BusInner>, cancel: CancellationToken) {
    let config = inner.broker.config();
    let periodic = config.profile == BusProfile::Production;
    let period = config.handshake_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                inner.shutdown(true, true).await;
                return;
            }
            _ = ticker.tick(), if periodic => {
                let failed = inner.heartbeat(&cancel).await.is_err();
                let fatal = inner.fatal.lock().is_some();
                if failed && fatal {
                    inner.shutdown(false, true).await;
                    return;
                }
            }
        }
    }
}
