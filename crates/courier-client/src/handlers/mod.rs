//! # Inbound Handlers
//!
//! A handler owns one queue and a consume loop that feeds its messages to a
//! user callback. The loop is shared by both handler kinds; what happens to a
//! message is up to the [`Processor`].
//!
//! ```text
//! queue ──receive(poll)──→ single-threaded: process inline
//!                          multi-threaded:  acquire permit → spawn process
//! ```

mod request;
mod subscribe;

pub use request::RequestHandler;
pub use subscribe::SubscribeHandler;

use crate::domain::config::{BusConfig, BusProfile};
use crate::ports::outbound::Queue;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handles one raw message taken off a handler queue.
#[async_trait]
pub(crate) trait Processor: Send + Sync + 'static {
    async fn process(&self, message: Bytes, cancel: CancellationToken);
}

/// How a consume loop polls and fans out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConsumeSettings {
    pub poll: Duration,
    /// Messages processed at once; 1 means inline.
    pub concurrency: usize,
}

impl ConsumeSettings {
    pub(crate) fn from_config(config: &BusConfig, multi_threaded: bool) -> Self {
        let concurrency = if multi_threaded && config.profile == BusProfile::Production {
            config.max_concurrent_handlers.max(1)
        } else {
            1
        };

        Self {
            poll: config.receive_poll,
            concurrency,
        }
    }
}

/// A running consume loop.
pub(crate) struct Consumer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Consumer {
    pub(crate) fn spawn(
        queue: Arc<dyn Queue>,
        processor: Arc<dyn Processor>,
        settings: ConsumeSettings,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let task = tokio::spawn(consume(queue, processor, settings, cancel.clone()));
        Self { cancel, task }
    }

    /// Cancel the loop and wait for in-flight messages to finish.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Consume loop ended abnormally");
        }
    }
}

async fn consume(
    queue: Arc<dyn Queue>,
    processor: Arc<dyn Processor>,
    settings: ConsumeSettings,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(settings.concurrency));
    let mut in_flight = JoinSet::new();

    debug!(queue = queue.address(), concurrency = settings.concurrency, "Consume loop started");

    while !cancel.is_cancelled() {
        match queue.receive(settings.poll, &cancel).await {
            Ok(Some(message)) if settings.concurrency == 1 => {
                processor.process(message, cancel.clone()).await;
            }
            Ok(Some(message)) => {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let processor = Arc::clone(&processor);
                let cancel = cancel.clone();
                in_flight.spawn(async move {
                    processor.process(message, cancel).await;
                    drop(permit);
                });
                while in_flight.try_join_next().is_some() {}
            }
            Ok(None) => {}
            Err(e) => {
                warn!(queue = queue.address(), error = %e, "Receive failed");
                tokio::select! {
                    _ = tokio::time::sleep(settings.poll) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    debug!(queue = queue.address(), "Consume loop stopped");
}
