//! # In-Memory Transport
//!
//! A process-local [`QueueFactory`]. Every handle bound to the same address
//! shares one FIFO buffer; competing receivers each get distinct messages.
//!
//! Suitable for tests and single-process wiring. It also carries fault
//! injection hooks so the client's retry policy can be exercised:
//! [`InMemoryQueueFactory::fail_next_sends`] and
//! [`InMemoryQueueFactory::reconnect_count`].

use crate::transport::{Queue, QueueFactory, QueueMode, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Storage behind one address.
#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

#[derive(Default)]
struct Registry {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    failing_sends: Mutex<HashMap<String, usize>>,
    reconnects: Mutex<HashMap<String, usize>>,
}

impl Registry {
    fn lookup(&self, address: &str) -> Option<Arc<QueueState>> {
        self.queues.lock().get(address).cloned()
    }

    fn ensure(&self, address: &str) -> Arc<QueueState> {
        self.queues
            .lock()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    fn remove(&self, address: &str) {
        if let Some(state) = self.queues.lock().remove(address) {
            state.notify.notify_waiters();
        }
    }

    /// Consume one injected failure for `address`, if any are pending.
    fn take_failure(&self, address: &str) -> bool {
        let mut failing = self.failing_sends.lock();
        match failing.get_mut(address) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Process-local queue factory.
#[derive(Clone, Default)]
pub struct InMemoryQueueFactory {
    registry: Arc<Registry>,
}

impl InMemoryQueueFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a queue exists at `address`.
    #[must_use]
    pub fn exists(&self, address: &str) -> bool {
        self.registry.lookup(address).is_some()
    }

    /// Number of messages waiting at `address`.
    #[must_use]
    pub fn depth(&self, address: &str) -> usize {
        self.registry
            .lookup(address)
            .map_or(0, |state| state.messages.lock().len())
    }

    /// Addresses of every live queue, sorted.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.registry.queues.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Delete the queue at `address`. Waiting receivers fail with
    /// [`TransportError::QueueNotFound`].
    pub fn delete(&self, address: &str) {
        debug!(queue = address, "Deleting in-memory queue");
        self.registry.remove(address);
    }

    /// Make the next `count` sends to `address` fail.
    pub fn fail_next_sends(&self, address: &str, count: usize) {
        self.registry
            .failing_sends
            .lock()
            .insert(address.to_string(), count);
    }

    /// How many times handles bound to `address` have reconnected.
    #[must_use]
    pub fn reconnect_count(&self, address: &str) -> usize {
        self.registry
            .reconnects
            .lock()
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl QueueFactory for InMemoryQueueFactory {
    async fn create(
        &self,
        address: &str,
        durable: bool,
        mode: QueueMode,
        transactional: bool,
    ) -> Result<Arc<dyn Queue>, TransportError> {
        if mode.creates() {
            self.registry.ensure(address);
        }
        trace!(queue = address, ?mode, durable, transactional, "Queue handle created");

        Ok(Arc::new(InMemoryQueue {
            address: address.to_string(),
            owner: mode == QueueMode::TemporaryMaster,
            registry: Arc::clone(&self.registry),
        }))
    }
}

/// A handle bound to one address of an [`InMemoryQueueFactory`].
///
/// Handles resolve their address on every operation, so a queue created
/// after the handle is still reachable through it.
pub struct InMemoryQueue {
    address: String,
    owner: bool,
    registry: Arc<Registry>,
}

impl InMemoryQueue {
    fn state(&self) -> Result<Arc<QueueState>, TransportError> {
        self.registry
            .lookup(&self.address)
            .ok_or_else(|| TransportError::QueueNotFound(self.address.clone()))
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.registry.take_failure(&self.address) {
            return Err(TransportError::SendFailed {
                address: self.address.clone(),
                reason: "injected failure".into(),
            });
        }

        let state = self.state()?;
        state.messages.lock().push_back(message);
        state.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            let state = self.state()?;
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = state.messages.lock().pop_front();
            if let Some(message) = next {
                return Ok(Some(message));
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    async fn exists(&self) -> bool {
        self.registry.lookup(&self.address).is_some()
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        *self
            .registry
            .reconnects
            .lock()
            .entry(self.address.clone())
            .or_insert(0) += 1;
        debug!(queue = %self.address, "Reconnected");
        Ok(())
    }
}

impl Drop for InMemoryQueue {
    fn drop(&mut self) {
        if self.owner {
            self.registry.remove(&self.address);
        }
    }
}
