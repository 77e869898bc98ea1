//! Explicit construction of a [`MessageBus`].

use crate::domain::config::{BusConfig, BusProfile};
use crate::error::{BusError, BusResult};
use crate::ports::outbound::{HostIdentity, QueueFactory, SystemHostIdentity};
use crate::service::MessageBus;
use std::sync::Arc;
use tracing::debug;

/// Builder for [`MessageBus`].
///
/// A queue factory is required; everything else has a default.
pub struct MessageBusBuilder {
    service_name: Option<String>,
    config: BusConfig,
    queue_factory: Option<Arc<dyn QueueFactory>>,
    host: Arc<dyn HostIdentity>,
}

impl Default for MessageBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBusBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            service_name: None,
            config: BusConfig::default(),
            queue_factory: None,
            host: Arc::new(SystemHostIdentity),
        }
    }

    /// Overrides `config.service_name`.
    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_queue_factory(mut self, queue_factory: Arc<dyn QueueFactory>) -> Self {
        self.queue_factory = Some(queue_factory);
        self
    }

    #[must_use]
    pub fn with_host_identity(mut self, host: Arc<dyn HostIdentity>) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: BusProfile) -> Self {
        self.config.profile = profile;
        self
    }

    /// Validate the configuration and create the bus.
    ///
    /// The service name is taken from the builder, then the configuration,
    /// then the host's process name.
    pub fn build(self) -> BusResult<MessageBus> {
        let queue_factory = self
            .queue_factory
            .ok_or_else(|| BusError::InvalidArgument("a queue factory is required".into()))?;
        self.config.validate()?;

        let service_name = self
            .service_name
            .or_else(|| self.config.service_name.clone())
            .unwrap_or_else(|| self.host.process_name());
        if service_name.trim().is_empty() {
            return Err(BusError::InvalidArgument("service name cannot be empty".into()));
        }

        debug!(service = %service_name, profile = ?self.config.profile, "Building message bus");
        Ok(MessageBus::new(
            self.config,
            &service_name,
            self.host.as_ref(),
            queue_factory,
        ))
    }
}
