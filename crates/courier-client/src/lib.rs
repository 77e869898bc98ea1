//! # courier-client
//!
//! Client library for services on a broker-routed message bus.
//!
//! ## Overview
//!
//! A service builds one [`MessageBus`], registers its handlers and starts it.
//! From then on the bus:
//! - **Registers** the service with the central broker
//! - **Announces** its full handler set in a periodic handshake
//! - **Publishes** to topics, optionally waiting for the broker's acknowledgement
//! - **Requests** from named handlers and waits for the correlated response
//! - **Consumes** its subscription and request queues, reporting every outcome
//!
//! ## Architecture
//!
//! ```text
//!   user code ──publish/request──→ MessageBus ──→ MessageBroker ──→ broker queue
//!                                      │                 ↑
//!                                      ├── SubscribeHandler ──┤  (own queue each)
//!                                      └── RequestHandler ────┘
//! ```
//!
//! Every call that expects a reply gets a private temporary reply queue, so
//! there is no shared table of pending calls. Same-host responses skip the
//! broker and go straight to the requester's reply queue.
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_client::{MessageBus, PublishConfig, RequestConfig, SubscribeOptions};
//!
//! let bus = MessageBus::builder()
//!     .with_service_name("orders")
//!     .with_queue_factory(factory)
//!     .build()?;
//!
//! bus.subscribe_handler("orders.placed", SubscribeOptions::named("audit"), |order: OrderPlaced| async move {
//!     audit_log.record(order).await?;
//!     Ok(())
//! })?;
//! bus.request_handler("GetOrder", false, |id: u64| async move { store.get(id).await })?;
//!
//! bus.start(&shutdown).await?;
//! bus.publish(&PublishConfig::new("orders.placed").persistent(true), &order).await?;
//! let order: Option<Order> = bus.request(&RequestConfig::new("GetOrder", Duration::from_secs(5)), &42u64).await?;
//! bus.wait().await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adapters;
pub mod builder;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod ports;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use adapters::MessageBroker;
pub use builder::MessageBusBuilder;
pub use domain::{
    BusConfig, BusProfile, BusState, ConfigError, HandlerState, PublishConfig, QueueNames,
    RequestConfig, SubscribeOptions, TimeoutConfig, DEFAULT_BROKER_QUEUE, MAX_QUEUE_NAME_LENGTH,
};
pub use error::{BusError, BusResult};
pub use handlers::{RequestHandler, SubscribeHandler};
pub use ports::{HostIdentity, StaticHostIdentity, SystemHostIdentity};
pub use service::MessageBus;

pub use shared_types::{bus_message, BusMessage, MessageType};
