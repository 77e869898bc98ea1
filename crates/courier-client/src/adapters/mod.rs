//! # Adapters Layer (Hexagonal Architecture)
//!
//! Speaks the broker protocol over the outbound [`QueueFactory`](crate::ports::outbound::QueueFactory) port.

mod broker;

pub use broker::MessageBroker;
