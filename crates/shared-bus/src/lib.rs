//! # Shared Bus - Queue Transport Boundary
//!
//! Everything the bus client knows about moving bytes between processes.
//!
//! ## Layout
//!
//! ```text
//! ┌────────────────┐   create(address, mode)   ┌──────────────────┐
//! │  Bus client    │ ────────────────────────► │  QueueFactory    │
//! │                │                           └────────┬─────────┘
//! │                │   send / receive / exists          │
//! │                │ ◄────────────────────────► Arc<dyn Queue>
//! └────────────────┘
//! ```
//!
//! - [`transport`] defines the port: [`Queue`], [`QueueFactory`], [`QueueMode`].
//! - [`memory`] is a process-local implementation with fault injection.
//!
//! Production transports live outside this workspace and implement the same
//! two traits.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod memory;
pub mod transport;

pub use memory::{InMemoryQueue, InMemoryQueueFactory};
pub use transport::{Queue, QueueFactory, QueueMode, TransportError};
