//! # Shared Types Crate
//!
//! This crate contains every type that crosses a queue between a bus client
//! and the central broker: the [`ProtocolMessage`] tagged union, the handler
//! descriptors announced in handshakes, payload type tags and the JSON codec.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All broker-facing types are defined here.
//! - **Explicit Discriminant**: Every message carries a `kind` field on the
//!   wire; receivers match on [`ProtocolMessage`] exhaustively.
//! - **Tag Before Body**: Business payloads travel as embedded JSON strings
//!   next to a [`MessageType`] tag, so a receiver can reject a payload of the
//!   wrong schema before deserializing it.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod correlation;
pub mod entities;
pub mod envelope;
pub mod errors;
pub mod ipc;
pub mod message_type;

pub use correlation::CorrelationId;
pub use entities::*;
pub use envelope::{decode, decode_body, encode, encode_body, NULL_BODY};
pub use errors::*;
pub use ipc::*;
pub use message_type::{BusMessage, MessageType};
