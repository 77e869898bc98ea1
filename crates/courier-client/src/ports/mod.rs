//! Hexagonal ports: callbacks in, transport and host identity out.

pub mod inbound;
pub mod outbound;

pub use inbound::{HandlerFailure, RequestCallback, ResponsePayload, SubscribeCallback};
pub use outbound::{HostIdentity, StaticHostIdentity, SystemHostIdentity};
