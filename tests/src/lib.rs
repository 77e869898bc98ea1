//! # Courier Test Suite
//!
//! Cross-crate flows: real [`MessageBus`](courier_client::MessageBus)
//! instances talking to the simulated broker from `courier-testkit` over the
//! in-memory transport.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── lifecycle.rs          # start, stop, registration rules
//!     ├── publish_subscribe.rs  # topics, acknowledgements, type checks
//!     ├── request_response.rs   # correlation, timeouts, direct delivery
//!     └── heartbeat.rs          # periodic handshakes, failure escalation, send retry
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p courier-tests
//! cargo test -p courier-tests integration::request_response::
//! ```

pub mod integration;
