//! # Payload Type Tags
//!
//! A [`MessageType`] is a stable schema identifier attached to every business
//! payload. It is fixed when a handler is registered and compared by value on
//! receipt, so a subscriber bound to `string` never deserializes an `i32`.
//!
//! User payloads opt in through [`BusMessage`], usually via [`bus_message!`]:
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced { id: u64 }
//!
//! shared_types::bus_message!(OrderPlaced => "orders.OrderPlaced");
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a payload schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(String);

impl MessageType {
    /// Create a tag from any string-like value.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// A payload that can travel on the bus.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The schema tag published alongside every value of this type.
    fn message_type() -> MessageType;
}

/// Declare the [`MessageType`] tag for one or more payload types.
#[macro_export]
macro_rules! bus_message {
    ($($ty:ty => $tag:expr),+ $(,)?) => {
        $(
            impl $crate::message_type::BusMessage for $ty {
                fn message_type() -> $crate::message_type::MessageType {
                    $crate::message_type::MessageType::new($tag)
                }
            }
        )+
    };
}

bus_message! {
    String => "string",
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    f64 => "f64",
    () => "unit",
    serde_json::Value => "json",
}

impl<T: BusMessage> BusMessage for Vec<T> {
    fn message_type() -> MessageType {
        MessageType(format!("list<{}>", T::message_type()))
    }
}

impl<T: BusMessage> BusMessage for Option<T> {
    fn message_type() -> MessageType {
        MessageType(format!("option<{}>", T::message_type()))
    }
}
