//! # Wire Codec
//!
//! Protocol messages travel as JSON documents carrying an explicit `kind`
//! discriminant. Business payloads are embedded as JSON *strings* inside the
//! message so the receiver can compare the type tag before touching the body.

use crate::errors::CodecError;
use crate::ipc::ProtocolMessage;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Body of an empty response.
pub const NULL_BODY: &str = "null";

/// Encode a protocol message for the transport.
pub fn encode(message: &ProtocolMessage) -> Result<Bytes, CodecError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|source| CodecError::Serialize {
            what: "protocol message",
            source,
        })
}

/// Decode a protocol message received from the transport.
pub fn decode(bytes: &[u8]) -> Result<ProtocolMessage, CodecError> {
    serde_json::from_slice(bytes).map_err(|source| CodecError::Deserialize {
        what: "protocol message",
        source,
    })
}

/// Encode a business payload into an embedded body string.
pub fn encode_body<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|source| CodecError::Serialize {
        what: "payload",
        source,
    })
}

/// Decode an embedded body string into a business payload.
pub fn decode_body<T: DeserializeOwned>(body: &str) -> Result<T, CodecError> {
    serde_json::from_str(body).map_err(|source| CodecError::Deserialize {
        what: "payload",
        source,
    })
}
