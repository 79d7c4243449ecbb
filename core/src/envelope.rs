//! Event envelopes: the wire representation of business events.
//!
//! An [`EventEnvelope`] is built from a record that has already been committed
//! to the store of record, serialized to JSON, published, and discarded. It is
//! never persisted by this crate.
//!
//! # Wire Format
//!
//! Envelopes are UTF-8 JSON objects carrying a `type` tag plus the fields of
//! the variant, flattened into the same object:
//!
//! ```json
//! {"type":"HelloCreated","id":7,"message":"hi"}
//! ```
//!
//! JSON was chosen over a binary encoding because publishers and consumers
//! agree on the schema out of band and may not share a Rust codebase.
//!
//! # Example
//!
//! ```
//! use courier_core::envelope::EventEnvelope;
//!
//! let envelope = EventEnvelope::HelloCreated { id: 7, message: "hi".to_string() };
//! let bytes = envelope.to_bytes().unwrap();
//! assert_eq!(bytes, br#"{"type":"HelloCreated","id":7,"message":"hi"}"#);
//!
//! let decoded = EventEnvelope::from_bytes(&bytes).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for envelope encoding and decoding.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Failed to serialize the envelope to JSON.
    #[error("Failed to serialize envelope: {0}")]
    SerializationError(String),

    /// Payload was not a JSON envelope of a known shape.
    #[error("Failed to deserialize envelope: {0}")]
    DeserializationError(String),
}

/// A business event as it travels over the broker.
///
/// Each variant is one event type. The variant name is the `type` tag on the
/// wire, so renaming a variant is a breaking change for every consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventEnvelope {
    /// A hello message was inserted and committed.
    HelloCreated {
        /// Identifier assigned by the store of record.
        id: i64,
        /// The stored (trimmed) message text.
        message: String,
    },
}

impl EventEnvelope {
    /// The `type` tag this envelope carries on the wire.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::HelloCreated { .. } => "HelloCreated",
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SerializationError`] if serde fails, which does
    /// not happen for the current variants but is kept in the signature so new
    /// variants with fallible fields need no API change.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::SerializationError(e.to_string()))
    }

    /// Decode an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the bytes are not
    /// UTF-8 JSON, the `type` tag is unknown, or a field has the wrong type
    /// (for example a string `id`).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::DeserializationError(e.to_string()))
    }
}
