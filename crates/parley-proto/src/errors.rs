//! Protocol error types.

use thiserror::Error;

/// Errors produced while decoding or encoding live-channel envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not have the envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Envelope `type` is not one of the known variants.
    #[error("unknown envelope type: {0:?}")]
    UnknownType(String),

    /// A field required by this envelope type is absent.
    #[error("missing field `{field}` in {kind} envelope")]
    MissingField {
        /// Wire name of the envelope type.
        kind: &'static str,
        /// Wire name of the missing field.
        field: &'static str,
    },

    /// Envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Rejection reasons for user-composed message content.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Content is empty or whitespace only.
    #[error("message content is empty")]
    Empty,

    /// Content exceeds the server limit.
    #[error("message content is {len} bytes, limit is {max}")]
    TooLong {
        /// Length of the rejected content in bytes.
        len: usize,
        /// Maximum accepted length in bytes.
        max: usize,
    },
}
