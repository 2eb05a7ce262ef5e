//! Parley wire protocol
//!
//! Types exchanged with the chat server over its two delivery paths:
//!
//! - The live channel: one WebSocket per room carrying JSON [`Envelope`]s.
//!   Inbound envelopes are decoded into the closed [`InboundEvent`] set.
//! - The message API: request/response calls that persist a message and
//!   return its authoritative [`StoredMessage`] record.
//!
//! This crate performs no I/O. It only defines shapes and their validation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod content;
pub mod envelope;
pub mod errors;
pub mod event;
pub mod ids;
pub mod rest;

pub use content::{MAX_CONTENT_BYTES, validate_content};
pub use envelope::{Envelope, EnvelopeKind, Metadata};
pub use errors::{MessageError, ProtocolError, Result};
pub use event::{InboundEvent, LiveMessage};
pub use ids::{MessageId, RoomId, UserId};
pub use rest::{
    ApiErrorBody, DEFAULT_HISTORY_LIMIT, HistoryQuery, HistoryResponse, PostMessageRequest,
    PostMessageResponse, StoredMessage,
};
