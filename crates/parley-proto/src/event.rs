//! Decoded inbound live channel events.
//!
//! The wire envelope is loosely typed: every field except `type` is optional
//! in practice. [`InboundEvent`] is the closed, exhaustively matched form the
//! rest of the client works with. Unknown `type` values surface as
//! [`ProtocolError::UnknownType`] rather than a catch-all variant, so callers
//! decide explicitly what to do with them.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    envelope::{EnvelopeKind, Metadata},
    errors::{ProtocolError, Result},
    ids::{MessageId, RoomId, UserId},
};

/// A chat message received on the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMessage {
    /// Room the message was posted to.
    pub room_id: RoomId,
    /// Author.
    pub sender_id: UserId,
    /// Author display name. Falls back to the user id when absent.
    pub sender_name: String,
    /// Message body.
    pub content: String,
    /// Durable id, when the server attached one.
    pub message_id: Option<MessageId>,
    /// Time the message was produced.
    pub timestamp: DateTime<Utc>,
}

/// Events arriving on the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Chat message. The only variant that takes part in reconciliation.
    Message(LiveMessage),

    /// Typing indicator changed.
    Typing {
        /// User who is (or stopped) typing.
        user_id: UserId,
        /// Whether the user is typing now.
        is_typing: bool,
    },

    /// Read receipt.
    ReadReceipt {
        /// User who read.
        user_id: UserId,
        /// Message the receipt refers to.
        message_id: Option<MessageId>,
        /// All readers known to the server.
        read_by: Vec<UserId>,
    },

    /// A user connected to the room.
    PresenceJoin {
        /// User who joined.
        user_id: UserId,
        /// Display name, if provided.
        user_name: Option<String>,
    },

    /// A user disconnected from the room.
    PresenceLeave {
        /// User who left.
        user_id: UserId,
        /// Display name, if provided.
        user_name: Option<String>,
    },

    /// Server reported an error on this channel.
    Error {
        /// Error text.
        message: String,
    },
}

/// Envelope shape with the type left as a raw string.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    room_id: RoomId,
    #[serde(default)]
    user_id: UserId,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

impl InboundEvent {
    /// Decode one live channel text frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Malformed`] if the frame is not an envelope object
    /// - [`ProtocolError::UnknownType`] if `type` is not a known variant
    /// - [`ProtocolError::MissingField`] if a message has no content or no
    ///   timestamp
    pub fn decode(text: &str) -> Result<Self> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = EnvelopeKind::from_wire(&raw.kind)
            .ok_or_else(|| ProtocolError::UnknownType(raw.kind.clone()))?;

        let metadata = raw.metadata.unwrap_or_default();

        let event = match kind {
            EnvelopeKind::Message => {
                let content = raw.content.ok_or(ProtocolError::MissingField {
                    kind: kind.as_str(),
                    field: "content",
                })?;
                let timestamp = raw.timestamp.ok_or(ProtocolError::MissingField {
                    kind: kind.as_str(),
                    field: "timestamp",
                })?;
                let sender_name =
                    metadata.user_name.unwrap_or_else(|| raw.user_id.as_str().to_owned());

                Self::Message(LiveMessage {
                    room_id: raw.room_id,
                    sender_id: raw.user_id,
                    sender_name,
                    content,
                    message_id: metadata.message_id,
                    timestamp,
                })
            },
            EnvelopeKind::Typing => Self::Typing {
                user_id: raw.user_id,
                is_typing: metadata.is_typing.unwrap_or(false),
            },
            EnvelopeKind::ReadReceipt => Self::ReadReceipt {
                user_id: raw.user_id,
                message_id: metadata.message_id,
                read_by: metadata.read_by.unwrap_or_default(),
            },
            EnvelopeKind::UserJoined => {
                Self::PresenceJoin { user_id: raw.user_id, user_name: metadata.user_name }
            },
            EnvelopeKind::UserLeft => {
                Self::PresenceLeave { user_id: raw.user_id, user_name: metadata.user_name }
            },
            EnvelopeKind::Error => {
                Self::Error { message: raw.content.unwrap_or_else(|| "unknown error".to_owned()) }
            },
        };

        Ok(event)
    }

    /// Envelope kind this event was decoded from.
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Message(_) => EnvelopeKind::Message,
            Self::Typing { .. } => EnvelopeKind::Typing,
            Self::ReadReceipt { .. } => EnvelopeKind::ReadReceipt,
            Self::PresenceJoin { .. } => EnvelopeKind::UserJoined,
            Self::PresenceLeave { .. } => EnvelopeKind::UserLeft,
            Self::Error { .. } => EnvelopeKind::Error,
        }
    }
}
