//! Live channel envelope.
//!
//! Every frame on the live channel is one JSON object:
//!
//! ```json
//! {
//!   "type": "message",
//!   "roomId": "r1",
//!   "userId": "u1",
//!   "content": "hi",
//!   "timestamp": "2024-05-01T10:00:00Z",
//!   "metadata": { "userName": "Ada" }
//! }
//! ```
//!
//! `content` and `metadata` are optional; which fields matter depends on
//! `type`. Inbound frames are not decoded through [`Envelope`] directly but
//! through [`crate::InboundEvent::decode`], which keeps unknown types apart
//! from malformed JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    ids::{MessageId, RoomId, UserId},
};

/// Known envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Chat message.
    Message,
    /// Typing indicator.
    Typing,
    /// Read receipt.
    ReadReceipt,
    /// A user joined the room.
    UserJoined,
    /// A user left the room.
    UserLeft,
    /// Server-side error report.
    Error,
}

impl EnvelopeKind {
    /// All known kinds, in wire order.
    pub const ALL: [Self; 6] = [
        Self::Message,
        Self::Typing,
        Self::ReadReceipt,
        Self::UserJoined,
        Self::UserLeft,
        Self::Error,
    ];

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::ReadReceipt => "read_receipt",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::Error => "error",
        }
    }

    /// Parse a wire name. `None` for anything not in [`Self::ALL`].
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

/// Optional per-envelope details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Typing indicator state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    /// Users that have read the referenced message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_by: Option<Vec<UserId>>,
    /// Durable id of the referenced or carried message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Display name of the acting user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Avatar URL of the acting user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar: Option<String>,
}

impl Metadata {
    /// True if no field is set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One live channel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Envelope type.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Room the frame belongs to.
    pub room_id: RoomId,
    /// Acting user.
    pub user_id: UserId,
    /// Message body or error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Time the frame was produced.
    pub timestamp: DateTime<Utc>,
    /// Optional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Envelope {
    /// Build an outbound chat message envelope.
    ///
    /// Empty metadata is omitted from the wire form.
    pub fn message(
        room_id: RoomId,
        user_id: UserId,
        content: String,
        timestamp: DateTime<Utc>,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            room_id,
            user_id,
            content: Some(content),
            timestamp,
            metadata: metadata.filter(|m| !m.is_empty()),
        }
    }

    /// Serialize to the JSON text sent on the live channel.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}
