//! Outbound and displayed message types.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use parley_proto::{
    Envelope, LiveMessage, MessageError, MessageId, Metadata, RoomId, StoredMessage, UserId,
    validate_content,
};

/// Client-generated message identifier.
///
/// Assigned at compose time and used to correlate the optimistic entry, the
/// live copy and the durable acknowledgement of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(u128);

impl LocalId {
    /// Wrap a raw value, usually from [`crate::Environment::random_u128`].
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn get(self) -> u128 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(Self)
    }
}

/// A message composed locally and not yet confirmed.
///
/// Content is validated on construction, so every `PendingMessage` is one the
/// server would accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    local_id: LocalId,
    room_id: RoomId,
    user_id: UserId,
    content: String,
    metadata: Option<Metadata>,
    created_at: DateTime<Utc>,
}

impl PendingMessage {
    /// Compose a message.
    ///
    /// # Errors
    ///
    /// - [`MessageError::Empty`] if content is blank
    /// - [`MessageError::TooLong`] if content exceeds the server limit
    pub fn new(
        local_id: LocalId,
        room_id: RoomId,
        user_id: UserId,
        content: String,
        metadata: Option<Metadata>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, MessageError> {
        validate_content(&content)?;
        Ok(Self { local_id, room_id, user_id, content, metadata, created_at })
    }

    /// Local correlation id.
    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    /// Target room.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Author.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Message body.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Optional envelope metadata.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Compose time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Live channel envelope for this message.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::message(
            self.room_id.clone(),
            self.user_id.clone(),
            self.content.clone(),
            self.created_at,
            self.metadata.clone(),
        )
    }
}

/// Which path produced the current state of a displayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOrigin {
    /// Optimistic local entry, not yet acknowledged.
    LocalPending,
    /// Received from another user on the live channel.
    LiveConfirmed,
    /// Confirmed by the message API, or loaded from history.
    DurableConfirmed,
}

/// One entry of a room's displayed message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Durable id. `None` until the server has persisted the message, or
    /// for live messages that carried no id.
    pub id: Option<MessageId>,
    /// Local id. Set only for messages composed by this client.
    pub local_id: Option<LocalId>,
    /// Room.
    pub room_id: RoomId,
    /// Author.
    pub sender_id: UserId,
    /// Author display name.
    pub sender_name: String,
    /// Message body.
    pub content: String,
    /// Compose time for local and live entries, persist time once durable.
    pub created_at: DateTime<Utc>,
    /// Provenance.
    pub origin: MessageOrigin,
    /// Durable write failed; the entry awaits a retry.
    pub failed: bool,
}

impl Message {
    pub(crate) fn local(pending: &PendingMessage, sender_name: String) -> Self {
        Self {
            id: None,
            local_id: Some(pending.local_id),
            room_id: pending.room_id.clone(),
            sender_id: pending.user_id.clone(),
            sender_name,
            content: pending.content.clone(),
            created_at: pending.created_at,
            origin: MessageOrigin::LocalPending,
            failed: false,
        }
    }

    pub(crate) fn live(msg: &LiveMessage) -> Self {
        Self {
            id: msg.message_id.clone(),
            local_id: None,
            room_id: msg.room_id.clone(),
            sender_id: msg.sender_id.clone(),
            sender_name: msg.sender_name.clone(),
            content: msg.content.clone(),
            created_at: msg.timestamp,
            origin: MessageOrigin::LiveConfirmed,
            failed: false,
        }
    }

    pub(crate) fn durable(stored: &StoredMessage, room_id: &RoomId) -> Self {
        let sender_name =
            stored.user_name.clone().unwrap_or_else(|| stored.user_id.as_str().to_owned());
        Self {
            id: Some(stored.id.clone()),
            local_id: None,
            room_id: room_id.clone(),
            sender_id: stored.user_id.clone(),
            sender_name,
            content: stored.content.clone(),
            created_at: stored.created_at,
            origin: MessageOrigin::DurableConfirmed,
            failed: false,
        }
    }

    /// True while the message awaits durable confirmation.
    pub fn is_pending(&self) -> bool {
        self.origin == MessageOrigin::LocalPending
    }
}
