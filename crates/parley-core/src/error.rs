//! Error types for the delivery core.
//!
//! Only malformed requests are errors. Network failures are not: they are
//! state transitions of the connection manager and never reach the caller
//! as `Err`.

use parley_proto::{MessageId, RoomId};
use thiserror::Error;

use crate::message::LocalId;

/// Errors returned by [`crate::ConnectionManager`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No room has been opened.
    #[error("no active room")]
    NoActiveRoom,

    /// Message addressed to a room other than the open one.
    #[error("message for room {actual} sent on connection for room {expected}")]
    RoomMismatch {
        /// Room the connection is for.
        expected: RoomId,
        /// Room the message was addressed to.
        actual: RoomId,
    },

    /// Connection was closed explicitly and does not accept sends.
    #[error("connection for room {room_id} is closed")]
    Closed {
        /// Room of the closed connection.
        room_id: RoomId,
    },
}

impl ConnectionError {
    /// Returns true if the same operation may succeed after the caller
    /// reopens the room.
    ///
    /// Mismatched rooms are a caller bug and never recover.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoActiveRoom | Self::Closed { .. })
    }
}

/// A broken reconciler invariant, reported by
/// [`crate::InboundReconciler::check_invariants`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Two entries carry the same durable id.
    #[error("durable id {id} appears at entries {first} and {second}")]
    DuplicateId {
        /// Duplicated id.
        id: MessageId,
        /// Index of the first occurrence.
        first: usize,
        /// Index of the second occurrence.
        second: usize,
    },

    /// Two entries carry the same local id.
    #[error("local id {local_id} appears at entries {first} and {second}")]
    DuplicateLocalId {
        /// Duplicated local id.
        local_id: LocalId,
        /// Index of the first occurrence.
        first: usize,
        /// Index of the second occurrence.
        second: usize,
    },

    /// An index table points at the wrong entry.
    #[error("index for entry {index} is stale")]
    StaleIndex {
        /// Entry the index refers to.
        index: usize,
    },

    /// A pending entry has a durable id, or a durable entry lacks one.
    #[error("entry {index} has origin inconsistent with its id")]
    OriginMismatch {
        /// Offending entry.
        index: usize,
    },

    /// Entry belongs to another room.
    #[error("entry {index} belongs to room {room_id}")]
    ForeignRoom {
        /// Offending entry.
        index: usize,
        /// Room of the entry.
        room_id: RoomId,
    },
}
