//! Per-room message list reconciliation.
//!
//! A message composed here reaches the list up to three times: as the
//! optimistic local entry, as the live echo and as the durable
//! acknowledgement. The reconciler merges these into exactly one entry,
//! keyed on the local id and the server id rather than on arrival order, so
//! the live echo and the durable ack may arrive in either order.
//!
//! The local user's own live echoes are suppressed outright. The durable ack
//! is the sole source of confirmation for messages composed here.

use std::collections::{HashMap, HashSet};

use parley_proto::{LiveMessage, MessageId, RoomId, StoredMessage, UserId};

use crate::{
    error::InvariantViolation,
    message::{LocalId, Message, MessageOrigin, PendingMessage},
};

/// Largest gap between a live timestamp (sender's clock) and a stored one
/// (server's clock) that still counts as the same message.
pub const LIVE_MATCH_WINDOW_SECS: i64 = 120;

/// Outcome of applying one input to the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A new entry was added at this index.
    Appended(usize),
    /// The entry at this index changed in place.
    Updated(usize),
    /// Live echo of the local user's own message, dropped.
    Suppressed,
    /// Already present, nothing changed.
    Duplicate,
    /// Not for this room, or conflicting with what is already known.
    Ignored,
}

impl Reconciled {
    /// True if the list changed.
    pub fn changed(self) -> bool {
        matches!(self, Self::Appended(_) | Self::Updated(_))
    }
}

/// Ordered, de-duplicated message list for one room.
#[derive(Debug, Clone)]
pub struct InboundReconciler {
    room_id: RoomId,
    local_user: UserId,
    entries: Vec<Message>,
    by_local: HashMap<LocalId, usize>,
    by_id: HashMap<MessageId, usize>,
}

impl InboundReconciler {
    /// Empty list for `room_id`, as seen by `local_user`.
    pub fn new(room_id: RoomId, local_user: UserId) -> Self {
        Self {
            room_id,
            local_user,
            entries: Vec::new(),
            by_local: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Room this list belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Entries in display order.
    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for a locally composed message.
    pub fn get_local(&self, local_id: LocalId) -> Option<&Message> {
        self.by_local.get(&local_id).map(|&i| &self.entries[i])
    }

    /// Entry with a durable id.
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.by_id.get(id).map(|&i| &self.entries[i])
    }

    /// Add the optimistic entry for a message composed here.
    pub fn submit_local(&mut self, pending: &PendingMessage, sender_name: &str) -> Reconciled {
        if pending.room_id() != &self.room_id {
            return Reconciled::Ignored;
        }
        if self.by_local.contains_key(&pending.local_id()) {
            return Reconciled::Duplicate;
        }

        let index = self.push(Message::local(pending, sender_name.to_owned()));
        Reconciled::Appended(index)
    }

    /// Apply a chat message from the live channel.
    pub fn apply_live(&mut self, live: &LiveMessage) -> Reconciled {
        if !self.is_own_room(&live.room_id) {
            return Reconciled::Ignored;
        }

        if live.sender_id == self.local_user {
            tracing::trace!(room_id = %self.room_id, "suppressing live echo of own message");
            return Reconciled::Suppressed;
        }

        if let Some(id) = &live.message_id
            && self.by_id.contains_key(id)
        {
            return Reconciled::Duplicate;
        }

        Reconciled::Appended(self.push(Message::live(live)))
    }

    /// Apply a durable acknowledgement.
    ///
    /// `local_id` is set when the ack answers a write issued by this client.
    /// The pending entry is then replaced in place. Without a matching
    /// pending entry the stored message is appended.
    pub fn apply_durable(
        &mut self,
        local_id: Option<LocalId>,
        stored: &StoredMessage,
    ) -> Reconciled {
        if !self.is_own_room(&stored.room_id) {
            return Reconciled::Ignored;
        }

        let pending = local_id.and_then(|l| self.by_local.get(&l).copied());
        let existing = self.by_id.get(&stored.id).copied();

        match (pending, existing) {
            (Some(p), None) => {
                if let Some(other) = &self.entries[p].id {
                    tracing::warn!(
                        room_id = %self.room_id,
                        local_id = ?local_id,
                        known = %other,
                        acked = %stored.id,
                        "conflicting durable ack ignored"
                    );
                    return Reconciled::Ignored;
                }

                confirm(&mut self.entries[p], stored);
                self.by_id.insert(stored.id.clone(), p);
                Reconciled::Updated(p)
            },
            (Some(p), Some(i)) if p == i => Reconciled::Duplicate,
            (Some(p), Some(i)) => {
                // Same message known twice; keep the earlier entry.
                let (keep, drop) = if p < i { (p, i) } else { (i, p) };
                confirm(&mut self.entries[keep], stored);
                self.entries[keep].local_id = local_id;
                self.entries.remove(drop);
                self.rebuild_indices();
                Reconciled::Updated(keep)
            },
            (None, Some(i)) => {
                let entry = &mut self.entries[i];
                if entry.origin == MessageOrigin::DurableConfirmed {
                    return Reconciled::Duplicate;
                }
                confirm(entry, stored);
                Reconciled::Updated(i)
            },
            (None, None) => {
                let mut message = Message::durable(stored, &self.room_id);
                message.local_id = local_id;
                Reconciled::Appended(self.push(message))
            },
        }
    }

    /// Merge the room history fetched on entry.
    ///
    /// `history` is oldest first. Messages not yet known are placed, in that
    /// order, ahead of everything received since entering the room; known
    /// ones are upgraded in place. A live entry that arrived without a
    /// durable id counts as known when sender and content match and the
    /// timestamps are within [`LIVE_MATCH_WINDOW_SECS`]. Returns how many
    /// entries were added.
    pub fn apply_history(&mut self, history: &[StoredMessage]) -> usize {
        let mut older = Vec::new();
        let mut seen = HashSet::new();

        for stored in history {
            if !self.is_own_room(&stored.room_id) || !seen.insert(&stored.id) {
                continue;
            }
            match self.by_id.get(&stored.id) {
                Some(&i) => {
                    if self.entries[i].origin != MessageOrigin::DurableConfirmed {
                        confirm(&mut self.entries[i], stored);
                    }
                },
                None => match self.unmatched_live(stored) {
                    Some(i) => {
                        confirm(&mut self.entries[i], stored);
                        self.by_id.insert(stored.id.clone(), i);
                    },
                    None => older.push(Message::durable(stored, &self.room_id)),
                },
            }
        }

        let added = older.len();
        if added > 0 {
            older.append(&mut self.entries);
            self.entries = older;
            self.rebuild_indices();
        }

        tracing::debug!(
            room_id = %self.room_id,
            added,
            total = self.entries.len(),
            "history merged"
        );
        added
    }

    /// Flag a pending entry whose durable write failed.
    ///
    /// Returns false if there is no pending entry for `local_id`.
    pub fn mark_failed(&mut self, local_id: LocalId) -> bool {
        self.set_failed(local_id, true)
    }

    /// Clear the failure flag before a retry.
    pub fn clear_failed(&mut self, local_id: LocalId) -> bool {
        self.set_failed(local_id, false)
    }

    /// Pending entries whose durable write failed.
    pub fn failed(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().filter(|m| m.failed)
    }

    /// Verify the list invariants.
    ///
    /// - every entry belongs to this room
    /// - pending entries have no durable id, durable entries have one
    /// - no two entries share a durable id or a local id
    /// - both index tables point at the right entries and nothing else
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut ids: HashMap<&MessageId, usize> = HashMap::new();
        let mut locals: HashMap<LocalId, usize> = HashMap::new();

        for (index, entry) in self.entries.iter().enumerate() {
            if entry.room_id != self.room_id {
                return Err(InvariantViolation::ForeignRoom {
                    index,
                    room_id: entry.room_id.clone(),
                });
            }

            let consistent = match entry.origin {
                MessageOrigin::LocalPending => entry.id.is_none() && entry.local_id.is_some(),
                MessageOrigin::DurableConfirmed => entry.id.is_some(),
                MessageOrigin::LiveConfirmed => entry.local_id.is_none(),
            };
            if !consistent {
                return Err(InvariantViolation::OriginMismatch { index });
            }

            if let Some(id) = &entry.id {
                if let Some(first) = ids.insert(id, index) {
                    return Err(InvariantViolation::DuplicateId {
                        id: id.clone(),
                        first,
                        second: index,
                    });
                }
                if self.by_id.get(id) != Some(&index) {
                    return Err(InvariantViolation::StaleIndex { index });
                }
            }

            if let Some(local_id) = entry.local_id {
                if let Some(first) = locals.insert(local_id, index) {
                    return Err(InvariantViolation::DuplicateLocalId {
                        local_id,
                        first,
                        second: index,
                    });
                }
                if self.by_local.get(&local_id) != Some(&index) {
                    return Err(InvariantViolation::StaleIndex { index });
                }
            }
        }

        if ids.len() != self.by_id.len() || locals.len() != self.by_local.len() {
            return Err(InvariantViolation::StaleIndex { index: self.entries.len() });
        }

        Ok(())
    }

    /// First live entry without a durable id that is the same message as
    /// `stored`.
    fn unmatched_live(&self, stored: &StoredMessage) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.origin == MessageOrigin::LiveConfirmed
                && entry.id.is_none()
                && entry.sender_id == stored.user_id
                && entry.content == stored.content
                && (entry.created_at - stored.created_at).num_seconds().abs()
                    <= LIVE_MATCH_WINDOW_SECS
        })
    }

    fn is_own_room(&self, room_id: &RoomId) -> bool {
        // The message API omits roomId on some responses
        room_id.as_str().is_empty() || room_id == &self.room_id
    }

    fn set_failed(&mut self, local_id: LocalId, failed: bool) -> bool {
        match self.by_local.get(&local_id) {
            Some(&i) if self.entries[i].is_pending() => {
                self.entries[i].failed = failed;
                true
            },
            _ => false,
        }
    }

    fn push(&mut self, message: Message) -> usize {
        let index = self.entries.len();
        if let Some(id) = &message.id {
            self.by_id.insert(id.clone(), index);
        }
        if let Some(local_id) = message.local_id {
            self.by_local.insert(local_id, index);
        }
        self.entries.push(message);
        index
    }

    fn rebuild_indices(&mut self) {
        self.by_id.clear();
        self.by_local.clear();
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(id) = &entry.id {
                self.by_id.insert(id.clone(), index);
            }
            if let Some(local_id) = entry.local_id {
                self.by_local.insert(local_id, index);
            }
        }
    }
}

/// Promote an entry to durable using the server's record.
fn confirm(entry: &mut Message, stored: &StoredMessage) {
    entry.id = Some(stored.id.clone());
    entry.content.clone_from(&stored.content);
    entry.created_at = stored.created_at;
    entry.origin = MessageOrigin::DurableConfirmed;
    entry.failed = false;
    if let Some(name) = &stored.user_name {
        entry.sender_name.clone_from(name);
    }
}
