//! FIFO buffer of messages awaiting an open live channel.

use std::collections::VecDeque;

use crate::message::PendingMessage;

/// Messages sent while the live channel was not open, in send order.
///
/// Owned by the connection manager; only it drains the queue, on open.
/// Unbounded unless a capacity is set, in which case the oldest entry is
/// evicted to make room.
#[derive(Debug, Clone, Default)]
pub struct OutboundQueue {
    items: VecDeque<PendingMessage>,
    capacity: Option<usize>,
}

impl OutboundQueue {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue holding at most `capacity` messages. `None` is unbounded.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self { items: VecDeque::new(), capacity }
    }

    /// Append a message. Returns the evicted message if the queue was full.
    pub fn enqueue(&mut self, message: PendingMessage) -> Option<PendingMessage> {
        self.items.push_back(message);
        self.evict_overflow().pop()
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&mut self) -> Vec<PendingMessage> {
        self.items.drain(..).collect()
    }

    /// Put messages back at the front, keeping their relative order.
    ///
    /// Used when a flush fails part-way: the unsent tail goes back ahead of
    /// anything queued since.
    pub fn requeue_front(&mut self, messages: Vec<PendingMessage>) {
        for message in messages.into_iter().rev() {
            self.items.push_front(message);
        }
        self.evict_overflow();
    }

    fn evict_overflow(&mut self) -> Vec<PendingMessage> {
        let Some(cap) = self.capacity else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        while self.items.len() > cap {
            let Some(old) = self.items.pop_front() else {
                break;
            };
            tracing::warn!(
                local_id = %old.local_id(),
                room_id = %old.room_id(),
                capacity = cap,
                "outbound queue full, dropping oldest message"
            );
            evicted.push(old);
        }
        evicted
    }

    /// Discard everything. Returns how many messages were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queued messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.items.iter()
    }
}
