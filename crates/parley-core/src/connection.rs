//! Live channel state machine.
//!
//! Owns the single live connection for the active room: dialing, outbound
//! buffering, reconnect scheduling and room switches. Uses the action
//! pattern: methods take time as input and return actions for the driver to
//! execute. No I/O happens here.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  open   ┌────────────┐  opened   ┌──────┐
//! │ Idle │────────>│ Connecting │──────────>│ Open │
//! └──────┘         └────────────┘           └──────┘
//!                     ↑     │ closed          │ closed
//!                tick │     ↓                 ↓
//!                  ┌───────────────────────────────┐
//!                  │ Closed { will_retry: true }   │
//!                  └───────────────────────────────┘
//!
//!   close() from any state ──> Closed { will_retry: false }
//! ```
//!
//! Every dial gets a fresh [`ChannelId`]. Events carrying an older channel
//! id refer to a socket that has since been replaced and are ignored.

use std::{fmt, time::Instant};

use parley_proto::{InboundEvent, RoomId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    backoff::ReconnectPolicy,
    env::Moment,
    error::ConnectionError,
    message::PendingMessage,
    outbound::OutboundQueue,
};

/// Seed for reconnect jitter when none is supplied.
const DEFAULT_JITTER_SEED: u64 = 0x5eed_cafe_f00d_0001;

/// Identifies one dial attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Wrap a raw generation number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw generation number.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Live connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No room opened yet.
    Idle,
    /// Dial issued, waiting for the channel to open.
    Connecting,
    /// Channel open, sends go straight out.
    Open,
    /// Channel closed.
    Closed {
        /// A reconnect is scheduled. False only after an explicit close.
        will_retry: bool,
    },
}

impl ConnectionState {
    /// True while the manager still intends to deliver to this room.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Closed { will_retry: true })
    }
}

/// Actions returned by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a live channel to this room.
    Dial {
        /// Generation of the new channel.
        channel: ChannelId,
        /// Room to connect to.
        room_id: RoomId,
    },

    /// Send a message on an open channel.
    Transmit {
        /// Channel to send on.
        channel: ChannelId,
        /// Message to encode and send.
        message: PendingMessage,
    },

    /// Close a channel.
    Hangup {
        /// Channel to close.
        channel: ChannelId,
        /// Reason for closing.
        reason: String,
    },

    /// Hand a decoded event to the room session.
    Deliver {
        /// Room the event arrived on.
        room_id: RoomId,
        /// The event.
        event: InboundEvent,
    },
}

/// Connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Delay policy between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Maximum queued outbound messages. `None` is unbounded.
    pub outbound_capacity: Option<usize>,
}

/// State for the active room's connection.
#[derive(Debug, Clone)]
struct Connection<I> {
    room_id: RoomId,
    channel: ChannelId,
    state: ConnectionState,
    /// Consecutive failed attempts since the last successful open.
    attempt: u32,
    retry_at: Option<I>,
    /// When `state` was last entered.
    since: I,
    outbound: OutboundQueue,
}

impl<I: Moment> Connection<I> {
    fn is_current(&self, channel: ChannelId) -> bool {
        self.channel == channel
    }

    /// Hang up the socket if one is outstanding.
    fn hangup(&self, reason: &str) -> Option<ConnectionAction> {
        matches!(self.state, ConnectionState::Connecting | ConnectionState::Open).then(|| {
            ConnectionAction::Hangup { channel: self.channel, reason: reason.to_owned() }
        })
    }
}

/// Connection manager.
///
/// Holds at most one connection, for the active room. Generic over `Instant`
/// to support both real time and virtual time for deterministic testing.
#[derive(Debug, Clone)]
pub struct ConnectionManager<I = Instant> {
    config: ConnectionConfig,
    current: Option<Connection<I>>,
    last_channel: u64,
    jitter: ChaCha8Rng,
}

impl<I: Moment> ConnectionManager<I> {
    /// Create an idle manager.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_seed(config, DEFAULT_JITTER_SEED)
    }

    /// Create an idle manager with an explicit reconnect jitter seed.
    pub fn with_seed(config: ConnectionConfig, seed: u64) -> Self {
        Self { config, current: None, last_channel: 0, jitter: ChaCha8Rng::seed_from_u64(seed) }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.current.as_ref().map_or(ConnectionState::Idle, |c| c.state)
    }

    /// Room of the current connection, if any.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.current.as_ref().map(|c| &c.room_id)
    }

    /// Channel of the latest dial, if any.
    pub fn channel(&self) -> Option<ChannelId> {
        self.current.as_ref().map(|c| c.channel)
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.current.as_ref().map_or(0, |c| c.attempt)
    }

    /// When the next reconnect is due. `None` if none is scheduled.
    pub fn next_deadline(&self) -> Option<I> {
        self.current.as_ref().and_then(|c| c.retry_at)
    }

    /// Number of messages waiting for the channel to open.
    pub fn pending_outbound(&self) -> usize {
        self.current.as_ref().map_or(0, |c| c.outbound.len())
    }

    /// Messages waiting for the channel to open, oldest first.
    pub fn outbound(&self) -> impl Iterator<Item = &PendingMessage> {
        self.current.iter().flat_map(|c| c.outbound.iter())
    }

    /// Open a live connection to `room_id`.
    ///
    /// A no-op if the current connection is already for this room and not
    /// explicitly closed. Otherwise the old connection is torn down first:
    /// its retry is cancelled, its channel hung up and its queue discarded.
    pub fn open(&mut self, room_id: RoomId, now: I) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        if let Some(old) = self.current.take() {
            if old.room_id == room_id && old.state.is_live() {
                self.current = Some(old);
                return actions;
            }

            let discarded = old.outbound.len();
            tracing::info!(
                from = %old.room_id,
                to = %room_id,
                discarded,
                "switching live connection"
            );
            actions.extend(old.hangup("switching room"));
        }

        let channel = self.next_channel();
        tracing::debug!(room_id = %room_id, %channel, "dialing");

        actions.push(ConnectionAction::Dial { channel, room_id: room_id.clone() });
        self.current = Some(Connection {
            room_id,
            channel,
            state: ConnectionState::Connecting,
            attempt: 0,
            retry_at: None,
            since: now,
            outbound: OutboundQueue::with_capacity(self.config.outbound_capacity),
        });

        actions
    }

    /// Close the connection explicitly. No reconnect follows.
    ///
    /// Queued messages are discarded.
    pub fn close(&mut self, reason: &str) -> Vec<ConnectionAction> {
        let Some(conn) = self.current.as_mut() else {
            return Vec::new();
        };

        let actions: Vec<_> = conn.hangup(reason).into_iter().collect();
        let discarded = conn.outbound.clear();

        tracing::info!(room_id = %conn.room_id, discarded, reason, "closing live connection");

        conn.state = ConnectionState::Closed { will_retry: false };
        conn.retry_at = None;
        actions
    }

    /// Send a message on the live channel.
    ///
    /// Transmitted at once when open, queued while connecting or waiting to
    /// reconnect.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NoActiveRoom`] if no room was opened
    /// - [`ConnectionError::RoomMismatch`] if the message is for another room
    /// - [`ConnectionError::Closed`] after an explicit [`Self::close`]
    pub fn send(
        &mut self,
        message: PendingMessage,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let conn = self.current.as_mut().ok_or(ConnectionError::NoActiveRoom)?;

        if message.room_id() != &conn.room_id {
            return Err(ConnectionError::RoomMismatch {
                expected: conn.room_id.clone(),
                actual: message.room_id().clone(),
            });
        }

        match conn.state {
            ConnectionState::Open => {
                Ok(vec![ConnectionAction::Transmit { channel: conn.channel, message }])
            },
            ConnectionState::Connecting | ConnectionState::Closed { will_retry: true } => {
                tracing::debug!(
                    local_id = %message.local_id(),
                    queued = conn.outbound.len() + 1,
                    "channel not open, queueing message"
                );
                conn.outbound.enqueue(message);
                Ok(Vec::new())
            },
            ConnectionState::Closed { will_retry: false } => {
                Err(ConnectionError::Closed { room_id: conn.room_id.clone() })
            },
            // Idle is only reported without a current connection
            ConnectionState::Idle => Err(ConnectionError::NoActiveRoom),
        }
    }

    /// The channel opened. Flushes queued messages in FIFO order.
    pub fn handle_opened(&mut self, channel: ChannelId, now: I) -> Vec<ConnectionAction> {
        let Some(conn) = self.current.as_mut() else {
            return Vec::new();
        };

        if !conn.is_current(channel) || conn.state != ConnectionState::Connecting {
            tracing::debug!(%channel, state = ?conn.state, "ignoring open of stale channel");
            return Vec::new();
        }

        conn.state = ConnectionState::Open;
        conn.attempt = 0;
        conn.retry_at = None;
        conn.since = now;

        let queued = conn.outbound.drain();
        tracing::info!(
            room_id = %conn.room_id,
            %channel,
            flushed = queued.len(),
            "live channel open"
        );

        queued
            .into_iter()
            .map(|message| ConnectionAction::Transmit { channel, message })
            .collect()
    }

    /// The channel closed without being asked to, or the dial failed.
    ///
    /// Schedules a reconnect. Retries continue until one succeeds or the
    /// connection is closed explicitly.
    pub fn handle_closed(
        &mut self,
        channel: ChannelId,
        reason: &str,
        now: I,
    ) -> Vec<ConnectionAction> {
        let Some(conn) = self.current.as_mut() else {
            return Vec::new();
        };

        if !conn.is_current(channel) {
            tracing::debug!(%channel, "ignoring close of stale channel");
            return Vec::new();
        }

        if !matches!(conn.state, ConnectionState::Connecting | ConnectionState::Open) {
            return Vec::new();
        }

        let delay = self.config.reconnect.delay(conn.attempt, &mut self.jitter);
        let uptime = now - conn.since;

        tracing::warn!(
            room_id = %conn.room_id,
            %channel,
            attempt = conn.attempt,
            delay_ms = delay.as_millis() as u64,
            uptime_ms = uptime.as_millis() as u64,
            reason,
            "live channel closed, scheduling reconnect"
        );

        conn.state = ConnectionState::Closed { will_retry: true };
        conn.attempt = conn.attempt.saturating_add(1);
        conn.retry_at = Some(now + delay);
        conn.since = now;

        Vec::new()
    }

    /// Sending on a channel failed.
    ///
    /// `unsent` are the messages that did not go out, in order. They return
    /// to the front of the queue, the channel is hung up and treated as
    /// dropped.
    /// Messages for a room that is no longer active are discarded.
    pub fn handle_transmit_failed(
        &mut self,
        channel: ChannelId,
        unsent: Vec<PendingMessage>,
        reason: &str,
        now: I,
    ) -> Vec<ConnectionAction> {
        let Some(conn) = self.current.as_mut() else {
            return Vec::new();
        };

        let (keep, dropped): (Vec<_>, Vec<_>) =
            unsent.into_iter().partition(|m| m.room_id() == &conn.room_id);
        if !dropped.is_empty() {
            tracing::debug!(dropped = dropped.len(), "discarding unsent messages for old room");
        }

        if conn.is_current(channel) {
            if conn.state.is_live() {
                conn.outbound.requeue_front(keep);
            }
            // The socket is abandoned; let the driver release it
            let mut actions: Vec<_> = conn.hangup(reason).into_iter().collect();
            actions.extend(self.handle_closed(channel, reason, now));
            return actions;
        }

        // A replaced socket of the same room failed; the messages still need
        // to go out on the current channel.
        match conn.state {
            ConnectionState::Open => keep
                .into_iter()
                .map(|message| ConnectionAction::Transmit { channel: conn.channel, message })
                .collect(),
            ConnectionState::Connecting | ConnectionState::Closed { will_retry: true } => {
                conn.outbound.requeue_front(keep);
                Vec::new()
            },
            ConnectionState::Idle | ConnectionState::Closed { will_retry: false } => Vec::new(),
        }
    }

    /// A text frame arrived.
    ///
    /// Malformed and unknown frames are logged and dropped; the connection
    /// stays open.
    pub fn handle_frame(&mut self, channel: ChannelId, text: &str) -> Vec<ConnectionAction> {
        let Some(conn) = self.current.as_ref() else {
            return Vec::new();
        };

        if !conn.is_current(channel) || conn.state != ConnectionState::Open {
            tracing::debug!(%channel, "ignoring frame from stale channel");
            return Vec::new();
        }

        match InboundEvent::decode(text) {
            Ok(event) => vec![ConnectionAction::Deliver { room_id: conn.room_id.clone(), event }],
            Err(err) => {
                tracing::warn!(room_id = %conn.room_id, %channel, error = %err, "dropping frame");
                Vec::new()
            },
        }
    }

    /// Process timers. Dials again once the reconnect deadline has passed.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        let due = self.current.as_ref().is_some_and(|c| {
            c.state == ConnectionState::Closed { will_retry: true }
                && c.retry_at.is_some_and(|at| now >= at)
        });
        if !due {
            return Vec::new();
        }

        let channel = self.next_channel();
        let Some(conn) = self.current.as_mut() else {
            return Vec::new();
        };

        tracing::info!(room_id = %conn.room_id, %channel, attempt = conn.attempt, "reconnecting");

        conn.channel = channel;
        conn.state = ConnectionState::Connecting;
        conn.retry_at = None;
        conn.since = now;

        vec![ConnectionAction::Dial { channel, room_id: conn.room_id.clone() }]
    }

    fn next_channel(&mut self) -> ChannelId {
        self.last_channel += 1;
        ChannelId(self.last_channel)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use chrono::DateTime;

    use super::*;
    use crate::message::LocalId;

    fn msg(n: u128, room: &str) -> PendingMessage {
        PendingMessage::new(
            LocalId::new(n),
            room.into(),
            "me".into(),
            format!("message {n}"),
            None,
            DateTime::default(),
        )
        .unwrap()
    }

    fn dialed(actions: &[ConnectionAction]) -> ChannelId {
        match actions.last() {
            Some(ConnectionAction::Dial { channel, .. }) => *channel,
            other => panic!("expected dial, got {other:?}"),
        }
    }

    fn transmitted(actions: &[ConnectionAction]) -> Vec<u128> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Transmit { message, .. } => Some(message.local_id().get()),
                _ => None,
            })
            .collect()
    }

    fn open_manager(room: &str, t0: Instant) -> (ConnectionManager, ChannelId) {
        let mut manager = ConnectionManager::new(ConnectionConfig::default());
        let channel = dialed(&manager.open(room.into(), t0));
        manager.handle_opened(channel, t0);
        (manager, channel)
    }

    #[test]
    fn connection_lifecycle() {
        let t0 = Instant::now();
        let mut manager = ConnectionManager::new(ConnectionConfig::default());
        assert_eq!(manager.state(), ConnectionState::Idle);

        let actions = manager.open("room".into(), t0);
        let channel = dialed(&actions);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert!(manager.handle_opened(channel, t0).is_empty());
        assert_eq!(manager.state(), ConnectionState::Open);

        let actions = manager.close("user left");
        assert_eq!(actions, vec![ConnectionAction::Hangup {
            channel,
            reason: "user left".into()
        }]);
        assert_eq!(manager.state(), ConnectionState::Closed { will_retry: false });
        assert_eq!(manager.next_deadline(), None);
    }

    #[test]
    fn queued_messages_flush_in_order_on_open() {
        let t0 = Instant::now();
        let mut manager = ConnectionManager::new(ConnectionConfig::default());
        let channel = dialed(&manager.open("room".into(), t0));

        for n in 1..=3 {
            assert!(manager.send(msg(n, "room")).unwrap().is_empty());
        }
        assert_eq!(manager.pending_outbound(), 3);

        let actions = manager.handle_opened(channel, t0);
        assert_eq!(transmitted(&actions), vec![1, 2, 3]);
        assert_eq!(manager.pending_outbound(), 0);
    }

    #[test]
    fn send_while_open_transmits_immediately() {
        let t0 = Instant::now();
        let (mut manager, channel) = open_manager("room", t0);

        let actions = manager.send(msg(9, "room")).unwrap();
        assert!(matches!(
            &actions[..],
            [ConnectionAction::Transmit { channel: c, .. }] if *c == channel
        ));
    }

    #[test]
    fn send_errors() {
        let t0 = Instant::now();
        let mut manager: ConnectionManager = ConnectionManager::new(ConnectionConfig::default());
        assert_eq!(manager.send(msg(1, "room")), Err(ConnectionError::NoActiveRoom));

        manager.open("room".into(), t0);
        assert!(matches!(
            manager.send(msg(1, "other")),
            Err(ConnectionError::RoomMismatch { .. })
        ));

        manager.close("done");
        assert_eq!(
            manager.send(msg(1, "room")),
            Err(ConnectionError::Closed { room_id: "room".into() })
        );
    }

    #[test]
    fn unexpected_close_schedules_retry() {
        let t0 = Instant::now();
        let (mut manager, channel) = open_manager("room", t0);

        assert!(manager.handle_closed(channel, "reset", t0).is_empty());
        assert_eq!(manager.state(), ConnectionState::Closed { will_retry: true });
        assert_eq!(manager.next_deadline(), Some(t0 + Duration::from_secs(3)));

        // Sends while waiting are queued, not rejected
        assert!(manager.send(msg(1, "room")).unwrap().is_empty());

        assert!(manager.tick(t0 + Duration::from_secs(2)).is_empty());
        let actions = manager.tick(t0 + Duration::from_secs(3));
        let retry = dialed(&actions);
        assert_ne!(retry, channel);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let actions = manager.handle_opened(retry, t0 + Duration::from_secs(4));
        assert_eq!(transmitted(&actions), vec![1]);
        assert_eq!(manager.attempt(), 0);
    }

    #[test]
    fn failed_dials_retry_indefinitely() {
        let t0 = Instant::now();
        let mut manager = ConnectionManager::new(ConnectionConfig::default());
        let mut channel = dialed(&manager.open("room".into(), t0));
        let mut now = t0;

        for attempt in 1..=20 {
            manager.handle_closed(channel, "refused", now);
            assert_eq!(manager.attempt(), attempt);
            now = manager.next_deadline().unwrap();
            channel = dialed(&manager.tick(now));
        }
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[test]
    fn stale_channel_events_are_ignored() {
        let t0 = Instant::now();
        let (mut manager, old) = open_manager("room", t0);
        manager.handle_closed(old, "reset", t0);
        let new = dialed(&manager.tick(t0 + Duration::from_secs(3)));

        let frame = r#"{"type":"typing","roomId":"room","userId":"u","timestamp":"2024-05-01T10:00:00Z"}"#;
        assert!(manager.handle_opened(old, t0).is_empty());
        assert!(manager.handle_closed(old, "late", t0).is_empty());
        assert!(manager.handle_frame(old, frame).is_empty());
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.handle_opened(new, t0);
        assert_eq!(manager.handle_frame(new, frame).len(), 1);
    }

    #[test]
    fn room_switch_discards_old_queue_and_retry() {
        let t0 = Instant::now();
        let (mut manager, old) = open_manager("a", t0);
        manager.handle_closed(old, "reset", t0);
        manager.send(msg(1, "a")).unwrap();

        let actions = manager.open("b".into(), t0);
        // Old socket already closed, so only a dial
        assert!(matches!(
            &actions[..],
            [ConnectionAction::Dial { room_id, .. }] if room_id.as_str() == "b"
        ));
        assert_eq!(manager.pending_outbound(), 0);
        assert_eq!(manager.next_deadline(), None);
        assert!(manager.tick(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn room_switch_hangs_up_open_channel() {
        let t0 = Instant::now();
        let (mut manager, old) = open_manager("a", t0);

        let actions = manager.open("b".into(), t0);
        assert!(matches!(actions[0], ConnectionAction::Hangup { channel, .. } if channel == old));
        assert!(matches!(actions[1], ConnectionAction::Dial { .. }));
    }

    #[test]
    fn reopening_same_room_is_noop() {
        let t0 = Instant::now();
        let (mut manager, channel) = open_manager("room", t0);
        assert!(manager.open("room".into(), t0).is_empty());
        assert_eq!(manager.channel(), Some(channel));

        // After an explicit close the same room can be opened again
        manager.close("bye");
        let actions = manager.open("room".into(), t0);
        assert_ne!(dialed(&actions), channel);
    }

    #[test]
    fn malformed_frame_keeps_connection_open() {
        let t0 = Instant::now();
        let (mut manager, channel) = open_manager("room", t0);

        assert!(manager.handle_frame(channel, "{not json").is_empty());
        assert!(manager.handle_frame(channel, r#"{"type":"reaction"}"#).is_empty());
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[test]
    fn transmit_failure_requeues_unsent_in_order() {
        let t0 = Instant::now();
        let mut manager = ConnectionManager::new(ConnectionConfig::default());
        let channel = dialed(&manager.open("room".into(), t0));
        for n in 1..=3 {
            manager.send(msg(n, "room")).unwrap();
        }
        manager.handle_opened(channel, t0);

        // First message went out, the rest failed
        let unsent = vec![msg(2, "room"), msg(3, "room")];
        let actions = manager.handle_transmit_failed(channel, unsent, "broken pipe", t0);
        assert!(matches!(&actions[..], [ConnectionAction::Hangup { channel: c, .. }] if *c == channel));
        assert_eq!(manager.state(), ConnectionState::Closed { will_retry: true });
        manager.send(msg(4, "room")).unwrap();

        let retry = dialed(&manager.tick(t0 + Duration::from_secs(3)));
        let actions = manager.handle_opened(retry, t0 + Duration::from_secs(3));
        assert_eq!(transmitted(&actions), vec![2, 3, 4]);
    }
}
