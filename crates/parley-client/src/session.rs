//! Room session.
//!
//! [`RoomSession`] is what a chat screen talks to. It composes the delivery
//! state machines for the room the user is looking at:
//!
//! - one [`ConnectionManager`] for the live channel
//! - one [`InboundReconciler`] holding the displayed message list
//! - one [`NotificationQueue`] for status notices
//! - the table of durable writes still in flight
//!
//! Like the core components it performs no I/O. Callers feed it
//! [`SessionEvent`]s and user commands and execute the returned
//! [`SessionAction`]s.

use std::collections::HashMap;

use parley_core::{
    ChannelId, ConnectionAction, ConnectionConfig, ConnectionError, ConnectionManager,
    ConnectionState, Environment, InboundReconciler, LocalId, Message, NotificationConfig,
    NotificationQueue, PendingMessage, Toast, ToastId, ToastKind,
};
use parley_proto::{InboundEvent, MessageError, Metadata, RoomId, StoredMessage, UserId};

/// Notice raised when an open channel drops.
pub const CONNECTION_LOST_NOTICE: &str = "Connection lost, reconnecting";

/// Notice raised when a dropped channel is back.
pub const RECONNECTED_NOTICE: &str = "Reconnected";

/// The signed-in user, as supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    /// Server user id.
    pub user_id: UserId,
    /// Name shown next to the user's messages.
    pub display_name: String,
}

/// Session tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Live channel behaviour.
    pub connection: ConnectionConfig,
    /// Notice limits.
    pub notifications: NotificationConfig,
}

/// Something that happened outside the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent<I> {
    /// A dialed channel finished its handshake.
    ChannelOpened {
        /// Channel generation from the `Dial` action.
        channel: ChannelId,
    },
    /// A channel closed unexpectedly, or the dial failed.
    ChannelClosed {
        /// Channel generation.
        channel: ChannelId,
        /// Close reason or transport error.
        reason: String,
    },
    /// A text frame arrived on a channel.
    FrameReceived {
        /// Channel generation.
        channel: ChannelId,
        /// Raw frame text.
        text: String,
    },
    /// Some transmits of one flush did not reach the wire.
    TransmitFailed {
        /// Channel generation.
        channel: ChannelId,
        /// Messages not sent, in send order.
        unsent: Vec<PendingMessage>,
        /// Transport error.
        reason: String,
    },
    /// A durable write returned the stored record.
    DurableWriteCompleted {
        /// Room the write was issued for.
        room_id: RoomId,
        /// Correlation id of the written message.
        local_id: LocalId,
        /// Authoritative record.
        message: StoredMessage,
    },
    /// A durable write failed.
    DurableWriteFailed {
        /// Room the write was issued for.
        room_id: RoomId,
        /// Correlation id of the written message.
        local_id: LocalId,
        /// Error text.
        reason: String,
    },
    /// The history page requested on room entry arrived.
    HistoryLoaded {
        /// Room the page belongs to.
        room_id: RoomId,
        /// Stored messages, oldest first.
        messages: Vec<StoredMessage>,
    },
    /// The history request failed.
    HistoryFailed {
        /// Room the request was issued for.
        room_id: RoomId,
        /// Error text.
        reason: String,
    },
    /// Time passed.
    Tick {
        /// Current time.
        now: I,
    },
}

/// Something the driver must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Open a live channel for a room.
    Dial {
        /// Channel generation to tag the connection's events with.
        channel: ChannelId,
        /// Room to connect to.
        room_id: RoomId,
    },
    /// Send one frame on an open channel.
    Transmit {
        /// Channel generation.
        channel: ChannelId,
        /// Encoded envelope.
        frame: String,
        /// The message carried, handed back if the send fails.
        message: PendingMessage,
    },
    /// Close a channel. No close event is expected back.
    Hangup {
        /// Channel generation.
        channel: ChannelId,
        /// Reason for logs.
        reason: String,
    },
    /// Persist a message through the message API.
    PostMessage {
        /// Target room.
        room_id: RoomId,
        /// Correlation id, echoed in the completion event.
        local_id: LocalId,
        /// Message body.
        content: String,
    },
    /// Load recent history through the message API.
    FetchHistory {
        /// Room to load.
        room_id: RoomId,
    },
    /// Typing, receipt or presence activity for the embedder to show.
    RoomActivity {
        /// Room the activity belongs to.
        room_id: RoomId,
        /// The event.
        event: InboundEvent,
    },
    /// Visible state changed.
    Render,
}

/// A user intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch to a room.
    EnterRoom(RoomId),
    /// Leave the active room.
    LeaveRoom,
    /// Compose and send a message.
    Submit {
        /// Message body.
        content: String,
        /// Extra envelope metadata.
        metadata: Option<Metadata>,
    },
    /// Re-issue a failed durable write.
    Retry(LocalId),
    /// Raise a notice.
    Notify {
        /// Severity.
        kind: ToastKind,
        /// Text.
        text: String,
    },
    /// Dismiss a notice.
    Dismiss(ToastId),
    /// Shut down and stop.
    Quit,
}

/// Errors returned to the caller of a session command.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// No room has been entered.
    #[error("no active room")]
    NoActiveRoom,

    /// Composed content was rejected.
    #[error(transparent)]
    InvalidMessage(#[from] MessageError),

    /// The message is unknown or its durable write has not failed.
    #[error("message {0} has no failed write to retry")]
    NotRetryable(LocalId),

    /// The live channel refused the message.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Borrowed view of everything a frontend renders.
#[derive(Debug)]
pub struct SessionView<'a, I> {
    /// Active room.
    pub room_id: Option<&'a RoomId>,
    /// Live channel state.
    pub connection: ConnectionState,
    /// Displayed messages in order.
    pub messages: &'a [Message],
    /// Visible notices, oldest first.
    pub notices: &'a [Toast<I>],
    /// Messages waiting for the channel to open.
    pub pending_outbound: usize,
}

/// The UI-level session for the active room.
pub struct RoomSession<E: Environment> {
    env: E,
    user: LocalUser,
    connection: ConnectionManager<E::Instant>,
    room: Option<InboundReconciler>,
    notices: NotificationQueue<E::Instant>,
    in_flight: HashMap<LocalId, PendingMessage>,
    /// An open channel dropped and has not come back yet.
    lost: bool,
}

impl<E: Environment> RoomSession<E> {
    /// Session with no active room.
    ///
    /// The reconnect jitter generator is seeded from the environment.
    pub fn new(env: E, user: LocalUser, config: SessionConfig) -> Self {
        let connection = ConnectionManager::with_seed(config.connection, env.random_u64());
        Self {
            env,
            user,
            connection,
            room: None,
            notices: NotificationQueue::new(config.notifications),
            in_flight: HashMap::new(),
            lost: false,
        }
    }

    /// Signed-in user.
    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    /// Active room.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.room.as_ref().map(InboundReconciler::room_id)
    }

    /// Live channel state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Displayed messages of the active room.
    pub fn messages(&self) -> &[Message] {
        self.room.as_ref().map_or(&[], InboundReconciler::messages)
    }

    /// Reconciler of the active room.
    pub fn reconciler(&self) -> Option<&InboundReconciler> {
        self.room.as_ref()
    }

    /// Visible notices.
    pub fn notices(&self) -> &[Toast<E::Instant>] {
        self.notices.visible()
    }

    /// Durable writes issued and not yet confirmed, including failed ones.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Earliest instant at which [`SessionEvent::Tick`] has work to do.
    pub fn next_deadline(&self) -> Option<E::Instant> {
        match (self.connection.next_deadline(), self.notices.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Render view.
    pub fn view(&self) -> SessionView<'_, E::Instant> {
        SessionView {
            room_id: self.room_id(),
            connection: self.connection.state(),
            messages: self.messages(),
            notices: self.notices.visible(),
            pending_outbound: self.connection.pending_outbound(),
        }
    }

    /// Make `room_id` the active room.
    ///
    /// Entering the room that is already active is a no-op. Otherwise the
    /// previous room's channel, queue and message list are dropped and the
    /// new room's history is requested.
    pub fn enter_room(&mut self, room_id: RoomId) -> Vec<SessionAction> {
        if self.room_id() == Some(&room_id) && self.connection.state().is_live() {
            return Vec::new();
        }

        tracing::info!(%room_id, "entering room");

        self.in_flight.clear();
        self.lost = false;
        self.room = Some(InboundReconciler::new(room_id.clone(), self.user.user_id.clone()));

        let now = self.env.now();
        let opened = self.connection.open(room_id.clone(), now);
        let mut actions = self.absorb(opened);
        actions.push(SessionAction::FetchHistory { room_id });
        actions.push(SessionAction::Render);
        actions
    }

    /// Leave the active room without entering another.
    pub fn leave_room(&mut self) -> Vec<SessionAction> {
        let Some(room) = self.room.take() else {
            return Vec::new();
        };

        tracing::info!(room_id = %room.room_id(), "leaving room");

        self.in_flight.clear();
        self.lost = false;
        let closed = self.connection.close("left room");
        let mut actions = self.absorb(closed);
        actions.push(SessionAction::Render);
        actions
    }

    /// Tear everything down, notices included.
    pub fn shutdown(&mut self) -> Vec<SessionAction> {
        let mut actions = self.leave_room();
        self.notices.clear();
        if actions.is_empty() {
            actions.push(SessionAction::Render);
        }
        actions
    }

    /// Compose and send a message in the active room.
    ///
    /// The message is shown at once as pending, handed to the live channel
    /// and written durably in parallel.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoActiveRoom`] before [`Self::enter_room`]
    /// - [`SessionError::InvalidMessage`] for blank or oversized content
    /// - [`SessionError::Connection`] if the channel refuses the message
    pub fn submit(
        &mut self,
        content: String,
        metadata: Option<Metadata>,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let room_id = self.room_id().cloned().ok_or(SessionError::NoActiveRoom)?;

        let mut metadata = metadata.unwrap_or_default();
        if metadata.user_name.is_none() {
            metadata.user_name = Some(self.user.display_name.clone());
        }

        let pending = PendingMessage::new(
            LocalId::new(self.env.random_u128()),
            room_id.clone(),
            self.user.user_id.clone(),
            content,
            Some(metadata),
            self.env.utc_now(),
        )?;
        let local_id = pending.local_id();

        let sent = self.connection.send(pending.clone())?;

        if let Some(room) = self.room.as_mut() {
            room.submit_local(&pending, &self.user.display_name);
        }

        tracing::debug!(%room_id, %local_id, "message submitted");

        let mut actions = self.absorb(sent);
        actions.push(SessionAction::PostMessage {
            room_id,
            local_id,
            content: pending.content().to_owned(),
        });
        actions.push(SessionAction::Render);
        self.in_flight.insert(local_id, pending);
        Ok(actions)
    }

    /// Re-issue the durable write of a message whose write failed.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoActiveRoom`] before [`Self::enter_room`]
    /// - [`SessionError::NotRetryable`] if the message has no failed write
    pub fn retry(&mut self, local_id: LocalId) -> Result<Vec<SessionAction>, SessionError> {
        let room = self.room.as_mut().ok_or(SessionError::NoActiveRoom)?;

        let pending = self.in_flight.get(&local_id).ok_or(SessionError::NotRetryable(local_id))?;
        if !room.clear_failed(local_id) {
            return Err(SessionError::NotRetryable(local_id));
        }

        tracing::debug!(%local_id, "retrying durable write");

        Ok(vec![
            SessionAction::PostMessage {
                room_id: pending.room_id().clone(),
                local_id,
                content: pending.content().to_owned(),
            },
            SessionAction::Render,
        ])
    }

    /// Raise a notice.
    pub fn notify(&mut self, kind: ToastKind, text: impl Into<String>) -> Vec<SessionAction> {
        self.notices.notify(kind, text, self.env.now());
        vec![SessionAction::Render]
    }

    /// Dismiss a notice.
    pub fn dismiss(&mut self, id: ToastId) -> Vec<SessionAction> {
        if self.notices.dismiss(id, self.env.now()) {
            vec![SessionAction::Render]
        } else {
            Vec::new()
        }
    }

    /// Process an external event.
    pub fn handle(&mut self, event: SessionEvent<E::Instant>) -> Vec<SessionAction> {
        match event {
            SessionEvent::ChannelOpened { channel } => {
                let opened = self.connection.handle_opened(channel, self.env.now());
                let mut actions = self.absorb(opened);
                if self.lost && self.connection.state() == ConnectionState::Open {
                    self.lost = false;
                    self.notices.notify(ToastKind::Success, RECONNECTED_NOTICE, self.env.now());
                }
                actions.push(SessionAction::Render);
                actions
            },
            SessionEvent::ChannelClosed { channel, reason } => {
                let before = self.connection.state();
                let closed = self.connection.handle_closed(channel, &reason, self.env.now());
                self.after_drop(before, closed)
            },
            SessionEvent::TransmitFailed { channel, unsent, reason } => {
                let before = self.connection.state();
                let failed = self.connection.handle_transmit_failed(
                    channel,
                    unsent,
                    &reason,
                    self.env.now(),
                );
                self.after_drop(before, failed)
            },
            SessionEvent::FrameReceived { channel, text } => {
                let delivered = self.connection.handle_frame(channel, &text);
                self.absorb(delivered)
            },
            SessionEvent::DurableWriteCompleted { room_id, local_id, message } => {
                self.durable_completed(&room_id, local_id, &message)
            },
            SessionEvent::DurableWriteFailed { room_id, local_id, reason } => {
                self.durable_failed(&room_id, local_id, &reason)
            },
            SessionEvent::HistoryLoaded { room_id, messages } => {
                let Some(room) = self.active_room_mut(&room_id) else {
                    return Vec::new();
                };
                let added = room.apply_history(&messages);
                tracing::debug!(%room_id, fetched = messages.len(), added, "history merged");
                vec![SessionAction::Render]
            },
            SessionEvent::HistoryFailed { room_id, reason } => {
                if self.active_room_mut(&room_id).is_none() {
                    return Vec::new();
                }
                tracing::warn!(%room_id, %reason, "history request failed");
                self.notify(ToastKind::Error, format!("Could not load messages: {reason}"))
            },
            SessionEvent::Tick { now } => {
                let due = self.connection.tick(now);
                let mut actions = self.absorb(due);
                if !self.notices.tick(now).is_empty() && !actions.contains(&SessionAction::Render)
                {
                    actions.push(SessionAction::Render);
                }
                actions
            },
        }
    }

    fn after_drop(
        &mut self,
        before: ConnectionState,
        actions: Vec<ConnectionAction>,
    ) -> Vec<SessionAction> {
        let mut actions = self.absorb(actions);
        let after = self.connection.state();
        if before == ConnectionState::Open && after == (ConnectionState::Closed { will_retry: true })
        {
            self.lost = true;
            self.notices.notify(ToastKind::Warning, CONNECTION_LOST_NOTICE, self.env.now());
        }
        if before != after {
            actions.push(SessionAction::Render);
        }
        actions
    }

    fn durable_completed(
        &mut self,
        room_id: &RoomId,
        local_id: LocalId,
        stored: &StoredMessage,
    ) -> Vec<SessionAction> {
        if self.active_room_mut(room_id).is_none() {
            tracing::debug!(%room_id, %local_id, "durable ack for inactive room ignored");
            return Vec::new();
        }

        self.in_flight.remove(&local_id);

        let Some(room) = self.room.as_mut() else {
            return Vec::new();
        };
        if room.apply_durable(Some(local_id), stored).changed() {
            vec![SessionAction::Render]
        } else {
            Vec::new()
        }
    }

    fn durable_failed(
        &mut self,
        room_id: &RoomId,
        local_id: LocalId,
        reason: &str,
    ) -> Vec<SessionAction> {
        let Some(room) = self.active_room_mut(room_id) else {
            return Vec::new();
        };
        if !room.mark_failed(local_id) {
            return Vec::new();
        }

        tracing::warn!(%room_id, %local_id, %reason, "durable write failed");
        self.notify(ToastKind::Error, format!("Message not saved: {reason}"))
    }

    fn active_room_mut(&mut self, room_id: &RoomId) -> Option<&mut InboundReconciler> {
        self.room.as_mut().filter(|room| room.room_id() == room_id)
    }

    /// Turn connection actions into session actions, routing delivered
    /// events.
    fn absorb(&mut self, actions: Vec<ConnectionAction>) -> Vec<SessionAction> {
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                ConnectionAction::Dial { channel, room_id } => {
                    out.push(SessionAction::Dial { channel, room_id });
                },
                ConnectionAction::Transmit { channel, message } => {
                    match message.to_envelope().encode() {
                        Ok(frame) => out.push(SessionAction::Transmit { channel, frame, message }),
                        Err(e) => {
                            tracing::error!(local_id = %message.local_id(), "dropping unencodable message: {e}");
                        },
                    }
                },
                ConnectionAction::Hangup { channel, reason } => {
                    out.push(SessionAction::Hangup { channel, reason });
                },
                ConnectionAction::Deliver { room_id, event } => {
                    out.extend(self.deliver(room_id, event));
                },
            }
        }
        out
    }

    fn deliver(&mut self, room_id: RoomId, event: InboundEvent) -> Vec<SessionAction> {
        match event {
            InboundEvent::Message(live) => {
                let Some(room) = self.room.as_mut() else {
                    return Vec::new();
                };
                if room.apply_live(&live).changed() {
                    vec![SessionAction::Render]
                } else {
                    Vec::new()
                }
            },
            InboundEvent::Error { message } => {
                tracing::warn!(%room_id, %message, "server reported an error");
                self.notify(ToastKind::Error, message)
            },
            event @ (InboundEvent::Typing { .. }
            | InboundEvent::ReadReceipt { .. }
            | InboundEvent::PresenceJoin { .. }
            | InboundEvent::PresenceLeave { .. }) => {
                vec![SessionAction::RoomActivity { room_id, event }]
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::{Duration, Instant},
    };

    use chrono::{DateTime, Utc};
    use parley_core::MessageOrigin;
    use parley_proto::MessageId;

    use super::*;

    #[derive(Clone)]
    struct TestEnv {
        start: Instant,
        offset_ms: Arc<AtomicU64>,
        counter: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self {
                start: Instant::now(),
                offset_ms: Arc::new(AtomicU64::new(0)),
                counter: Arc::new(AtomicU64::new(0)),
            }
        }

        fn advance(&self, ms: u64) {
            self.offset_ms.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.start + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
        }

        fn utc_now(&self) -> DateTime<Utc> {
            DateTime::default()
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            // Sequential values, so local ids are predictable
            let bytes = (self.counter.fetch_add(1, Ordering::SeqCst) + 1).to_be_bytes();
            let len = buffer.len().min(bytes.len());
            let start = buffer.len() - len;
            buffer.fill(0);
            buffer[start..].copy_from_slice(&bytes[bytes.len() - len..]);
        }
    }

    fn session() -> (RoomSession<TestEnv>, TestEnv) {
        let env = TestEnv::new();
        let user = LocalUser { user_id: "me".into(), display_name: "Me".into() };
        (RoomSession::new(env.clone(), user, SessionConfig::default()), env)
    }

    fn dialed(actions: &[SessionAction]) -> ChannelId {
        actions
            .iter()
            .find_map(|a| match a {
                SessionAction::Dial { channel, .. } => Some(*channel),
                _ => None,
            })
            .unwrap()
    }

    fn posted(actions: &[SessionAction]) -> LocalId {
        actions
            .iter()
            .find_map(|a| match a {
                SessionAction::PostMessage { local_id, .. } => Some(*local_id),
                _ => None,
            })
            .unwrap()
    }

    fn stored(id: &str, content: &str) -> StoredMessage {
        StoredMessage {
            id: MessageId::new(id),
            room_id: "room".into(),
            user_id: "me".into(),
            content: content.into(),
            created_at: DateTime::default(),
            user_name: None,
        }
    }

    #[test]
    fn enter_room_dials_and_fetches_history() {
        let (mut s, _) = session();
        let actions = s.enter_room("room".into());

        assert!(matches!(actions[0], SessionAction::Dial { .. }));
        assert!(actions.contains(&SessionAction::FetchHistory { room_id: "room".into() }));
        assert_eq!(s.connection_state(), ConnectionState::Connecting);

        // Same room again changes nothing
        assert!(s.enter_room("room".into()).is_empty());
    }

    #[test]
    fn submit_before_entering_fails() {
        let (mut s, _) = session();
        assert_eq!(s.submit("hi".into(), None), Err(SessionError::NoActiveRoom));
    }

    #[test]
    fn blank_submit_is_rejected_without_side_effects() {
        let (mut s, _) = session();
        s.enter_room("room".into());

        let err = s.submit("   ".into(), None).unwrap_err();
        assert_eq!(err, SessionError::InvalidMessage(MessageError::Empty));
        assert!(s.messages().is_empty());
        assert_eq!(s.view().pending_outbound, 0);
    }

    #[test]
    fn submit_while_connecting_queues_and_posts() {
        let (mut s, _) = session();
        let channel = dialed(&s.enter_room("room".into()));

        let actions = s.submit("hello".into(), None).unwrap();
        assert!(!actions.iter().any(|a| matches!(a, SessionAction::Transmit { .. })));
        let local_id = posted(&actions);

        assert_eq!(s.messages().len(), 1);
        assert_eq!(s.messages()[0].origin, MessageOrigin::LocalPending);
        assert_eq!(s.view().pending_outbound, 1);

        // Opening flushes the queued copy with the display name attached
        let actions = s.handle(SessionEvent::ChannelOpened { channel });
        let frame = actions
            .iter()
            .find_map(|a| match a {
                SessionAction::Transmit { frame, message, .. } => {
                    assert_eq!(message.local_id(), local_id);
                    Some(frame.clone())
                },
                _ => None,
            })
            .unwrap();
        assert!(frame.contains("\"userName\":\"Me\""));
    }

    #[test]
    fn durable_ack_keeps_queued_live_copy() {
        let (mut s, _) = session();
        let channel = dialed(&s.enter_room("room".into()));
        let local_id = posted(&s.submit("hello".into(), None).unwrap());

        s.handle(SessionEvent::DurableWriteCompleted {
            room_id: "room".into(),
            local_id,
            message: stored("m1", "hello"),
        });

        assert_eq!(s.in_flight(), 0);
        assert_eq!(s.messages()[0].origin, MessageOrigin::DurableConfirmed);
        assert_eq!(s.view().pending_outbound, 1);

        let actions = s.handle(SessionEvent::ChannelOpened { channel });
        let sent: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Transmit { message, .. } => Some(message.local_id()),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![local_id]);

        let echo = r#"{"type":"message","roomId":"room","userId":"me","content":"hello","timestamp":"1970-01-01T00:00:00Z"}"#;
        s.handle(SessionEvent::FrameReceived { channel, text: echo.into() });
        assert_eq!(s.messages().len(), 1);
    }

    #[test]
    fn own_echo_after_ack_keeps_single_entry() {
        let (mut s, _) = session();
        let channel = dialed(&s.enter_room("room".into()));
        s.handle(SessionEvent::ChannelOpened { channel });
        let local_id = posted(&s.submit("hello".into(), None).unwrap());

        s.handle(SessionEvent::DurableWriteCompleted {
            room_id: "room".into(),
            local_id,
            message: stored("m1", "hello"),
        });
        let echo = r#"{"type":"message","roomId":"room","userId":"me","content":"hello","timestamp":"1970-01-01T00:00:00Z"}"#;
        let actions = s.handle(SessionEvent::FrameReceived { channel, text: echo.into() });

        assert!(actions.is_empty());
        assert_eq!(s.messages().len(), 1);
    }

    #[test]
    fn history_after_live_message_keeps_single_entry() {
        let (mut s, _) = session();
        let channel = dialed(&s.enter_room("room".into()));
        s.handle(SessionEvent::ChannelOpened { channel });

        let frame = r#"{"type":"message","roomId":"room","userId":"bob","content":"early","timestamp":"1970-01-01T00:00:05Z"}"#;
        s.handle(SessionEvent::FrameReceived { channel, text: frame.into() });
        assert_eq!(s.messages().len(), 1);

        let mut early = stored("m9", "early");
        early.user_id = "bob".into();
        s.handle(SessionEvent::HistoryLoaded { room_id: "room".into(), messages: vec![early] });

        assert_eq!(s.messages().len(), 1);
        assert_eq!(s.messages()[0].id, Some(MessageId::new("m9")));
        assert_eq!(s.messages()[0].origin, MessageOrigin::DurableConfirmed);
    }

    #[test]
    fn failed_write_is_marked_and_retried() {
        let (mut s, _) = session();
        s.enter_room("room".into());
        let local_id = posted(&s.submit("hello".into(), None).unwrap());

        s.handle(SessionEvent::DurableWriteFailed {
            room_id: "room".into(),
            local_id,
            reason: "500".into(),
        });
        assert!(s.messages()[0].failed);
        assert_eq!(s.notices().len(), 1);
        assert_eq!(s.notices()[0].kind, ToastKind::Error);

        let actions = s.retry(local_id).unwrap();
        assert_eq!(posted(&actions), local_id);
        assert!(!s.messages()[0].failed);

        // Nothing left to retry until it fails again
        assert_eq!(s.retry(local_id), Err(SessionError::NotRetryable(local_id)));
    }

    #[test]
    fn connection_lost_and_reconnected_notices() {
        let (mut s, env) = session();
        let channel = dialed(&s.enter_room("room".into()));

        // A failed first dial is not a lost connection
        s.handle(SessionEvent::ChannelClosed { channel, reason: "refused".into() });
        assert!(s.notices().is_empty());

        env.advance(3_000);
        let channel = dialed(&s.handle(SessionEvent::Tick { now: env.now() }));
        s.handle(SessionEvent::ChannelOpened { channel });
        assert!(s.notices().is_empty());

        s.handle(SessionEvent::ChannelClosed { channel, reason: "reset".into() });
        assert_eq!(s.notices()[0].text, CONNECTION_LOST_NOTICE);

        env.advance(3_000);
        let channel = dialed(&s.handle(SessionEvent::Tick { now: env.now() }));
        s.handle(SessionEvent::ChannelOpened { channel });
        assert_eq!(s.notices()[1].text, RECONNECTED_NOTICE);
        assert_eq!(s.notices()[1].kind, ToastKind::Success);
    }

    #[test]
    fn activity_and_server_errors_are_routed() {
        let (mut s, _) = session();
        let channel = dialed(&s.enter_room("room".into()));
        s.handle(SessionEvent::ChannelOpened { channel });

        let typing = r#"{"type":"typing","roomId":"room","userId":"bob","timestamp":"1970-01-01T00:00:00Z","metadata":{"isTyping":true}}"#;
        let actions = s.handle(SessionEvent::FrameReceived { channel, text: typing.into() });
        assert!(matches!(
            &actions[..],
            [SessionAction::RoomActivity { event: InboundEvent::Typing { is_typing: true, .. }, .. }]
        ));

        let error = r#"{"type":"error","roomId":"room","userId":"","content":"rate limited","timestamp":"1970-01-01T00:00:00Z"}"#;
        s.handle(SessionEvent::FrameReceived { channel, text: error.into() });
        assert_eq!(s.notices()[0].text, "rate limited");

        // Garbage is dropped and the channel stays open
        assert!(s.handle(SessionEvent::FrameReceived { channel, text: "{".into() }).is_empty());
        assert_eq!(s.connection_state(), ConnectionState::Open);
    }

    #[test]
    fn events_for_previous_room_are_ignored() {
        let (mut s, _) = session();
        s.enter_room("room".into());
        let local_id = posted(&s.submit("for room".into(), None).unwrap());
        s.enter_room("other".into());

        assert!(
            s.handle(SessionEvent::DurableWriteCompleted {
                room_id: "room".into(),
                local_id,
                message: stored("m1", "for room"),
            })
            .is_empty()
        );
        assert!(
            s.handle(SessionEvent::HistoryLoaded {
                room_id: "room".into(),
                messages: vec![stored("m2", "old")],
            })
            .is_empty()
        );
        assert!(s.messages().is_empty());
        assert_eq!(s.view().pending_outbound, 0);
    }

    #[test]
    fn next_deadline_covers_retry_and_notices() {
        let (mut s, env) = session();
        let channel = dialed(&s.enter_room("room".into()));
        assert_eq!(s.next_deadline(), None);

        s.notify(ToastKind::Info, "hi");
        assert_eq!(s.next_deadline(), Some(env.now() + Duration::from_secs(5)));

        s.handle(SessionEvent::ChannelClosed { channel, reason: "refused".into() });
        assert_eq!(s.next_deadline(), Some(env.now() + Duration::from_secs(3)));
    }

    #[test]
    fn shutdown_clears_everything() {
        let (mut s, _) = session();
        let channel = dialed(&s.enter_room("room".into()));
        s.notify(ToastKind::Info, "hi");

        let actions = s.shutdown();
        assert!(actions.contains(&SessionAction::Hangup { channel, reason: "left room".into() }));
        assert!(s.notices().is_empty());
        assert_eq!(s.room_id(), None);
        assert_eq!(s.connection_state(), ConnectionState::Closed { will_retry: false });
    }
}
