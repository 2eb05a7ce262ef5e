//! Simulation driver implementing the Driver trait.
//!
//! `SimDriver` stands in for the WebSocket/HTTP transport. It plays a
//! scripted list of [`Step`]s into the runtime and answers the runtime's
//! I/O with a tiny in-memory server: dials open (or fail, on request),
//! transmitted frames are echoed back the way the real server broadcasts to
//! every member including the sender, and durable writes are stored with
//! sequential ids. Everything it did is recorded as [`Effect`]s.
//!
//! Clones share state, so a test keeps one clone to inspect after handing
//! the other to [`parley_client::Runtime`].

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use parley_client::{Command, Driver, Input, SessionEvent, SessionView};
use parley_core::{ChannelId, ConnectionState, Environment, LocalId, Message, ToastId, ToastKind};
use parley_proto::{InboundEvent, MessageId, RoomId, StoredMessage, UserId};

use crate::sim_env::{SimEnv, SimInstant};

/// Inputs after which a run is cut off, so a livelocked script still ends.
const DEFAULT_INPUT_BUDGET: usize = 10_000;

/// Error type for simulation driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDriverError(pub String);

impl std::fmt::Display for SimDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimDriverError: {}", self.0)
    }
}

impl std::error::Error for SimDriverError {}

/// One scripted step.
#[derive(Debug, Clone)]
pub enum Step {
    /// A user command.
    Command(Command),
    /// A raw session event.
    Event(SessionEvent<SimInstant>),
    /// The server drops the open channel.
    DropChannel,
    /// The server pushes a frame on the open channel.
    ServerFrame(String),
    /// Let virtual time pass.
    Advance(Duration),
}

impl From<Command> for Step {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

/// Something the runtime asked the driver to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// A dial.
    Dial {
        /// Channel generation.
        channel: ChannelId,
        /// Room.
        room_id: RoomId,
    },
    /// A frame that reached the wire.
    Transmit {
        /// Channel generation.
        channel: ChannelId,
        /// Frame text.
        frame: String,
    },
    /// A hangup.
    Hangup {
        /// Channel generation.
        channel: ChannelId,
    },
    /// A durable write.
    Post {
        /// Room.
        room_id: RoomId,
        /// Correlation id.
        local_id: LocalId,
        /// Body.
        content: String,
    },
    /// A history request.
    FetchHistory {
        /// Room.
        room_id: RoomId,
    },
    /// Room activity shown.
    Activity {
        /// Room.
        room_id: RoomId,
        /// Event.
        event: InboundEvent,
    },
}

/// Last rendered state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Active room.
    pub room_id: Option<RoomId>,
    /// Channel state.
    pub connection: ConnectionState,
    /// Message list.
    pub messages: Vec<Message>,
    /// Visible notices.
    pub notices: Vec<(ToastKind, String)>,
    /// Queued outbound messages.
    pub pending_outbound: usize,
}

#[derive(Default)]
struct SharedState {
    script: VecDeque<Step>,
    /// Server answers, delivered before the next scripted step.
    replies: VecDeque<SessionEvent<SimInstant>>,
    effects: Vec<Effect>,
    open: HashSet<ChannelId>,
    latest_open: Option<ChannelId>,
    history: HashMap<RoomId, Vec<StoredMessage>>,
    next_message_id: u64,
    fail_dials: usize,
    fail_transmits: usize,
    fail_writes: usize,
    renders: usize,
    last_render: Option<Rendered>,
    at_quit: Option<Rendered>,
    notices_seen: Vec<(ToastId, ToastKind, String)>,
    inputs_left: usize,
    stopped: bool,
}

/// Simulation driver for deterministic testing.
#[derive(Clone)]
pub struct SimDriver {
    env: SimEnv,
    user_id: UserId,
    echo: bool,
    state: Arc<Mutex<SharedState>>,
}

impl SimDriver {
    /// Driver sharing `env`'s clock. Durable writes are stored as authored
    /// by `user_id`.
    pub fn new(env: SimEnv, user_id: impl Into<UserId>) -> Self {
        let state = SharedState { inputs_left: DEFAULT_INPUT_BUDGET, ..SharedState::default() };
        Self { env, user_id: user_id.into(), echo: true, state: Arc::new(Mutex::new(state)) }
    }

    /// Stop echoing transmitted frames back.
    #[must_use]
    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Append steps to the script.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.lock().script.extend(steps);
    }

    /// Make the next `n` dials fail.
    pub fn fail_dials(&self, n: usize) {
        self.lock().fail_dials = n;
    }

    /// Make the next `n` transmits fail.
    pub fn fail_transmits(&self, n: usize) {
        self.lock().fail_transmits = n;
    }

    /// Make the next `n` durable writes fail.
    pub fn fail_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }

    /// Seed a room's stored history.
    pub fn seed_history(&self, room_id: &RoomId, messages: Vec<StoredMessage>) {
        self.lock().history.entry(room_id.clone()).or_default().extend(messages);
    }

    /// Everything the runtime asked for so far.
    pub fn effects(&self) -> Vec<Effect> {
        self.lock().effects.clone()
    }

    /// Frames that reached the wire, in order.
    pub fn transmitted(&self) -> Vec<String> {
        self.lock()
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Transmit { frame, .. } => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// Messages the server stored for a room.
    pub fn stored(&self, room_id: &RoomId) -> Vec<StoredMessage> {
        self.lock().history.get(room_id).cloned().unwrap_or_default()
    }

    /// Last rendered state.
    pub fn last_render(&self) -> Option<Rendered> {
        self.lock().last_render.clone()
    }

    /// Last state rendered before the script ran out and the runtime was
    /// told to quit. Unlike [`Self::last_render`] this is not affected by
    /// the shutdown that follows.
    pub fn rendered_at_quit(&self) -> Option<Rendered> {
        self.lock().at_quit.clone()
    }

    /// Every notice that was ever rendered, in order of first appearance.
    pub fn notices_seen(&self) -> Vec<(ToastKind, String)> {
        self.lock().notices_seen.iter().map(|(_, kind, text)| (*kind, text.clone())).collect()
    }

    /// Number of renders.
    pub fn renders(&self) -> usize {
        self.lock().renders
    }

    /// True once the runtime stopped the driver.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, deadline: Option<SimInstant>) -> Option<Input<SimInstant>> {
        let mut state = self.lock();

        if state.inputs_left == 0 {
            tracing::warn!("input budget exhausted, quitting");
            state.at_quit = state.last_render.clone();
            return Some(Input::Command(Command::Quit));
        }
        state.inputs_left -= 1;

        if let Some(reply) = state.replies.pop_front() {
            return Some(Input::Event(reply));
        }

        while let Some(step) = state.script.pop_front() {
            match step {
                Step::Command(command) => return Some(Input::Command(command)),
                Step::Event(event) => return Some(Input::Event(event)),
                Step::DropChannel => {
                    let Some(channel) = state.latest_open.take() else { continue };
                    state.open.remove(&channel);
                    let reason = "dropped by server".to_owned();
                    return Some(Input::Event(SessionEvent::ChannelClosed { channel, reason }));
                },
                Step::ServerFrame(text) => {
                    let Some(channel) = state.latest_open else { continue };
                    return Some(Input::Event(SessionEvent::FrameReceived { channel, text }));
                },
                Step::Advance(by) => {
                    drop(state);
                    self.env.advance(by);
                    return None;
                },
            }
        }

        // Script done: let pending timers fire, then stop
        if let Some(at) = deadline {
            drop(state);
            self.env.advance_to(at);
            return None;
        }
        state.at_quit = state.last_render.clone();
        Some(Input::Command(Command::Quit))
    }
}

impl Driver for SimDriver {
    type Error = SimDriverError;
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        self.env.now()
    }

    async fn next_input(
        &mut self,
        deadline: Option<SimInstant>,
    ) -> Result<Option<Input<SimInstant>>, SimDriverError> {
        Ok(self.next_step(deadline))
    }

    fn dial(&mut self, channel: ChannelId, room_id: &RoomId) {
        let mut state = self.lock();
        state.effects.push(Effect::Dial { channel, room_id: room_id.clone() });

        if state.fail_dials > 0 {
            state.fail_dials -= 1;
            let reason = "connection refused".to_owned();
            state.replies.push_back(SessionEvent::ChannelClosed { channel, reason });
            return;
        }

        state.open.insert(channel);
        state.latest_open = Some(channel);
        state.replies.push_back(SessionEvent::ChannelOpened { channel });
    }

    async fn transmit(&mut self, channel: ChannelId, frame: String) -> Result<(), SimDriverError> {
        let mut state = self.lock();

        if !state.open.contains(&channel) {
            return Err(SimDriverError(format!("channel {channel} is not open")));
        }
        if state.fail_transmits > 0 {
            state.fail_transmits -= 1;
            return Err(SimDriverError("broken pipe".to_owned()));
        }

        state.effects.push(Effect::Transmit { channel, frame: frame.clone() });
        if self.echo {
            state.replies.push_back(SessionEvent::FrameReceived { channel, text: frame });
        }
        Ok(())
    }

    fn hangup(&mut self, channel: ChannelId, _reason: &str) {
        let mut state = self.lock();
        state.effects.push(Effect::Hangup { channel });
        state.open.remove(&channel);
        if state.latest_open == Some(channel) {
            state.latest_open = None;
        }
    }

    fn post_message(&mut self, room_id: &RoomId, local_id: LocalId, content: &str) {
        let created_at = self.env.utc_now();
        let mut state = self.lock();
        state.effects.push(Effect::Post {
            room_id: room_id.clone(),
            local_id,
            content: content.to_owned(),
        });

        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            state.replies.push_back(SessionEvent::DurableWriteFailed {
                room_id: room_id.clone(),
                local_id,
                reason: "server returned 500: internal error".to_owned(),
            });
            return;
        }

        state.next_message_id += 1;
        let message = StoredMessage {
            id: MessageId::new(format!("srv-{}", state.next_message_id)),
            room_id: room_id.clone(),
            user_id: self.user_id.clone(),
            content: content.to_owned(),
            created_at,
            user_name: None,
        };
        state.history.entry(room_id.clone()).or_default().push(message.clone());
        state.replies.push_back(SessionEvent::DurableWriteCompleted {
            room_id: room_id.clone(),
            local_id,
            message,
        });
    }

    fn fetch_history(&mut self, room_id: &RoomId) {
        let mut state = self.lock();
        state.effects.push(Effect::FetchHistory { room_id: room_id.clone() });
        let messages = state.history.get(room_id).cloned().unwrap_or_default();
        state.replies.push_back(SessionEvent::HistoryLoaded { room_id: room_id.clone(), messages });
    }

    fn activity(&mut self, room_id: &RoomId, event: &InboundEvent) {
        self.lock()
            .effects
            .push(Effect::Activity { room_id: room_id.clone(), event: event.clone() });
    }

    fn render(&mut self, view: SessionView<'_, SimInstant>) -> Result<(), SimDriverError> {
        let rendered = Rendered {
            room_id: view.room_id.cloned(),
            connection: view.connection,
            messages: view.messages.to_vec(),
            notices: view.notices.iter().map(|t| (t.kind, t.text.clone())).collect(),
            pending_outbound: view.pending_outbound,
        };
        let mut state = self.lock();
        for toast in view.notices {
            if !state.notices_seen.iter().any(|(id, ..)| *id == toast.id) {
                state.notices_seen.push((toast.id, toast.kind, toast.text.clone()));
            }
        }
        state.renders += 1;
        state.last_render = Some(rendered);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.lock();
        state.open.clear();
        state.latest_open = None;
        state.stopped = true;
    }
}
