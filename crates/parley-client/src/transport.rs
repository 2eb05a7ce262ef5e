//! WebSocket live channel and HTTP message API.
//!
//! [`WsDriver`] implements [`Driver`] on tokio. Each dial spawns one task
//! that connects and then forwards text frames; the write half of the socket
//! comes back to the driver so [`Driver::transmit`] can report failures
//! directly. Durable writes and history requests run as their own tasks
//! through [`HttpApi`].
//!
//! Frontends talk to the running driver through a [`DriverHandle`]: commands
//! go in over an `mpsc` channel, every render is published as a
//! [`SessionSnapshot`] on a `watch` channel, and room activity is broadcast.

use std::{collections::HashMap, time::Instant};

use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parley_core::{ChannelId, ConnectionState, LocalId, Message, ToastId, ToastKind};
use parley_proto::{
    ApiErrorBody, HistoryQuery, HistoryResponse, InboundEvent, PostMessageRequest,
    PostMessageResponse, RoomId, StoredMessage,
};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    task::AbortHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};

use crate::{
    config::{ClientConfig, ConfigError, LIVE_PATH},
    driver::{Driver, Input},
    session::{Command, SessionEvent, SessionView},
};

/// Queued commands before [`DriverHandle::send`] waits.
const COMMAND_BUFFER: usize = 64;

/// Room activity events kept for slow subscribers.
const ACTIVITY_BUFFER: usize = 128;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A URL could not be built.
    #[error("invalid url {url:?}: {reason}")]
    Url {
        /// Offending input.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The bearer token is not a valid header value.
    #[error("auth token is not a valid header value")]
    InvalidToken,

    /// Live channel failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    /// Message API request failed before a response arrived.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Message API answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Server's error text.
        message: String,
    },

    /// Transmit on a channel that is not open.
    #[error("channel {0} is not open")]
    NotOpen(ChannelId),

    /// The driver is gone.
    #[error("driver stopped")]
    Stopped,
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Message API client.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    history_limit: u32,
}

impl HttpApi {
    /// Client for the configured API base.
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base: parse_url(&config.api_base)?,
            token: config.auth_token.clone(),
            history_limit: config.history_limit,
        })
    }

    /// `{api}/messages/{roomId}`.
    pub fn messages_url(&self, room_id: &RoomId) -> Result<Url, TransportError> {
        with_segments(&self.base, &["messages", room_id.as_str()])
    }

    /// Persist a message and return the stored record.
    pub async fn post_message(
        &self,
        room_id: &RoomId,
        content: &str,
    ) -> Result<StoredMessage, TransportError> {
        let request = self
            .client
            .post(self.messages_url(room_id)?)
            .json(&PostMessageRequest { content: content.to_owned() });
        let body: PostMessageResponse = read(self.authorize(request).send().await?).await?;
        Ok(body.content)
    }

    /// Recent history, oldest first.
    pub async fn fetch_history(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<StoredMessage>, TransportError> {
        let query = HistoryQuery { limit: self.history_limit, before: None };
        let request = self.client.get(self.messages_url(room_id)?).query(&query);
        let body: HistoryResponse = read(self.authorize(request).send().await?).await?;
        Ok(body.into_messages())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status, &body))
}

/// Map a non-success response to [`TransportError::Api`], preferring the
/// server's own error text.
fn api_error(status: StatusCode, body: &str) -> TransportError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.describe().map(str::to_owned))
        .or_else(|| status.canonical_reason().map(str::to_owned))
        .unwrap_or_else(|| "request failed".to_owned());
    TransportError::Api { status: status.as_u16(), message }
}

fn parse_url(raw: &str) -> Result<Url, TransportError> {
    Url::parse(raw).map_err(|e| TransportError::Url { url: raw.to_owned(), reason: e.to_string() })
}

/// Append path segments, percent-encoding each.
fn with_segments(base: &Url, segments: &[&str]) -> Result<Url, TransportError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| TransportError::Url {
            url: base.to_string(),
            reason: "cannot be a base".to_owned(),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Live channel URL of a room: `{ws}/api/ws/{roomId}`.
pub fn live_url(config: &ClientConfig, room_id: &RoomId) -> Result<Url, TransportError> {
    let base = parse_url(&config.ws_base)?;
    let mut segments: Vec<&str> = LIVE_PATH.split('/').collect();
    segments.push(room_id.as_str());
    with_segments(&base, &segments)
}

/// A notice as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Id for dismissal.
    pub id: ToastId,
    /// Severity.
    pub kind: ToastKind,
    /// Text.
    pub text: String,
}

/// Owned copy of the last rendered session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Active room.
    pub room_id: Option<RoomId>,
    /// Live channel state.
    pub connection: ConnectionState,
    /// Displayed messages in order.
    pub messages: Vec<Message>,
    /// Visible notices.
    pub notices: Vec<Notice>,
    /// Messages waiting for the channel to open.
    pub pending_outbound: usize,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            room_id: None,
            connection: ConnectionState::Idle,
            messages: Vec::new(),
            notices: Vec::new(),
            pending_outbound: 0,
        }
    }
}

impl<I> From<SessionView<'_, I>> for SessionSnapshot {
    fn from(view: SessionView<'_, I>) -> Self {
        Self {
            room_id: view.room_id.cloned(),
            connection: view.connection,
            messages: view.messages.to_vec(),
            notices: view
                .notices
                .iter()
                .map(|t| Notice { id: t.id, kind: t.kind, text: t.text.clone() })
                .collect(),
            pending_outbound: view.pending_outbound,
        }
    }
}

/// Typing, receipt or presence activity in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomActivity {
    /// Room.
    pub room_id: RoomId,
    /// Event.
    pub event: InboundEvent,
}

/// Frontend side of a running [`WsDriver`].
#[derive(Debug, Clone)]
pub struct DriverHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    activity: broadcast::Sender<RoomActivity>,
}

impl DriverHandle {
    /// Queue a command for the runtime.
    pub async fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands.send(command).await.map_err(|_| TransportError::Stopped)
    }

    /// Receiver of rendered state.
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Subscribe to room activity.
    pub fn activity(&self) -> broadcast::Receiver<RoomActivity> {
        self.activity.subscribe()
    }
}

/// What channel and HTTP tasks report back.
enum Inbox {
    Opened { channel: ChannelId, sink: WsSink },
    Event(SessionEvent<Instant>),
}

struct Channel {
    sink: Option<WsSink>,
    task: AbortHandle,
}

/// Production driver over tokio.
pub struct WsDriver {
    config: ClientConfig,
    api: HttpApi,
    inbox_tx: mpsc::UnboundedSender<Inbox>,
    inbox_rx: mpsc::UnboundedReceiver<Inbox>,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<SessionSnapshot>,
    activity: broadcast::Sender<RoomActivity>,
    channels: HashMap<ChannelId, Channel>,
}

impl WsDriver {
    /// Driver and the handle to control it with.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<(Self, DriverHandle), TransportError> {
        config.validate()?;
        let api = HttpApi::new(&config)?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (snapshots, snapshots_rx) = watch::channel(SessionSnapshot::default());
        let (activity, _) = broadcast::channel(ACTIVITY_BUFFER);

        let handle =
            DriverHandle { commands: commands_tx, snapshots: snapshots_rx, activity: activity.clone() };
        let driver = Self {
            config,
            api,
            inbox_tx,
            inbox_rx,
            commands,
            snapshots,
            activity,
            channels: HashMap::new(),
        };
        Ok((driver, handle))
    }

    fn request(&self, room_id: &RoomId) -> Result<Request, TransportError> {
        let mut request = live_url(&self.config, room_id)?.as_str().into_client_request()?;
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::InvalidToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    fn report(&self, event: SessionEvent<Instant>) {
        if self.inbox_tx.send(Inbox::Event(event)).is_err() {
            tracing::debug!("driver inbox closed");
        }
    }
}

impl Driver for WsDriver {
    type Error = TransportError;
    type Instant = Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn next_input(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<Input<Instant>>, TransportError> {
        enum Woke {
            Inbox(Option<Inbox>),
            Command(Option<Command>),
            Deadline,
        }

        loop {
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            let woke = tokio::select! {
                inbox = self.inbox_rx.recv() => Woke::Inbox(inbox),
                command = self.commands.recv() => Woke::Command(command),
                () = timer => Woke::Deadline,
            };

            match woke {
                Woke::Inbox(Some(Inbox::Event(event))) => {
                    if let SessionEvent::ChannelClosed { channel, .. } = &event {
                        self.channels.remove(channel);
                    }
                    return Ok(Some(Input::Event(event)));
                },
                Woke::Inbox(Some(Inbox::Opened { channel, sink })) => {
                    // Hung up while the handshake was in flight
                    let Some(entry) = self.channels.get_mut(&channel) else {
                        continue;
                    };
                    entry.sink = Some(sink);
                    return Ok(Some(Input::Event(SessionEvent::ChannelOpened { channel })));
                },
                Woke::Inbox(None) => return Err(TransportError::Stopped),
                Woke::Command(Some(command)) => return Ok(Some(Input::Command(command))),
                // Every handle dropped: nobody can steer the session any more
                Woke::Command(None) => return Ok(Some(Input::Command(Command::Quit))),
                Woke::Deadline => return Ok(None),
            }
        }
    }

    fn dial(&mut self, channel: ChannelId, room_id: &RoomId) {
        let request = match self.request(room_id) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(%channel, %room_id, "cannot build live channel request: {e}");
                self.report(SessionEvent::ChannelClosed { channel, reason: e.to_string() });
                return;
            },
        };

        tracing::debug!(%channel, %room_id, url = %request.uri(), "dialing live channel");
        let task = tokio::spawn(run_channel(channel, request, self.inbox_tx.clone()));
        self.channels.insert(channel, Channel { sink: None, task: task.abort_handle() });
    }

    async fn transmit(&mut self, channel: ChannelId, frame: String) -> Result<(), TransportError> {
        let sink = self
            .channels
            .get_mut(&channel)
            .and_then(|c| c.sink.as_mut())
            .ok_or(TransportError::NotOpen(channel))?;
        sink.send(tungstenite::Message::Text(frame.into())).await?;
        Ok(())
    }

    fn hangup(&mut self, channel: ChannelId, reason: &str) {
        let Some(entry) = self.channels.remove(&channel) else {
            return;
        };
        tracing::debug!(%channel, reason, "hanging up live channel");
        close_channel(entry);
    }

    fn post_message(&mut self, room_id: &RoomId, local_id: LocalId, content: &str) {
        let api = self.api.clone();
        let tx = self.inbox_tx.clone();
        let room_id = room_id.clone();
        let content = content.to_owned();

        tokio::spawn(async move {
            let event = match api.post_message(&room_id, &content).await {
                Ok(message) => SessionEvent::DurableWriteCompleted { room_id, local_id, message },
                Err(e) => SessionEvent::DurableWriteFailed { room_id, local_id, reason: e.to_string() },
            };
            let _ = tx.send(Inbox::Event(event));
        });
    }

    fn fetch_history(&mut self, room_id: &RoomId) {
        let api = self.api.clone();
        let tx = self.inbox_tx.clone();
        let room_id = room_id.clone();

        tokio::spawn(async move {
            let event = match api.fetch_history(&room_id).await {
                Ok(messages) => SessionEvent::HistoryLoaded { room_id, messages },
                Err(e) => SessionEvent::HistoryFailed { room_id, reason: e.to_string() },
            };
            let _ = tx.send(Inbox::Event(event));
        });
    }

    fn activity(&mut self, room_id: &RoomId, event: &InboundEvent) {
        // No subscribers is fine
        let _ = self.activity.send(RoomActivity { room_id: room_id.clone(), event: event.clone() });
    }

    fn render(&mut self, view: SessionView<'_, Instant>) -> Result<(), TransportError> {
        self.snapshots.send_replace(SessionSnapshot::from(view));
        Ok(())
    }

    fn stop(&mut self) {
        for (_, entry) in self.channels.drain() {
            close_channel(entry);
        }
    }
}

fn close_channel(entry: Channel) {
    entry.task.abort();
    if let Some(mut sink) = entry.sink {
        tokio::spawn(async move {
            if let Err(e) = sink.close().await {
                tracing::trace!("close after hangup: {e}");
            }
        });
    }
}

/// Connect, hand the write half back, then forward frames until the socket
/// ends.
async fn run_channel(channel: ChannelId, request: Request, inbox: mpsc::UnboundedSender<Inbox>) {
    let stream = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let _ = inbox.send(Inbox::Event(SessionEvent::ChannelClosed {
                channel,
                reason: e.to_string(),
            }));
            return;
        },
    };

    let (sink, read) = stream.split();
    if inbox.send(Inbox::Opened { channel, sink }).is_err() {
        return;
    }

    let reason = forward_frames(channel, read, &inbox).await;
    let _ = inbox.send(Inbox::Event(SessionEvent::ChannelClosed { channel, reason }));
}

async fn forward_frames(
    channel: ChannelId,
    mut read: SplitStream<WsStream>,
    inbox: &mpsc::UnboundedSender<Inbox>,
) -> String {
    loop {
        match read.next().await {
            Some(Ok(tungstenite::Message::Text(text))) => {
                let event = SessionEvent::FrameReceived { channel, text: text.as_str().to_owned() };
                if inbox.send(Inbox::Event(event)).is_err() {
                    return "driver stopped".to_owned();
                }
            },
            Some(Ok(tungstenite::Message::Close(frame))) => {
                return frame.map_or_else(
                    || "closed by server".to_owned(),
                    |f| format!("closed by server: {} {}", f.code, f.reason.as_str()),
                );
            },
            Some(Ok(_)) => {},
            Some(Err(e)) => return e.to_string(),
            None => return "stream ended".to_owned(),
        }
    }
}
