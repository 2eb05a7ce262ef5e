//! Generic runtime for session orchestration.
//!
//! The Runtime drives the client event loop, coordinating between:
//! - [`RoomSession`]: delivery state for the active room
//! - [`Driver`]: platform-specific I/O

use parley_core::{ChannelId, Environment, PendingMessage, ToastKind};

use crate::{
    driver::{Driver, Input},
    session::{Command, RoomSession, SessionAction, SessionEvent},
};

/// Generic runtime that orchestrates a [`RoomSession`] and a [`Driver`].
///
/// # Type Parameters
///
/// - `D`: Platform-specific I/O driver
/// - `E`: Environment for time and randomness
pub struct Runtime<D, E>
where
    D: Driver,
    E: Environment,
{
    driver: D,
    session: RoomSession<E>,
}

/// Transmits of one batch that did not make it, per channel.
struct Unsent {
    channel: ChannelId,
    messages: Vec<PendingMessage>,
    reason: String,
}

impl<D, E> Runtime<D, E>
where
    D: Driver<Instant = E::Instant>,
    E: Environment,
{
    /// Create a runtime around a session.
    pub fn new(driver: D, session: RoomSession<E>) -> Self {
        Self { driver, session }
    }

    /// Run the main event loop until [`Command::Quit`], then shut the
    /// session down and hand it back.
    ///
    /// Each cycle waits for one input, feeds it to the session and executes
    /// the resulting actions. Timers are served between inputs so a busy
    /// channel cannot starve reconnects or notice expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails to deliver input or render.
    pub async fn run(mut self) -> Result<RoomSession<E>, D::Error> {
        self.driver.render(self.session.view())?;

        loop {
            let deadline = self.session.next_deadline();
            let actions = match self.driver.next_input(deadline).await? {
                Some(Input::Command(Command::Quit)) => break,
                Some(Input::Command(command)) => self.apply(command),
                Some(Input::Event(event)) => self.session.handle(event),
                None => Vec::new(),
            };
            self.process_actions(actions).await?;
            self.tick_if_due().await?;
        }

        tracing::info!("runtime stopping");
        let actions = self.session.shutdown();
        self.process_actions(actions).await?;
        self.driver.stop();
        Ok(self.session)
    }

    /// Session being driven.
    pub fn session(&self) -> &RoomSession<E> {
        &self.session
    }

    /// Driver in use.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Apply one command. Rejections become error notices.
    fn apply(&mut self, command: Command) -> Vec<SessionAction> {
        let result = match command {
            Command::EnterRoom(room_id) => Ok(self.session.enter_room(room_id)),
            Command::LeaveRoom => Ok(self.session.leave_room()),
            Command::Submit { content, metadata } => self.session.submit(content, metadata),
            Command::Retry(local_id) => self.session.retry(local_id),
            Command::Notify { kind, text } => Ok(self.session.notify(kind, text)),
            Command::Dismiss(id) => Ok(self.session.dismiss(id)),
            Command::Quit => Ok(Vec::new()),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!("command rejected: {e}");
            self.session.notify(ToastKind::Error, e.to_string())
        })
    }

    async fn tick_if_due(&mut self) -> Result<(), D::Error> {
        let now = self.driver.now();
        if self.session.next_deadline().is_some_and(|at| at <= now) {
            let actions = self.session.handle(SessionEvent::Tick { now });
            self.process_actions(actions).await?;
        }
        Ok(())
    }

    /// Execute session actions in order.
    ///
    /// Renders are coalesced to one per batch. Transmit failures are
    /// collected per channel; once a channel failed, its later transmits in
    /// the batch are not attempted and go back with the failed one.
    async fn process_actions(&mut self, initial_actions: Vec<SessionAction>) -> Result<(), D::Error> {
        let mut pending_actions = initial_actions;

        while !pending_actions.is_empty() {
            let actions = std::mem::take(&mut pending_actions);
            let mut unsent: Vec<Unsent> = Vec::new();
            let mut render = false;

            for action in actions {
                match action {
                    SessionAction::Dial { channel, room_id } => self.driver.dial(channel, &room_id),
                    SessionAction::Transmit { channel, frame, message } => {
                        if let Some(failed) = unsent.iter_mut().find(|u| u.channel == channel) {
                            failed.messages.push(message);
                            continue;
                        }
                        if let Err(e) = self.driver.transmit(channel, frame).await {
                            tracing::warn!(%channel, local_id = %message.local_id(), "transmit failed: {e}");
                            unsent.push(Unsent {
                                channel,
                                messages: vec![message],
                                reason: e.to_string(),
                            });
                        }
                    },
                    SessionAction::Hangup { channel, reason } => {
                        self.driver.hangup(channel, &reason);
                    },
                    SessionAction::PostMessage { room_id, local_id, content } => {
                        self.driver.post_message(&room_id, local_id, &content);
                    },
                    SessionAction::FetchHistory { room_id } => self.driver.fetch_history(&room_id),
                    SessionAction::RoomActivity { room_id, event } => {
                        self.driver.activity(&room_id, &event);
                    },
                    SessionAction::Render => render = true,
                }
            }

            for failed in unsent {
                pending_actions.extend(self.session.handle(SessionEvent::TransmitFailed {
                    channel: failed.channel,
                    unsent: failed.messages,
                    reason: failed.reason,
                }));
            }

            if render {
                self.driver.render(self.session.view())?;
            }
        }

        Ok(())
    }
}
