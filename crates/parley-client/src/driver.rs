//! Driver trait for abstracting I/O operations.
//!
//! The [`Driver`] trait decouples the session runtime from specific I/O
//! implementations. The WebSocket/HTTP transport and the simulation harness
//! both implement it, while the generic [`crate::Runtime`] handles all
//! orchestration.

use std::future::Future;

use parley_core::{ChannelId, LocalId, Moment};
use parley_proto::{InboundEvent, RoomId};

use crate::session::{Command, SessionEvent, SessionView};

/// One input for the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input<I> {
    /// An I/O completion or arrival.
    Event(SessionEvent<I>),
    /// A user intent.
    Command(Command),
}

/// Abstracts I/O operations for the session runtime.
///
/// Dialing and HTTP calls are fire-and-forget: their outcomes come back
/// later through [`Driver::next_input`] as [`SessionEvent`]s. Only
/// [`Driver::transmit`] reports failure directly, so the runtime can hand
/// unsent messages back to the connection in order.
///
/// # Associated Types
///
/// - [`Error`](Driver::Error): Platform-specific error type
/// - [`Instant`](Driver::Instant): Time representation (real or virtual)
pub trait Driver: Send {
    /// Platform-specific error type.
    type Error: std::error::Error + Send + 'static;

    /// Time instant type. Enables virtual time in simulation.
    type Instant: Moment;

    /// Current time instant.
    fn now(&self) -> Self::Instant;

    /// Wait for the next input.
    ///
    /// Returns `None` once `deadline` has passed without input. With no
    /// deadline, waits until input arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the input source is gone.
    fn next_input(
        &mut self,
        deadline: Option<Self::Instant>,
    ) -> impl Future<Output = Result<Option<Input<Self::Instant>>, Self::Error>> + Send;

    /// Start connecting a live channel. Reports back with
    /// [`SessionEvent::ChannelOpened`] or [`SessionEvent::ChannelClosed`].
    fn dial(&mut self, channel: ChannelId, room_id: &RoomId);

    /// Send one frame on an open channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is gone or the write fails.
    fn transmit(
        &mut self,
        channel: ChannelId,
        frame: String,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Close a channel. Its later events, if any, are ignored.
    fn hangup(&mut self, channel: ChannelId, reason: &str);

    /// Start a durable write. Reports back with
    /// [`SessionEvent::DurableWriteCompleted`] or
    /// [`SessionEvent::DurableWriteFailed`].
    fn post_message(&mut self, room_id: &RoomId, local_id: LocalId, content: &str);

    /// Start a history request. Reports back with
    /// [`SessionEvent::HistoryLoaded`] or [`SessionEvent::HistoryFailed`].
    fn fetch_history(&mut self, room_id: &RoomId);

    /// Show typing, receipt or presence activity.
    fn activity(&mut self, room_id: &RoomId, event: &InboundEvent);

    /// Render the session state.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails.
    fn render(&mut self, view: SessionView<'_, Self::Instant>) -> Result<(), Self::Error>;

    /// Stop all connections and clean up resources.
    fn stop(&mut self);
}
