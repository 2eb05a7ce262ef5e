//! Parley delivery core
//!
//! Pure state machines for the real-time delivery layer of a room-based chat
//! client. No I/O: every component takes time and events as input and
//! returns actions or results for a driver to act on.
//!
//! # Components
//!
//! - [`ConnectionManager`]: one live channel per active room, auto-reconnect
//! - [`OutboundQueue`]: messages buffered while the channel is not open
//! - [`InboundReconciler`]: merges live and durable confirmations into one
//!   ordered, de-duplicated message list
//! - [`NotificationQueue`]: bounded, expiring status notices
//! - [`Environment`]: time and randomness, real or simulated

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod connection;
pub mod env;
pub mod error;
pub mod message;
pub mod notify;
pub mod outbound;
pub mod reconcile;

pub use backoff::{DEFAULT_RECONNECT_DELAY, ReconnectPolicy};
pub use connection::{
    ChannelId, ConnectionAction, ConnectionConfig, ConnectionManager, ConnectionState,
};
pub use env::{Environment, Moment};
pub use error::{ConnectionError, InvariantViolation};
pub use message::{LocalId, Message, MessageOrigin, PendingMessage};
pub use notify::{NotificationConfig, NotificationQueue, Toast, ToastId, ToastKind};
pub use outbound::OutboundQueue;
pub use reconcile::{InboundReconciler, Reconciled};
