//! Parley client
//!
//! Ties the delivery core into a usable client:
//!
//! - [`RoomSession`]: the active room's connection, message list, notices
//!   and in-flight durable writes, as one Sans-IO state machine
//! - [`Driver`]: trait for platform-specific I/O
//! - [`Runtime`]: generic loop feeding driver input into the session and
//!   executing its actions
//! - [`SystemEnv`]: production time and randomness
//! - `transport` feature: [`WsDriver`] over tokio-tungstenite and reqwest

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod driver;
pub mod runtime;
pub mod session;
pub mod system_env;
#[cfg(feature = "transport")]
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use driver::{Driver, Input};
pub use runtime::Runtime;
pub use session::{
    Command, LocalUser, RoomSession, SessionAction, SessionConfig, SessionError, SessionEvent,
    SessionView,
};
pub use system_env::SystemEnv;
#[cfg(feature = "transport")]
pub use transport::{
    DriverHandle, HttpApi, Notice, RoomActivity, SessionSnapshot, TransportError, WsDriver,
};
