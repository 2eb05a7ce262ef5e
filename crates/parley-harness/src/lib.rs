//! Deterministic simulation harness for Parley client testing.
//!
//! Simulated implementations of the Environment and Driver traits for
//! deterministic, reproducible runs of the real [`parley_client::Runtime`]:
//!
//! - [`SimEnv`]: virtual clock and seeded RNG
//! - [`SimDriver`]: scripted input and an in-memory stand-in for the server

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_driver;
pub mod sim_env;

pub use sim_driver::{Effect, Rendered, SimDriver, SimDriverError, Step};
pub use sim_env::{SimEnv, SimInstant};
