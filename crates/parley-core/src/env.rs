//! Environment abstraction for deterministic testing.
//!
//! Decouples delivery logic from system resources (time, randomness, wall
//! clock). The simulation harness supplies a virtual clock and a seeded RNG;
//! production uses the system.

use std::{
    ops::{Add, Sub},
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Monotonic instant the state machines can compute deadlines with.
///
/// Implemented for every type with the right arithmetic, including
/// `std::time::Instant` and `tokio::time::Instant`.
pub trait Moment:
    Copy + Ord + Send + Sync + Sub<Output = Duration> + Add<Duration, Output = Self>
{
}

impl<T> Moment for T where
    T: Copy + Ord + Send + Sync + Sub<Output = Duration> + Add<Duration, Output = T>
{
}

/// Abstract environment providing time and randomness.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - Given the same seed, `random_bytes()` produces the same sequence
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type. `std::time::Instant` in production, virtual
    /// time in simulation.
    type Instant: Moment;

    /// Current monotonic time. Drives retry and notification timers.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time. Used only for message timestamps.
    fn utc_now(&self) -> DateTime<Utc>;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Used for local message ids.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}
