//! Simulated environment.
//!
//! Virtual time that only moves when told to, and a seeded RNG, so a run is
//! reproducible from its seed.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    fmt,
    ops::{Add, Sub},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parley_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Wall-clock time at virtual time zero: 2024-05-01T00:00:00Z.
const WALL_CLOCK_ORIGIN_SECS: i64 = 1_714_521_600;

/// Point in virtual time, measured from the start of the simulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Virtual time zero.
    pub const ZERO: Self = Self(Duration::ZERO);

    /// Time since the start of the simulation.
    pub fn elapsed(self) -> Duration {
        self.0
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl fmt::Display for SimInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}ms", self.0.as_millis())
    }
}

struct SimState {
    now: SimInstant,
    rng: ChaCha8Rng,
}

/// Deterministic environment. Clones share one clock and one RNG.
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl SimEnv {
    /// Environment at virtual time zero with a fixed seed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment at virtual time zero seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        let state = SimState { now: SimInstant::ZERO, rng: ChaCha8Rng::seed_from_u64(seed) };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Move virtual time forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.now = state.now + by;
    }

    /// Move virtual time forward to `at`. Earlier instants are ignored.
    pub fn advance_to(&self, at: SimInstant) {
        let mut state = self.lock();
        state.now = state.now.max(at);
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        self.lock().now
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.now().elapsed()).unwrap_or(TimeDelta::MAX);
        DateTime::from_timestamp(WALL_CLOCK_ORIGIN_SECS, 0)
            .and_then(|origin| origin.checked_add_signed(elapsed))
            .unwrap_or_default()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.lock().rng.fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_only_moves_when_advanced() {
        let env = SimEnv::new();
        let t0 = env.now();
        assert_eq!(env.now(), t0);

        env.advance(Duration::from_millis(250));
        assert_eq!(env.now() - t0, Duration::from_millis(250));

        env.advance_to(t0);
        assert_eq!(env.now() - t0, Duration::from_millis(250));
    }

    #[test]
    fn same_seed_same_randomness() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_u128(), b.random_u128());
        assert_ne!(a.random_u128(), SimEnv::with_seed(43).random_u128());
    }

    #[test]
    fn wall_clock_follows_virtual_time() {
        let env = SimEnv::new();
        let start = env.utc_now();
        env.advance(Duration::from_secs(90));
        assert_eq!((env.utc_now() - start).num_seconds(), 90);
    }

    #[test]
    fn clones_share_the_clock() {
        let env = SimEnv::new();
        let other = env.clone();
        env.advance(Duration::from_secs(1));
        assert_eq!(other.now().elapsed(), Duration::from_secs(1));
    }
}
