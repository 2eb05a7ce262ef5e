//! Reconnect delay policy.

use std::time::Duration;

use rand::Rng;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// How long to wait before the next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt.
    Fixed {
        /// Delay before each attempt.
        delay: Duration,
    },

    /// Delay doubles per consecutive failure, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound on the delay.
        max: Duration,
        /// Apply equal jitter: the delay is drawn from `[d/2, d]`.
        jitter: bool,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed { delay: DEFAULT_RECONNECT_DELAY }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based count of consecutive
    /// failures). `rng` is drawn from only when jitter is applied.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max, jitter } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                let delay = base.saturating_mul(factor).min(max);
                if jitter && !delay.is_zero() { rng.gen_range(delay / 2..=delay) } else { delay }
            },
        }
    }
}
