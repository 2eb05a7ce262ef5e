//! Transient status notices.
//!
//! At most `max_visible` notices are shown at once. Further notices wait in
//! a FIFO backlog and are promoted, oldest first, whenever a slot frees up.
//! A notice expires `lifetime` after it became visible; time spent in the
//! backlog does not count.

use std::{
    collections::VecDeque,
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use crate::env::Moment;

/// Default number of simultaneously visible notices.
pub const DEFAULT_MAX_VISIBLE: usize = 3;

/// Default time a notice stays visible.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(5);

/// Notice severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToastKind {
    /// Operation succeeded.
    Success,
    /// Operation failed.
    Error,
    /// Neutral information.
    Info,
    /// Degraded but recoverable.
    Warning,
}

impl fmt::Display for ToastKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Info => "info",
            Self::Warning => "warning",
        })
    }
}

/// Notice identifier, unique per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ToastId(u64);

impl ToastId {
    /// Raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ToastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ToastId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast<I = Instant> {
    /// Identifier.
    pub id: ToastId,
    /// Severity.
    pub kind: ToastKind,
    /// Text shown to the user.
    pub text: String,
    /// When the notice was raised.
    pub enqueued_at: I,
    /// When the notice became visible. `None` while in the backlog.
    pub visible_since: Option<I>,
}

/// Notification limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Notices shown at once.
    pub max_visible: usize,
    /// Time a notice stays visible.
    pub lifetime: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { max_visible: DEFAULT_MAX_VISIBLE, lifetime: DEFAULT_LIFETIME }
    }
}

/// Bounded notice presenter.
///
/// Pure state machine. The caller drives expiry with [`Self::tick`] and
/// schedules its timer from [`Self::next_deadline`].
#[derive(Debug, Clone)]
pub struct NotificationQueue<I = Instant> {
    config: NotificationConfig,
    visible: Vec<Toast<I>>,
    backlog: VecDeque<Toast<I>>,
    last_id: u64,
}

impl<I: Moment> NotificationQueue<I> {
    /// Empty queue.
    pub fn new(config: NotificationConfig) -> Self {
        Self { config, visible: Vec::new(), backlog: VecDeque::new(), last_id: 0 }
    }

    /// Raise a notice. Shown at once if a slot is free, queued otherwise.
    ///
    /// Identical notices are not merged. Notices already due at `now` expire
    /// first.
    pub fn notify(&mut self, kind: ToastKind, text: impl Into<String>, now: I) -> ToastId {
        self.expire(now);
        self.last_id += 1;
        let id = ToastId(self.last_id);
        let toast = Toast { id, kind, text: text.into(), enqueued_at: now, visible_since: None };

        tracing::debug!(%id, %kind, text = %toast.text, "notice raised");

        self.backlog.push_back(toast);
        self.promote(now);
        id
    }

    /// Remove a notice before it expires. Promotes from the backlog.
    ///
    /// Returns false if the id is unknown or already gone.
    pub fn dismiss(&mut self, id: ToastId, now: I) -> bool {
        self.expire(now);

        if let Some(pos) = self.visible.iter().position(|t| t.id == id) {
            self.visible.remove(pos);
            self.promote(now);
            return true;
        }

        if let Some(pos) = self.backlog.iter().position(|t| t.id == id) {
            self.backlog.remove(pos);
            return true;
        }

        false
    }

    /// Expire notices whose lifetime has passed, promoting replacements.
    ///
    /// Expiries are processed in deadline order. A promoted notice becomes
    /// visible at the deadline of the notice it replaces, so a late tick
    /// does not extend lifetimes. Returns the expired ids in order.
    pub fn tick(&mut self, now: I) -> Vec<ToastId> {
        self.expire(now)
    }

    fn expire(&mut self, now: I) -> Vec<ToastId> {
        let mut expired = Vec::new();

        while let Some((pos, deadline)) = self.earliest_deadline() {
            if deadline > now {
                break;
            }
            let toast = self.visible.remove(pos);
            tracing::trace!(id = %toast.id, "notice expired");
            expired.push(toast.id);
            self.promote(deadline);
        }

        expired
    }

    /// When the next visible notice expires.
    pub fn next_deadline(&self) -> Option<I> {
        self.earliest_deadline().map(|(_, at)| at)
    }

    /// Drop everything, cancelling all pending expiries.
    pub fn clear(&mut self) {
        self.visible.clear();
        self.backlog.clear();
    }

    /// Visible notices, oldest first.
    pub fn visible(&self) -> &[Toast<I>] {
        &self.visible
    }

    /// Number of notices waiting for a slot.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Active configuration.
    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    fn promote(&mut self, at: I) {
        while self.visible.len() < self.config.max_visible {
            let Some(mut toast) = self.backlog.pop_front() else {
                break;
            };
            toast.visible_since = Some(at);
            self.visible.push(toast);
        }
    }

    fn earliest_deadline(&self) -> Option<(usize, I)> {
        let lifetime = self.config.lifetime;
        self.visible
            .iter()
            .enumerate()
            .filter_map(|(pos, t)| t.visible_since.map(|since| (pos, since + lifetime)))
            .min_by_key(|&(_, at)| at)
    }
}
