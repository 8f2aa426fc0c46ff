//! Interview countdown.
//!
//! Remaining time is recomputed from the anchor and the current wall-clock
//! reading on every check. Nothing is accumulated per tick, so a throttled
//! background tab cannot stretch the budget.

use chrono::{DateTime, Utc};

/// A single countdown anchored at a wall-clock instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    anchored_at: DateTime<Utc>,
    budget_secs: i64,
}

impl Countdown {
    /// Start a fresh countdown of `budget_secs` at `now`.
    pub fn start(now: DateTime<Utc>, budget_secs: u64) -> Self {
        Self {
            anchored_at: now,
            budget_secs: i64::try_from(budget_secs).unwrap_or(i64::MAX),
        }
    }

    /// Resume with a remaining value taken from a restored snapshot.
    pub fn resume(now: DateTime<Utc>, remaining_secs: i64) -> Self {
        Self {
            anchored_at: now,
            budget_secs: remaining_secs.max(0),
        }
    }

    /// Whole seconds left at `now`, clamped to zero.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        let elapsed = (now - self.anchored_at).num_seconds().max(0);
        (self.budget_secs - elapsed).max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining_secs(now) == 0
    }

    /// Wall-clock instant at which the countdown reaches zero.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.anchored_at + chrono::Duration::seconds(self.budget_secs)
    }
}
