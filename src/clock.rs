//! Time source seam.
//!
//! Countdown and restore logic are computed from wall-clock readings, never
//! from accumulated ticks, so they take the clock as a dependency.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant for debounce and caption deadlines.
    fn monotonic_now(&self) -> Instant;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-driven clock for tests and replays.
///
/// Both readings move together when [`ManualClock::advance`] is called.
#[derive(Debug)]
pub struct ManualClock {
    wall: Mutex<DateTime<Utc>>,
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            wall: Mutex::new(start),
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move both wall-clock and monotonic time forward.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        *self.wall.lock() += delta;
        *self.offset.lock() += by;
    }

    /// Jump wall-clock time only (simulates a suspended tab or a reload
    /// hours later; monotonic time does not survive a reload anyway).
    pub fn set_wall(&self, to: DateTime<Utc>) {
        *self.wall.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.wall.lock()
    }

    fn monotonic_now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}
