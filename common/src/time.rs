//! Time utilities for RateKeeper: the clock abstraction and quota periods.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Staleness escalation threshold.
pub mod constants {
    use super::Duration;

    /// A rate older than this is flagged very stale (7 days).
    pub fn very_stale_after() -> Duration {
        Duration::days(7)
    }
}

/// A timestamp with timezone (always UTC for RateKeeper).
pub type Timestamp = DateTime<Utc>;

/// Source of the current time.
///
/// Injected into every component that stamps or ages records so tests can
/// pin time instead of sleeping.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Timestamp;
}

/// Wall clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::RwLock<Timestamp>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualClock {
    /// Create a clock pinned at `now`.
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: parking_lot::RwLock::new(now),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now = *now + by;
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.read()
    }
}

/// Calendar month used as the quota accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    /// Create a period; `month` is 1-based.
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// The period containing `at`.
    pub fn of(at: Timestamp) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// Check if `at` falls inside this period.
    pub fn contains(&self, at: Timestamp) -> bool {
        Self::of(at) == *self
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Age of `then` relative to `now`, clamped at zero for future timestamps.
pub fn age_of(then: Timestamp, now: Timestamp) -> Duration {
    let age = now.signed_duration_since(then);
    if age < Duration::zero() {
        Duration::zero()
    } else {
        age
    }
}
