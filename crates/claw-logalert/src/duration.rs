//! Human-authored durations used by rule and application config files.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// A duration written as `{ seconds, minutes, days }`; the parts are summed.
///
/// An all-zero value is "empty" and lets callers fall back to a default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLimit {
    /// Seconds component.
    pub seconds: u64,
    /// Minutes component.
    pub minutes: u64,
    /// Days component.
    pub days: u64,
}

impl TimeLimit {
    /// Builds a limit of whole seconds.
    #[must_use]
    pub const fn seconds(seconds: u64) -> Self {
        Self {
            seconds,
            minutes: 0,
            days: 0,
        }
    }

    /// Builds a limit of whole minutes.
    #[must_use]
    pub const fn minutes(minutes: u64) -> Self {
        Self {
            seconds: 0,
            minutes,
            days: 0,
        }
    }

    /// Builds a limit of whole days.
    #[must_use]
    pub const fn days(days: u64) -> Self {
        Self {
            seconds: 0,
            minutes: 0,
            days,
        }
    }

    /// Total length as a std duration, saturating on overflow.
    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        let total = self
            .seconds
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.days.saturating_mul(86_400));
        Duration::from_secs(total)
    }

    /// Total length as a chrono delta, clamped to the representable range.
    #[must_use]
    pub fn as_time_delta(&self) -> TimeDelta {
        to_time_delta(self.as_duration())
    }

    /// Returns true when every component is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.seconds == 0 && self.minutes == 0 && self.days == 0
    }
}

impl From<TimeLimit> for Duration {
    fn from(limit: TimeLimit) -> Self {
        limit.as_duration()
    }
}

/// Converts a std duration to a chrono delta without panicking.
#[must_use]
pub fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
