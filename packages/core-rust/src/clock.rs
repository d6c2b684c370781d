//! Time sources and the time context used by date operators.
//!
//! Relative date operators (`past`, `yesterday`, `previous_x_days`, ...) are
//! resolved against "now" in the caller's timezone. Both come from a
//! [`TimeContext`], so tests can pin time with a [`FixedClock`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Utc};

/// Abstraction over the system clock for dependency injection.
pub trait ClockSource: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl ClockSource for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Shared handle to a clock.
#[derive(Clone)]
pub struct Clock(Arc<dyn ClockSource>);

impl Clock {
    #[must_use]
    pub fn new(source: impl ClockSource + 'static) -> Self {
        Self(Arc::new(source))
    }

    #[must_use]
    pub fn fixed(now: DateTime<Utc>) -> Self {
        Self::new(FixedClock(now))
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.0.now()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}

/// "Now" plus the timezone relative date operators are evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeContext {
    pub timezone: FixedOffset,
    pub now: DateTime<Utc>,
}

impl TimeContext {
    #[must_use]
    pub fn new(timezone: FixedOffset, now: DateTime<Utc>) -> Self {
        Self { timezone, now }
    }

    /// Current local time in the context's timezone.
    #[must_use]
    pub fn local_now(&self) -> DateTime<FixedOffset> {
        self.now.with_timezone(&self.timezone)
    }
}

/// UTC as a fixed offset.
#[must_use]
pub fn utc() -> FixedOffset {
    Utc.fix()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn fixed_clock_is_stable() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = Clock::fixed(instant);
        assert_eq!(clock.now(), instant);
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn local_now_applies_timezone() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap();
        let paris = FixedOffset::east_opt(3600).unwrap();
        let time = TimeContext::new(paris, instant);
        assert_eq!(time.local_now().to_rfc3339(), "2024-03-02T00:30:00+01:00");
    }
}
