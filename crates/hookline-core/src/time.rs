//! Clock abstraction for deterministic time handling.
//!
//! All scheduling decisions (retry timing, circuit cooldowns) go through
//! the `Clock` trait so tests can control time without sleeping.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current instant as UTC wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Controllable clock for tests.
///
/// Starts at a fixed epoch and only moves when explicitly advanced, making
/// retry schedules and cooldown expiry fully deterministic.
#[derive(Debug)]
pub struct TestClock {
    base: DateTime<Utc>,
    offset_ms: AtomicI64,
}

impl TestClock {
    /// Creates a clock frozen at the given start time.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { base: start, offset_ms: AtomicI64::new(0) }
    }

    /// Creates a clock frozen at 2024-01-01T00:00:00Z.
    pub fn default_start() -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
        Self::new(start)
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Moves the clock to an absolute instant.
    pub fn jump_to(&self, target: DateTime<Utc>) {
        let ms = (target - self.base).num_milliseconds();
        self.offset_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_frozen() {
        let clock = TestClock::default_start();
        let first = clock.now();
        let second = clock.now();
        assert_eq!(first, second);
    }

    #[test]
    fn test_clock_advances_monotonically() {
        let clock = TestClock::default_start();
        let before = clock.now();
        clock.advance(Duration::from_secs(300));
        assert_eq!(clock.now() - before, chrono::Duration::seconds(300));
    }

    #[test]
    fn test_clock_jump_to_absolute_time() {
        let clock = TestClock::default_start();
        let target = clock.now() + chrono::Duration::hours(2);
        clock.jump_to(target);
        assert_eq!(clock.now(), target);
    }
}
