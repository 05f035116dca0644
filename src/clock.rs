//! Monotonic + wall clock source.
//!
//! Durations must use monotonic time; event timestamps must use wall-clock
//! milliseconds. [`MockClock`] is the only allowed time source in tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};

/// A point in time carrying both a wall-clock reading and a monotonic
/// nanosecond counter, so elapsed-time math never drifts with wall-clock
/// adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub wall_utc: DateTime<Utc>,
    pub monotonic_ns: i64,
}

impl Timestamp {
    pub fn wall_ms(&self) -> i64 {
        self.wall_utc.timestamp_millis()
    }

    pub fn monotonic_ms(&self) -> f64 {
        self.monotonic_ns as f64 / 1_000_000.0
    }

    /// Elapsed seconds since `earlier`, computed from monotonic time only.
    pub fn elapsed_since(&self, earlier: &Timestamp) -> f64 {
        (self.monotonic_ns - earlier.monotonic_ns) as f64 / 1_000_000_000.0
    }
}

/// Source of monotonic nanoseconds and wall-clock milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    fn now_ms(&self) -> i64 {
        self.now().wall_ms()
    }

    fn monotonic_ns(&self) -> i64 {
        self.now().monotonic_ns
    }

    fn monotonic_ms(&self) -> f64 {
        self.now().monotonic_ms()
    }

    fn elapsed_since_start(&self) -> f64;
}

/// Real wall/monotonic clock backed by the OS.
pub struct SystemClock {
    start: std::time::Instant,
    start_wall: DateTime<Utc>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
            start_wall: Utc::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let monotonic_ns = self.start.elapsed().as_nanos() as i64;
        Timestamp {
            wall_utc: Utc::now(),
            monotonic_ns,
        }
    }

    fn elapsed_since_start(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Starts at 2025-01-01T00:00:00Z / monotonic 0 unless overridden.
pub struct MockClock {
    wall_ms: AtomicI64,
    monotonic_ns: AtomicI64,
    start: Mutex<Timestamp>,
}

impl MockClock {
    pub fn new() -> Self {
        let start_wall = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let start = Timestamp {
            wall_utc: start_wall,
            monotonic_ns: 0,
        };
        Self {
            wall_ms: AtomicI64::new(start_wall.timestamp_millis()),
            monotonic_ns: AtomicI64::new(0),
            start: Mutex::new(start),
        }
    }

    pub fn advance(&self, seconds: f64) {
        self.advance_ms(seconds * 1000.0);
    }

    pub fn advance_ms(&self, milliseconds: f64) {
        self.wall_ms.fetch_add(milliseconds as i64, Ordering::SeqCst);
        self.monotonic_ns
            .fetch_add((milliseconds * 1_000_000.0) as i64, Ordering::SeqCst);
    }

    pub fn set_time(&self, wall_utc: DateTime<Utc>) {
        let diff_ms = wall_utc.timestamp_millis() - self.wall_ms.load(Ordering::SeqCst);
        self.wall_ms.store(wall_utc.timestamp_millis(), Ordering::SeqCst);
        self.monotonic_ns
            .fetch_add(diff_ms * 1_000_000, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Timestamp {
        Timestamp {
            wall_utc: Utc
                .timestamp_millis_opt(self.wall_ms.load(Ordering::SeqCst))
                .unwrap(),
            monotonic_ns: self.monotonic_ns.load(Ordering::SeqCst),
        }
    }

    fn elapsed_since_start(&self) -> f64 {
        let start = *self.start.lock().unwrap();
        self.now().elapsed_since(&start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances_both_wall_and_monotonic() {
        let clock = MockClock::new();
        let t0 = clock.now();
        clock.advance(5.0);
        let t1 = clock.now();

        assert_eq!(t1.wall_ms() - t0.wall_ms(), 5000);
        assert!((t1.elapsed_since(&t0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn mock_clock_advance_ms() {
        let clock = MockClock::new();
        let t0 = clock.now_ms();
        clock.advance_ms(1500.0);
        assert_eq!(clock.now_ms() - t0, 1500);
    }

    #[test]
    fn mock_clock_set_time_keeps_monotonic_consistent() {
        let clock = MockClock::new();
        let target = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 10).unwrap();
        clock.set_time(target);
        assert_eq!(clock.now().wall_utc, target);
        assert_eq!(clock.monotonic_ns(), 10_000_000_000);
    }

    #[test]
    fn system_clock_elapsed_since_start_is_nonnegative() {
        let clock = SystemClock::new();
        assert!(clock.elapsed_since_start() >= 0.0);
    }
}
