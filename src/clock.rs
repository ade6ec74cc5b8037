//! Clock capability injected into aggregates and the command pipeline.
//!
//! Aggregates use the clock only to reject far-future `occurred_at` values;
//! the handler uses it to stamp `recorded_at`. Tests inject [`FixedClock`]
//! so every timestamp in a scenario is reproducible.

use chrono::{DateTime, Duration, FixedOffset, Local};

/// Source of the current instant, with offset.
pub trait Clock: Send + Sync {
    /// The current instant in the node's local offset.
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall-clock implementation backed by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// A clock pinned to a fixed instant, advanced explicitly. Test use only,
/// but exported so integration tests and sync simulations can share it.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: std::sync::Arc<std::sync::Mutex<DateTime<FixedOffset>>>,
}

impl FixedClock {
    /// Create a clock pinned to `instant`.
    pub fn at(instant: DateTime<FixedOffset>) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::Mutex::new(instant)),
        }
    }

    /// Advance the clock by `delta`. Clones share the same instant.
    pub fn advance(&self, delta: Duration) {
        let mut guard = self.now.lock().expect("clock mutex poisoned");
        *guard = *guard + delta;
    }

    /// Pin the clock to a new instant.
    pub fn set(&self, instant: DateTime<FixedOffset>) {
        let mut guard = self.now.lock().expect("clock mutex poisoned");
        *guard = instant;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).expect("valid rfc3339")
    }

    #[test]
    fn fixed_clock_returns_pinned_instant() {
        let clock = FixedClock::at(instant("2026-03-01T09:00:00+02:00"));
        assert_eq!(clock.now(), instant("2026-03-01T09:00:00+02:00"));
    }

    #[test]
    fn fixed_clock_advance_is_shared_across_clones() {
        let clock = FixedClock::at(instant("2026-03-01T09:00:00+02:00"));
        let other = clock.clone();
        clock.advance(Duration::minutes(5));
        assert_eq!(other.now(), instant("2026-03-01T09:05:00+02:00"));
    }

    #[test]
    fn system_clock_is_monotonic_enough_for_stamping() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
