// crates/backfill-core/src/runtime/clock.rs
// ============================================================================
// Module: Backfill Runtime Helpers
// Description: Stock clocks, toggles, and jitter sources.
// Purpose: Provide host and test implementations of the time interfaces.
// Dependencies: crate::core, crate::interfaces, rand
// ============================================================================

//! ## Overview
//! [`SystemClock`] and [`RandomJitter`] are the production defaults.
//! [`ManualClock`] and [`FixedJitter`] make interval throttling and lease
//! expiry reproducible in tests.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rand::Rng;

use crate::core::Timestamp;
use crate::interfaces::Clock;
use crate::interfaces::FeatureToggle;
use crate::interfaces::IntervalJitter;

// ============================================================================
// SECTION: Clocks
// ============================================================================

/// Wall-clock time source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp::from_unix_millis(i64::try_from(now.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Manually advanced clock; clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    /// Current unix epoch milliseconds.
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.as_unix_millis())),
        }
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let delta = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let _ = self.millis.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current.saturating_add(delta))
        });
    }

    /// Sets the clock to `at`.
    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_unix_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix_millis(self.millis.load(Ordering::SeqCst))
    }
}

// ============================================================================
// SECTION: Toggles
// ============================================================================

/// Feature toggle with a single fixed answer for every flag.
#[derive(Debug, Clone, Copy)]
pub struct StaticToggle(pub bool);

impl FeatureToggle for StaticToggle {
    fn is_enabled(&self, _flag: &str) -> bool {
        self.0
    }
}

// ============================================================================
// SECTION: Jitter
// ============================================================================

/// Uniformly random jitter in `[0, max]` at millisecond resolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl IntervalJitter for RandomJitter {
    fn sample(&self, max: Duration) -> Duration {
        let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        if max_millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_millis))
    }
}

/// Jitter that always returns the full variance.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedJitter;

impl IntervalJitter for FixedJitter {
    fn sample(&self, max: Duration) -> Duration {
        max
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(Timestamp::from_unix_millis(1_000));
        let other = clock.clone();
        clock.advance(Duration::from_secs(2));
        assert_eq!(other.now(), Timestamp::from_unix_millis(3_000));
    }

    #[test]
    fn random_jitter_stays_within_bounds() {
        let max = Duration::from_millis(50);
        for _ in 0..100 {
            assert!(RandomJitter.sample(max) <= max);
        }
        assert_eq!(RandomJitter.sample(Duration::ZERO), Duration::ZERO);
    }
}
