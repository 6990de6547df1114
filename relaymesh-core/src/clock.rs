//! Wall-clock abstraction
//!
//! Rate-limit windows and shared-store buckets are keyed on unix time, so the
//! tracker reads time through [`Clock`] instead of calling `SystemTime::now()`
//! directly. Tests drive a [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("System clock is before the unix epoch: {0}")]
    BeforeEpoch(String),
}

/// Source of unix time in milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Result<u64, ClockError>;
}

/// Clock backed by the system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Result<u64, ClockError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .map_err(|e| ClockError::BeforeEpoch(e.to_string()))
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`
    pub fn new(start_ms: u64) -> Self {
        Self { now_ms: Arc::new(AtomicU64::new(start_ms)) }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Result<u64, ClockError> {
        Ok(self.now_ms.load(Ordering::SeqCst))
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_ms().unwrap(), 1_250);

        clock.set(5);
        assert_eq!(clock.now_ms().unwrap(), 5);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(0);
        let other = clock.clone();
        clock.advance(Duration::from_secs(1));
        assert_eq!(other.now_ms().unwrap(), 1_000);
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now_ms().unwrap() > 0);
    }
}
