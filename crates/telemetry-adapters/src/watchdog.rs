//! Data-dropout watchdog shared by the adapters.

use std::time::Duration;

use tokio::time::Instant;

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Tracks the last time valid data arrived and reports staleness.
///
/// `check` fires at most once per timeout window: firing moves the reference
/// point to `now`, so the next firing needs another full window of silence.
#[derive(Debug, Clone)]
pub struct StalenessWatchdog {
    timeout: Duration,
    last_valid: Instant,
}

impl StalenessWatchdog {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_valid: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Polling cadence: half the timeout.
    pub fn check_interval(&self) -> Duration {
        (self.timeout / 2).max(MIN_CHECK_INTERVAL)
    }

    pub fn record_valid(&mut self, now: Instant) {
        if now > self.last_valid {
            self.last_valid = now;
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_valid) > self.timeout
    }

    pub fn check(&mut self, now: Instant) -> bool {
        if self.is_stale(now) {
            self.last_valid = now;
            true
        } else {
            false
        }
    }
}
