//! Tick-based retry backoff for flaky telemetry sources.
//!
//! A sensor whose telemetry pull fails is skipped for a growing number of
//! ticks: 1, 2, 4, ... up to `max_backoff_ticks`. One successful pull
//! resets it.

use tracing::debug;

/// Tracks consecutive failures for a single sensor.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    /// Consecutive failure count.
    consecutive_failures: u32,
    /// First tick at which the next attempt is allowed.
    retry_at_tick: u64,
    /// Upper bound on the skip interval.
    max_backoff_ticks: u64,
}

impl RetryBackoff {
    pub fn new(max_backoff_ticks: u64) -> Self {
        Self {
            consecutive_failures: 0,
            retry_at_tick: 0,
            max_backoff_ticks: max_backoff_ticks.max(1),
        }
    }

    /// Whether the sensor may be attempted on `tick`.
    pub fn should_attempt(&self, tick: u64) -> bool {
        tick >= self.retry_at_tick
    }

    /// Record a failure on `tick`. Returns how many ticks until the next
    /// attempt.
    pub fn record_failure(&mut self, tick: u64) -> u64 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = 1u64
            .checked_shl(self.consecutive_failures - 1)
            .unwrap_or(u64::MAX)
            .min(self.max_backoff_ticks);
        self.retry_at_tick = tick.saturating_add(delay);
        delay
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                failures = self.consecutive_failures,
                "telemetry recovered; backoff reset"
            );
        }
        self.consecutive_failures = 0;
        self.retry_at_tick = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn retry_at_tick(&self) -> u64 {
        self.retry_at_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_backoff_allows_every_tick() {
        let b = RetryBackoff::new(16);
        assert!(b.should_attempt(0));
        assert!(b.should_attempt(1));
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let mut b = RetryBackoff::new(8);
        let delays: Vec<u64> = (0..6).map(|i| b.record_failure(10 + i)).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn skips_until_retry_tick() {
        let mut b = RetryBackoff::new(16);
        b.record_failure(5);
        b.record_failure(6);
        // Second failure on tick 6 waits two ticks.
        assert!(!b.should_attempt(7));
        assert!(b.should_attempt(8));
    }

    #[test]
    fn success_resets() {
        let mut b = RetryBackoff::new(16);
        b.record_failure(1);
        b.record_failure(2);
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
        assert!(b.should_attempt(3));
        assert_eq!(b.record_failure(3), 1);
    }

    #[test]
    fn many_failures_do_not_overflow() {
        let mut b = RetryBackoff::new(u64::MAX);
        for tick in 0..100 {
            b.record_failure(tick);
        }
        assert_eq!(b.retry_at_tick(), u64::MAX);
    }
}
