//! Exponential backoff with a bounded attempt budget.

use std::time::Duration;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound on any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default number of consecutive failed attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt; doubles after every failure.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Consecutive failures tolerated before the manager gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Counts consecutive handshake failures and computes the wait before the
/// next attempt.
///
/// The delay before attempt `k` (1-based) is `initial_delay * 2^(k-1)`,
/// capped at `max_delay`. Once `max_attempts` failures have been recorded
/// the budget is exhausted until [`Backoff::reset`] is called.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    failures: u32,
}

impl Backoff {
    /// A fresh budget.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay before attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.config
            .initial_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.config.max_delay)
    }

    /// Records a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or `None` if the
    /// budget is now exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.is_exhausted() {
            None
        } else {
            Some(self.delay_for(self.failures + 1))
        }
    }

    /// Whether no more attempts should be made.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.failures >= self.config.max_attempts
    }

    /// Consecutive failures so far.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Number of the next attempt, 1-based.
    #[must_use]
    pub const fn next_attempt(&self) -> u32 {
        self.failures.saturating_add(1)
    }

    /// Restores the full budget after a success or an explicit connect.
    pub const fn reset(&mut self) {
        self.failures = 0;
    }
}
