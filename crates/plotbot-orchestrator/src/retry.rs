//! Retry backoff for failing profiles
//!
//! After `n` consecutive failures the next start waits
//! `min(base * 2^(n-1), max)` from the last failure. A successful plot
//! resets the count.

use chrono::{DateTime, Duration, Utc};
use plotbot_core::RetryConfig;

/// Per-profile backoff state
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    base: Duration,
    max: Duration,
}

impl RetryBackoff {
    /// Create a backoff
    ///
    /// # Arguments
    ///
    /// * `base_secs` - Delay after the first failure, 0 for immediate retries
    /// * `max_secs` - Upper bound for the delay
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            base: Duration::seconds(base_secs.min(i64::MAX as u64) as i64),
            max: Duration::seconds(max_secs.min(i64::MAX as u64) as i64),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.backoff_base_secs, config.backoff_max_secs)
    }

    /// Record a successful plot (resets failure count)
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
    }

    /// Record a failed launch or plot
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
    }

    /// Current delay, zero without failures
    pub fn delay(&self) -> Duration {
        if self.failure_count == 0 || self.base.is_zero() {
            return Duration::zero();
        }
        // 2^30 keeps the factor positive in an i32
        let exponent = (self.failure_count - 1).min(30);
        let factor = 1i32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
            .max(Duration::zero())
    }

    /// Whether a start is allowed at `now`
    pub fn can_start(&self, now: DateTime<Utc>) -> bool {
        self.time_until_retry(now).is_zero()
    }

    /// Time until a start is allowed, zero if allowed now
    pub fn time_until_retry(&self, now: DateTime<Utc>) -> Duration {
        match self.last_failure {
            Some(last) => {
                let ready = last + self.delay();
                if ready > now {
                    ready - now
                } else {
                    Duration::zero()
                }
            }
            None => Duration::zero(),
        }
    }

    /// Get current failure count (for monitoring)
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
