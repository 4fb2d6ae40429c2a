//! Delivery queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Settings of one delivery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Jobs per batch; a pass pops `batch_size * max_concurrent_batches`.
    pub batch_size: usize,
    /// Channel calls in flight during a pass.
    pub max_concurrent_batches: usize,
    /// Jobs the queue holds before rejecting new ones.
    pub max_queue_size: usize,
    /// Deadline for a whole processing pass.
    pub pass_timeout: Duration,
    /// Time between passes.
    pub process_interval: Duration,
    /// Failed passes before a job is dropped.
    pub max_retries: u32,
    /// Backoff unit; the delay after retry `n` is `backoff_base * 2^n`.
    pub backoff_base: Duration,
    /// Upper bound on a single backoff delay.
    pub max_backoff: Duration,
    /// Cumulative failures after which a subscription is disabled.
    pub disable_after_failures: u32,
    /// Consecutive failed calls that open a channel's breaker.
    pub circuit_breaker_threshold: u32,
    /// How long a channel breaker stays open.
    pub circuit_breaker_timeout: Duration,
    /// Channel calls per second across all channels.
    pub rate_limit_per_second: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrent_batches: 4,
            max_queue_size: 10_000,
            pass_timeout: Duration::from_secs(30),
            process_interval: Duration::from_secs(1),
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3600),
            disable_after_failures: 10,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            rate_limit_per_second: 20.0,
        }
    }
}

impl DeliveryConfig {
    /// Jobs popped per pass.
    pub fn pass_capacity(&self) -> usize {
        self.batch_size.saturating_mul(self.max_concurrent_batches)
    }

    /// Delay before attempt number `retry_count + 1`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(retry_count.min(31));
        self.backoff_base.saturating_mul(multiplier).min(self.max_backoff)
    }

    /// Checks that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.max_concurrent_batches == 0 {
            return Err(DeliveryError::invalid_input(
                "batch_size and max_concurrent_batches must be at least 1",
            ));
        }
        if self.max_queue_size == 0 {
            return Err(DeliveryError::invalid_input("max_queue_size must be at least 1"));
        }
        if self.pass_timeout.is_zero() || self.process_interval.is_zero() {
            return Err(DeliveryError::invalid_input(
                "pass_timeout and process_interval must be greater than zero",
            ));
        }
        if self.disable_after_failures == 0 || self.circuit_breaker_threshold == 0 {
            return Err(DeliveryError::invalid_input(
                "disable_after_failures and circuit_breaker_threshold must be at least 1",
            ));
        }
        if !(self.rate_limit_per_second.is_finite() && self.rate_limit_per_second > 0.0) {
            return Err(DeliveryError::invalid_input("rate_limit_per_second must be positive"));
        }
        Ok(())
    }
}
