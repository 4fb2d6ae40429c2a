//! Bounded exponential backoff for store operations.
//!
//! Transient store failures are retried a fixed number of times with
//! jittered, capped exponential delays. Non-retryable errors, including an
//! open circuit, end the loop immediately.

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;
use vigil_core::Clock;

use crate::{config::WorkerPoolConfig, error::Result};

/// Backoff policy for the store retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied around each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.25, // ±25% randomization
        }
    }
}

impl RetryPolicy {
    /// Policy derived from the engine configuration.
    pub fn from_config(config: &WorkerPoolConfig) -> Self {
        Self {
            max_attempts: config.store_retry_attempts,
            base_delay: config.backoff_base_delay,
            max_delay: config.backoff_max_delay,
            ..Self::default()
        }
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    ///
    /// Doubles per attempt and never exceeds `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Jittered delay after failed attempt `attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_delay_for(attempt), self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes `duration` by up to `±jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once
/// `policy.max_attempts` attempts have failed.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    operation: &str,
    op: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() || attempt >= max_attempts => return Err(error),
            Err(error) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "store operation failed, retrying"
                );
                clock.sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
