//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Configuration shared read-only by the engine, its workers and the reaper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Default per-worker concurrency.
    pub concurrency: usize,

    /// Requeues allowed before a failing job is marked failed.
    pub max_retries: u32,

    /// Base delay of the store-operation backoff loop.
    pub backoff_base_delay: Duration,

    /// Upper bound on a single backoff delay.
    pub backoff_max_delay: Duration,

    /// Attempts per store operation, including the first.
    pub store_retry_attempts: u32,

    /// Deadline for a single store call.
    pub store_operation_timeout: Duration,

    /// How long a job may stay active before the reaper reclaims it.
    pub stalled_interval: Duration,

    /// Stall reclamations allowed before a job is failed.
    pub max_stalled_count: u32,

    /// Capacity in waiting plus active jobs.
    pub max_queue_size: usize,

    /// Longest delay the backpressure ramp imposes on a submitter.
    pub backpressure_max_delay: Duration,

    /// Token refill rate of the shared rate limiter.
    pub rate_limit_per_second: f64,

    /// Token bucket capacity; defaults to the refill rate.
    pub rate_limit_burst: Option<f64>,

    /// Consecutive store failures that open the circuit.
    pub circuit_breaker_threshold: u32,

    /// How long the circuit stays open before admitting a probe.
    pub circuit_breaker_timeout: Duration,

    /// Worker poll tick.
    pub poll_interval: Duration,

    /// Upper bound on jobs claimed per poll, regardless of concurrency.
    pub claim_batch_cap: usize,

    /// Jobs processed concurrently inside one claimed batch.
    pub sub_batch_size: usize,

    /// Pause between sub-batches.
    pub sub_batch_pause: Duration,

    /// Reaper tick.
    pub reaper_interval: Duration,

    /// Metrics sampling tick.
    pub metrics_interval: Duration,

    /// Window over which throughput is measured.
    pub throughput_window: Duration,

    /// How long a graceful shutdown waits for active jobs.
    pub shutdown_wait: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_retries: 3,
            backoff_base_delay: Duration::from_millis(200),
            backoff_max_delay: Duration::from_secs(10),
            store_retry_attempts: 3,
            store_operation_timeout: Duration::from_secs(10),
            stalled_interval: Duration::from_secs(300),
            max_stalled_count: 3,
            max_queue_size: 10_000,
            backpressure_max_delay: Duration::from_secs(2),
            rate_limit_per_second: 50.0,
            rate_limit_burst: None,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            claim_batch_cap: 10,
            sub_batch_size: 5,
            sub_batch_pause: Duration::from_millis(100),
            reaper_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(15),
            throughput_window: Duration::from_secs(60),
            shutdown_wait: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Token bucket capacity in effect.
    pub fn burst(&self) -> f64 {
        self.rate_limit_burst.unwrap_or(self.rate_limit_per_second).max(1.0)
    }

    /// Checks that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidInput` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: Duration) -> Result<()> {
            if value.is_zero() {
                return Err(QueueError::invalid_input(format!("{name} must be greater than zero")));
            }
            Ok(())
        }

        if self.concurrency == 0 {
            return Err(QueueError::invalid_input("concurrency must be at least 1"));
        }
        if self.max_queue_size == 0 {
            return Err(QueueError::invalid_input("max_queue_size must be at least 1"));
        }
        if self.claim_batch_cap == 0 || self.sub_batch_size == 0 {
            return Err(QueueError::invalid_input(
                "claim_batch_cap and sub_batch_size must be at least 1",
            ));
        }
        if self.store_retry_attempts == 0 {
            return Err(QueueError::invalid_input("store_retry_attempts must be at least 1"));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(QueueError::invalid_input("circuit_breaker_threshold must be at least 1"));
        }
        if !self.rate_limit_per_second.is_finite() || self.rate_limit_per_second <= 0.0 {
            return Err(QueueError::invalid_input("rate_limit_per_second must be positive"));
        }
        if let Some(burst) = self.rate_limit_burst {
            if !burst.is_finite() || burst < 1.0 {
                return Err(QueueError::invalid_input("rate_limit_burst must be at least 1"));
            }
        }

        positive("poll_interval", self.poll_interval)?;
        positive("stalled_interval", self.stalled_interval)?;
        positive("reaper_interval", self.reaper_interval)?;
        positive("metrics_interval", self.metrics_interval)?;
        positive("throughput_window", self.throughput_window)?;
        positive("store_operation_timeout", self.store_operation_timeout)?;
        positive("circuit_breaker_timeout", self.circuit_breaker_timeout)?;

        if self.backoff_max_delay < self.backoff_base_delay {
            return Err(QueueError::invalid_input(
                "backoff_max_delay must not be shorter than backoff_base_delay",
            ));
        }
        Ok(())
    }
}
