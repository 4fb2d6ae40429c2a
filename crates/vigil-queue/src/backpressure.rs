//! Admission control for new submissions.
//!
//! Below 80% of capacity every submission is admitted at once. Inside the
//! soft band between 80% and 100% the submitter is delayed in proportion to
//! how deep into the band the queue is. A submission that would exceed
//! capacity is rejected.

use std::time::Duration;

use vigil_core::Clock;

use crate::error::{QueueError, Result};

/// Fraction of capacity at which submitters start being slowed down.
pub const SOFT_LIMIT_RATIO: f64 = 0.8;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admit immediately.
    Admit,
    /// Admit after waiting.
    Delay(Duration),
    /// Refuse; the queue has no room.
    Reject {
        /// Waiting plus active jobs.
        current: usize,
        /// Configured capacity.
        max: usize,
    },
}

/// Backpressure policy for a queue of bounded capacity.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    max_queue_size: usize,
    max_delay: Duration,
}

impl BackpressureController {
    /// Creates a controller for `max_queue_size` slots.
    pub fn new(max_queue_size: usize, max_delay: Duration) -> Self {
        Self { max_queue_size, max_delay }
    }

    /// Decides whether `incoming` jobs may join a queue holding `current`.
    pub fn evaluate(&self, current: usize, incoming: usize) -> Admission {
        let max = self.max_queue_size;
        if current >= max || current.saturating_add(incoming) > max {
            return Admission::Reject { current, max };
        }

        let soft_limit = max as f64 * SOFT_LIMIT_RATIO;
        let current = current as f64;
        if current < soft_limit {
            return Admission::Admit;
        }

        let band = (max as f64 - soft_limit).max(1.0);
        let depth = ((current - soft_limit) / band).clamp(0.0, 1.0);
        let delay = self.max_delay.mul_f64(depth);

        if delay.is_zero() {
            Admission::Admit
        } else {
            Admission::Delay(delay)
        }
    }

    /// Applies the admission decision, sleeping through any delay.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::QueueFull` when the decision is a rejection.
    pub async fn admit(&self, current: usize, incoming: usize, clock: &dyn Clock) -> Result<()> {
        match self.evaluate(current, incoming) {
            Admission::Admit => Ok(()),
            Admission::Delay(delay) => {
                tracing::debug!(
                    current,
                    incoming,
                    delay_ms = delay.as_millis() as u64,
                    "backpressure delaying submission"
                );
                clock.sleep(delay).await;
                Ok(())
            },
            Admission::Reject { current, max } => Err(QueueError::queue_full(current, max)),
        }
    }
}
