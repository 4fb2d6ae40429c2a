//! Token-bucket rate limiter.
//!
//! Refill is lazy: elapsed time is converted into tokens whenever a caller
//! checks the bucket, so there is no background timer. A caller that finds
//! the bucket empty reserves the next token (the balance goes negative) and
//! sleeps until it would have been refilled. Reservation keeps concurrent
//! waiters in line: the k-th caller past an empty bucket waits `k / rate`.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::trace;
use vigil_core::Clock;

/// Lazily refilled token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Available tokens; negative while callers hold reservations.
    pub tokens: f64,
    /// Last time elapsed time was converted into tokens.
    pub last_refill: Instant,
    /// Bucket capacity.
    pub max_tokens: f64,
    /// Tokens added per second.
    pub refill_rate_per_second: f64,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_second).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Shared rate limiter gating store mutations and channel calls.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a full bucket holding `max_tokens` and refilling at
    /// `refill_rate_per_second`.
    pub fn new(refill_rate_per_second: f64, max_tokens: f64, clock: Arc<dyn Clock>) -> Self {
        let bucket = TokenBucket {
            tokens: max_tokens,
            last_refill: clock.now(),
            max_tokens,
            refill_rate_per_second,
        };
        Self { bucket: Mutex::new(bucket), clock }
    }

    /// Takes one token, sleeping until it is available.
    ///
    /// Returns how long the caller was delayed.
    pub async fn acquire(&self) -> Duration {
        let wait = {
            let mut bucket = self.bucket.lock().await;
            bucket.refill(self.clock.now());
            bucket.tokens -= 1.0;

            if bucket.tokens >= 0.0 {
                return Duration::ZERO;
            }
            Duration::from_secs_f64(-bucket.tokens / bucket.refill_rate_per_second)
        };

        trace!(wait_ms = wait.as_millis() as u64, "rate limiter delaying caller");
        self.clock.sleep(wait).await;
        wait
    }

    /// Takes one token only if it is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.clock.now());

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available after refill.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.clock.now());
        bucket.tokens
    }

    /// Copy of the bucket state.
    pub async fn snapshot(&self) -> TokenBucket {
        self.bucket.lock().await.clone()
    }
}
