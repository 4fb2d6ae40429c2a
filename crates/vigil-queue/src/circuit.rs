//! Circuit breaker protecting one downstream dependency.
//!
//! A single breaker guards the job store for the whole engine, so a trip
//! caused by one worker stops every worker from hammering a failing store.
//! Delivery channels each own a breaker built from the same type.
//!
//! # State Machine
//!
//! ```text
//!          ┌─────────────────────────┐
//!          │         CLOSED          │
//!          │  ● all calls pass       │
//!          │  ● failures counted     │
//!          └─────────────────────────┘
//!             │                  ▲
//!  threshold  │                  │ probe succeeds
//!  failures   ▼                  │
//! ┌──────────────────┐  timeout  ┌──────────────────────┐
//! │       OPEN       │ ────────▶ │      HALF-OPEN       │
//! │ ● calls rejected │           │ ● exactly one probe  │
//! │   immediately    │ ◀──────── │ ● others rejected    │
//! └──────────────────┘  probe    └──────────────────────┘
//!                       fails
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vigil_core::RealClock;
//! use vigil_queue::circuit::{CircuitBreaker, CircuitConfig};
//!
//! # async fn example() -> vigil_queue::Result<()> {
//! let breaker = CircuitBreaker::new("job-store", CircuitConfig::default(), Arc::new(RealClock::new()));
//!
//! let rows = breaker.execute(|| async { Ok::<_, vigil_queue::QueueError>(42) }).await?;
//! assert_eq!(rows, 42);
//! # Ok(())
//! # }
//! ```

use std::{fmt, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vigil_core::Clock;

use crate::error::{QueueError, Result};

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is admitted.
    pub open_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout: Duration::from_secs(60) }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Dependency unhealthy; calls fail fast.
    Open,
    /// Cooldown elapsed; one probe decides the next state.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of breaker state for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// When the most recent failure was recorded.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// When an open circuit admits its probe, or when the running probe's
    /// slot expires.
    pub next_retry_time: Option<DateTime<Utc>>,
    /// Whether the half-open probe is currently running.
    pub probe_in_flight: bool,
}

impl CircuitStats {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_retry_time: None,
            probe_in_flight: false,
        }
    }
}

/// Thread-safe circuit breaker for a single dependency.
///
/// The mutex is held only for state transitions, never while the protected
/// operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    stats: Mutex<CircuitStats>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { name: name.into(), config, stats: Mutex::new(CircuitStats::closed()), clock }
    }

    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `op` if the breaker admits it and records the outcome.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::CircuitOpen` without invoking `op` while the
    /// circuit is open or another probe is in flight; otherwise returns
    /// whatever `op` returns.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.allow_request().await {
            return Err(QueueError::circuit_open(&self.name));
        }

        let result = op().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result
    }

    /// Decides whether a call may proceed.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits the caller as its single probe. Callers that receive `true`
    /// must report the outcome through `record_success` or `record_failure`.
    /// A probe that never reports back holds its slot for one `open_timeout`,
    /// after which another caller is admitted.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn allow_request(&self) -> bool {
        let now = self.clock.now_utc();
        let mut stats = self.stats.lock().await;

        match stats.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = stats.next_retry_time.map_or(true, |at| now >= at);
                if cooled_down {
                    info!(dependency = %self.name, "circuit breaker half-open, admitting probe");
                    stats.state = CircuitState::HalfOpen;
                    stats.probe_in_flight = true;
                    stats.next_retry_time = Some(self.deadline_from(now));
                }
                cooled_down
            },
            CircuitState::HalfOpen => {
                let lease_expired = stats.next_retry_time.map_or(true, |at| now >= at);
                if stats.probe_in_flight && !lease_expired {
                    return false;
                }
                if stats.probe_in_flight {
                    warn!(dependency = %self.name, "probe never reported back, admitting another");
                }
                stats.probe_in_flight = true;
                stats.next_retry_time = Some(self.deadline_from(now));
                true
            },
        }
    }

    /// Records a successful call.
    pub async fn record_success(&self) {
        let mut stats = self.stats.lock().await;

        match stats.state {
            CircuitState::Closed => stats.failure_count = 0,
            CircuitState::HalfOpen => {
                info!(dependency = %self.name, "circuit breaker closing, dependency recovered");
                *stats = CircuitStats {
                    last_failure_time: stats.last_failure_time,
                    ..CircuitStats::closed()
                };
            },
            CircuitState::Open => {
                debug!(dependency = %self.name, "ignoring late success on open circuit");
            },
        }
    }

    /// Records a failed call.
    pub async fn record_failure(&self) {
        let now = self.clock.now_utc();
        let mut stats = self.stats.lock().await;

        stats.failure_count = stats.failure_count.saturating_add(1);
        stats.last_failure_time = Some(now);

        match stats.state {
            CircuitState::Closed => {
                if stats.failure_count >= self.config.failure_threshold {
                    self.open(&mut stats, now);
                }
            },
            CircuitState::HalfOpen => self.open(&mut stats, now),
            CircuitState::Open => {},
        }
    }

    /// Current state without triggering a half-open transition.
    pub async fn state(&self) -> CircuitState {
        self.stats.lock().await.state
    }

    /// Snapshot of the breaker.
    pub async fn stats(&self) -> CircuitStats {
        self.stats.lock().await.clone()
    }

    /// Forces the breaker into `state`, for tests and operator overrides.
    ///
    /// Forcing `Open` starts a fresh cooldown; forcing `Closed` clears the
    /// failure count.
    pub async fn force_state(&self, state: CircuitState) {
        let now = self.clock.now_utc();
        let mut stats = self.stats.lock().await;

        match state {
            CircuitState::Closed => *stats = CircuitStats::closed(),
            CircuitState::Open => self.open(&mut stats, now),
            CircuitState::HalfOpen => {
                stats.state = CircuitState::HalfOpen;
                stats.probe_in_flight = false;
                stats.next_retry_time = None;
            },
        }
    }

    fn deadline_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.open_timeout)
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn open(&self, stats: &mut CircuitStats, now: DateTime<Utc>) {
        warn!(
            dependency = %self.name,
            failure_count = stats.failure_count,
            open_timeout_ms = self.config.open_timeout.as_millis() as u64,
            "circuit breaker opening"
        );

        stats.state = CircuitState::Open;
        stats.probe_in_flight = false;
        stats.next_retry_time = Some(self.deadline_from(now));
    }
}
