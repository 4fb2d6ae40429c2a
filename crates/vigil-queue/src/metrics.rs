//! Queue depth sampling and health classification.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_core::Clock;

use crate::{
    config::WorkerPoolConfig,
    error::Result,
    store::{JobStore, StateCounts},
    worker_pool::WorkerPoolManager,
};

/// Waiting jobs above which an idle queue is critical.
const CRITICAL_BACKLOG: usize = 100;

/// Failed-to-completed ratio above which the queue is degraded.
const DEGRADED_FAILURE_RATIO: f64 = 0.1;

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Jobs waiting to be claimed.
    pub waiting_count: usize,
    /// Jobs being processed.
    pub active_count: usize,
    /// Jobs completed and not yet cleaned up.
    pub completed_count: usize,
    /// Jobs failed and not yet cleaned up.
    pub failed_count: usize,
    /// Registered workers.
    pub worker_count: usize,
    /// Completions per minute over the throughput window.
    pub throughput_per_minute: f64,
    /// When the sample was taken.
    pub sampled_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// State counts the snapshot was built from.
    pub fn counts(&self) -> StateCounts {
        StateCounts {
            waiting: self.waiting_count,
            active: self.active_count,
            completed: self.completed_count,
            failed: self.failed_count,
        }
    }

    /// Health derived from the snapshot's counts.
    pub fn health(&self) -> Health {
        Health::classify(&self.counts())
    }
}

/// Coarse queue health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Work is flowing.
    Healthy,
    /// Too many jobs are failing.
    Degraded,
    /// A backlog exists and nothing is processing it.
    Critical,
}

impl Health {
    /// Classifies queue health from state counts.
    ///
    /// Critical when nothing is active while more than 100 jobs wait;
    /// otherwise degraded when failures exceed 10% of completions.
    pub fn classify(counts: &StateCounts) -> Self {
        if counts.active == 0 && counts.waiting > CRITICAL_BACKLOG {
            Self::Critical
        } else if counts.failed as f64 > DEGRADED_FAILURE_RATIO * counts.completed as f64 {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Samples queue counts from the store.
#[derive(Debug)]
pub struct MetricsCollector {
    store: Arc<JobStore>,
    config: Arc<WorkerPoolConfig>,
    clock: Arc<dyn Clock>,
    latest: RwLock<Option<MetricsSnapshot>>,
}

impl MetricsCollector {
    /// Creates a collector with no sample yet.
    pub fn new(store: Arc<JobStore>, config: Arc<WorkerPoolConfig>, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock, latest: RwLock::new(None) }
    }

    /// Takes a fresh sample and remembers it as the latest.
    ///
    /// # Errors
    ///
    /// Returns the first store error hit while counting.
    pub async fn collect(&self, worker_count: usize) -> Result<MetricsSnapshot> {
        let counts = self.store.counts().await?;
        let now = self.clock.now_utc();

        let window = self.config.throughput_window;
        let throughput_per_minute = match chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        {
            Some(since) if !window.is_zero() => {
                let completed = self.store.completed_since(since).await?;
                completed as f64 * 60.0 / window.as_secs_f64()
            },
            _ => 0.0,
        };

        let snapshot = MetricsSnapshot {
            waiting_count: counts.waiting,
            active_count: counts.active,
            completed_count: counts.completed,
            failed_count: counts.failed,
            worker_count,
            throughput_per_minute,
            sampled_at: now,
        };

        *self.latest.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Most recent sample, if any.
    pub async fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest.read().await.clone()
    }

    /// Samples every `metrics_interval` until cancelled.
    pub async fn run(&self, pool: Arc<WorkerPoolManager>, cancellation_token: CancellationToken) {
        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.metrics_interval) => {}
                () = cancellation_token.cancelled() => break,
            }

            match self.collect(pool.worker_count().await).await {
                Ok(snapshot) => {
                    let health = snapshot.health();
                    debug!(
                        waiting = snapshot.waiting_count,
                        active = snapshot.active_count,
                        completed = snapshot.completed_count,
                        failed = snapshot.failed_count,
                        workers = snapshot.worker_count,
                        throughput_per_minute = snapshot.throughput_per_minute,
                        %health,
                        "queue metrics sampled"
                    );
                    if health != Health::Healthy {
                        warn!(%health, waiting = snapshot.waiting_count, failed = snapshot.failed_count, "queue health check");
                    }
                },
                Err(e) => warn!(error = %e, "metrics sampling failed"),
            }
        }
    }
}
