//! Resilient job queue engine.
//!
//! Accepts provider status-check jobs, persists them through a
//! `DocumentStore`, and schedules them onto a pool of polling workers. Every
//! store call is protected by a shared circuit breaker, mutating calls pass a
//! token-bucket rate limiter, and submissions are gated by backpressure.
//!
//! # Architecture
//!
//! ```text
//!  queue_job / queue_batch
//!          │
//!          ▼
//! ┌────────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ JobQueueEngine │──▶│ Backpressure │──▶│   JobStore    │
//! └────────────────┘   └──────────────┘   │ (limiter,     │
//!          │                              │  breaker,     │
//!          ▼                              │  retry loop)  │
//! ┌────────────────┐   claim / write-back └───────────────┘
//! │ WorkerPool     │──────────────────────────▲   ▲
//! └────────────────┘                          │   │
//! ┌────────────────┐   reclaim stalled        │   │
//! │ StalledReaper  │──────────────────────────┘   │
//! └────────────────┘                              │
//! ┌────────────────┐   counts                     │
//! │ Metrics        │──────────────────────────────┘
//! └────────────────┘
//! ```
//!
//! Claiming is a conditional update on `state == waiting`, so two workers
//! racing for one job cannot both win.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backpressure;
pub mod circuit;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod rate_limit;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod worker;
pub mod worker_pool;

pub use backpressure::{Admission, BackpressureController};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState, CircuitStats};
pub use config::WorkerPoolConfig;
pub use engine::{JobQueueEngine, QueueStatus, StatusDetails};
pub use error::{ErrorCategory, QueueError, Result};
pub use handler::{JobError, JobHandler};
pub use metrics::{Health, MetricsCollector, MetricsSnapshot};
pub use rate_limit::RateLimiter;
pub use reaper::{ReapOutcome, StalledJobReaper};
pub use retry::RetryPolicy;
pub use store::{JobStore, StateCounts};
pub use worker::{Worker, WorkerShared, WorkerStats};
pub use worker_pool::WorkerPoolManager;
