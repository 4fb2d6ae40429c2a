//! Core domain models, time source and store boundary for the vigil job queue.
//!
//! Provides the `Job` document model and its lifecycle states, the `Clock`
//! abstraction used by every timed component, lifecycle events emitted by the
//! engine, and the `DocumentStore` adapter trait the engine persists through.
//! All other crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod store;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    EventHandler, FailureReason, JobEvent, MulticastEventHandler, NoOpEventHandler,
};
pub use models::{Job, JobId, JobMetadata, JobState, JOBS_COLLECTION};
pub use store::{Document, DocumentStore, Filter, FilterOp, OrderBy, SortDirection};
pub use time::{Clock, RealClock, TestClock};
