//! Test support for the vigil crates.
//!
//! Provides a failure-injecting document store, scripted job handlers and
//! delivery channels, an event recorder with deterministic waits, and
//! fixture builders. Integration tests across the workspace build on these
//! instead of repeating their own doubles.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Arc;

pub mod channel;
pub mod events;
pub mod fixtures;
pub mod handler;
pub mod store;

pub use channel::{ChannelCall, ScriptedChannel};
pub use events::RecordingEventHandler;
pub use fixtures::{registry_with_subscriptions, status_payload, test_config};
pub use handler::ScriptedHandler;
pub use store::FlakyStore;
pub use vigil_core::{store::memory::MemoryDocumentStore, Clock, RealClock, TestClock};

/// Installs a test-writer tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to errors only so test output stays quiet.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}

/// Shared real clock, for tests that run the engine's background loops.
pub fn real_clock() -> Arc<dyn Clock> {
    Arc::new(RealClock::new())
}
