//! Vigil service wiring.
//!
//! The binary in `main.rs` composes the library crates into a running
//! service: provider status checks run as jobs on the
//! [`vigil_queue::JobQueueEngine`], and status changes are fanned out to
//! webhook subscribers through a [`vigil_delivery::DeliveryQueue`].
//!
//! - [`config`]: layered configuration (defaults, `vigil.toml`, `VIGIL_*`)
//! - [`status`]: the status-check job handler
//! - [`notifier`]: the event handler bridging completed checks to delivery

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod notifier;
pub mod status;

pub use config::{Config, LogFormat, ProviderConfig, WebhookSubscriptionConfig};
pub use notifier::{StatusNotifier, STATUS_CHANGED_EVENT};
pub use status::{ProviderStatus, StatusCheckHandler};
