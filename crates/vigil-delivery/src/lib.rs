//! Notification delivery for vigil.
//!
//! When a status check detects a change, a [`DeliveryJob`] carrying the
//! payload and every subscribed [`Target`] is pushed onto a
//! [`DeliveryQueue`]. The queue batches targets per channel, sends them
//! through [`DeliveryChannel`] adapters behind a per-channel circuit breaker
//! and a shared rate limiter, and settles each target individually:
//!
//! - delivered targets are done and never sent again
//! - invalid targets have their subscriptions removed in one batch call
//! - retryable failures are re-enqueued with exponential backoff
//! - subscriptions that keep failing are disabled
//!
//! [`WebhookChannel`] is the HTTP adapter; bodies are signed with
//! HMAC-SHA256 when the subscription carries a secret (see [`signing`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod error;
pub mod models;
pub mod queue;
pub mod registry;
pub mod signing;
pub mod webhook;

pub use channel::{BatchOutcome, DeliveryChannel, TargetOutcome, TargetResult};
pub use config::DeliveryConfig;
pub use error::{DeliveryError, Result};
pub use models::{ChannelKind, DeliveryId, DeliveryJob, DeliveryPayload, Target};
pub use queue::{DeliveryQueue, DeliveryStats, PassReport};
pub use registry::{MemorySubscriptionRegistry, Subscription, SubscriptionRegistry};
pub use signing::{sign_payload, verify_signature};
pub use webhook::{WebhookChannel, WebhookConfig};
