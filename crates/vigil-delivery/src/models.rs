//! Delivery job model.
//!
//! Delivery jobs live only in memory: a process restart loses whatever was
//! queued. Notifications are best effort and at most once per target.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of one notification, shared by every retry of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Generates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport a target is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Signed HTTP POST.
    Webhook,
    /// Email.
    Email,
    /// Mobile or browser push.
    Push,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Webhook => write!(f, "webhook"),
            Self::Email => write!(f, "email"),
            Self::Push => write!(f, "push"),
        }
    }
}

/// One recipient of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Subscription this target came from.
    pub subscription_id: String,
    /// Transport.
    pub channel: ChannelKind,
    /// URL, email address or push token.
    pub address: String,
    /// Signing secret for webhook targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Target {
    /// Creates an unsigned target.
    pub fn new(
        subscription_id: impl Into<String>,
        channel: ChannelKind,
        address: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            channel,
            address: address.into(),
            secret: None,
        }
    }

    /// Attaches a signing secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// Body of a status notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    /// Event name, e.g. `provider.status_changed`.
    pub event_type: String,
    /// Provider the event is about.
    pub provider_id: String,
    /// New provider status.
    pub status: String,
    /// Human-readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the status change was observed.
    pub occurred_at: DateTime<Utc>,
    /// Extra event data.
    #[serde(default)]
    pub data: Value,
}

/// A notification waiting to be delivered to its remaining targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Notification id.
    pub id: DeliveryId,
    /// Targets not yet delivered.
    pub targets: Vec<Target>,
    /// Higher is sent first.
    pub priority: i32,
    /// Failed passes so far.
    pub retry_count: u32,
    /// When the notification was first queued.
    pub created_at: DateTime<Utc>,
    /// Earliest time of the next attempt.
    pub not_before: Option<DateTime<Utc>>,
    /// Notification body.
    pub payload: DeliveryPayload,
}

impl DeliveryJob {
    /// Creates a job ready for immediate delivery.
    pub fn new(
        targets: Vec<Target>,
        payload: DeliveryPayload,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            targets,
            priority,
            retry_count: 0,
            created_at,
            not_before: None,
            payload,
        }
    }

    /// Whether the job may be attempted at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |not_before| not_before <= now)
    }

    /// Copy of this job restricted to `targets`.
    #[must_use]
    pub fn with_targets(&self, targets: Vec<Target>) -> Self {
        Self { targets, ..self.clone() }
    }
}
