//! Subscription registry boundary and in-memory implementation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::{DeliveryError, Result},
    models::{ChannelKind, Target},
};

/// Source of delivery targets and their health bookkeeping.
#[async_trait::async_trait]
pub trait SubscriptionRegistry: Send + Sync + std::fmt::Debug {
    /// Whether the subscription exists and is enabled.
    async fn is_active(&self, subscription_id: &str) -> Result<bool>;

    /// Deletes subscriptions; returns how many existed.
    async fn remove_batch(&self, subscription_ids: &[String]) -> Result<usize>;

    /// Records a failed delivery; returns the cumulative failure count.
    async fn record_failure(&self, subscription_id: &str) -> Result<u32>;

    /// Records a successful delivery, resetting the failure count.
    async fn record_success(&self, subscription_id: &str) -> Result<()>;

    /// Disables a subscription without deleting it.
    async fn disable(&self, subscription_id: &str) -> Result<()>;
}

/// A notification subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription id.
    pub id: String,
    /// Transport.
    pub channel: ChannelKind,
    /// URL, email address or push token.
    pub address: String,
    /// Webhook signing secret.
    pub secret: Option<String>,
    /// Disabled subscriptions receive nothing.
    pub active: bool,
    /// Failed deliveries since the last success.
    pub failure_count: u32,
}

impl Subscription {
    /// Creates an active subscription.
    pub fn new(id: impl Into<String>, channel: ChannelKind, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            channel,
            address: address.into(),
            secret: None,
            active: true,
            failure_count: 0,
        }
    }

    /// Attaches a signing secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Delivery target for this subscription.
    pub fn target(&self) -> Target {
        Target {
            subscription_id: self.id.clone(),
            channel: self.channel,
            address: self.address.clone(),
            secret: self.secret.clone(),
        }
    }
}

/// Registry held in process memory.
#[derive(Debug, Default)]
pub struct MemorySubscriptionRegistry {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl MemorySubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a subscription.
    pub async fn insert(&self, subscription: Subscription) {
        self.subscriptions.write().await.insert(subscription.id.clone(), subscription);
    }

    /// Looks a subscription up.
    pub async fn get(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions.read().await.get(subscription_id).cloned()
    }

    /// Number of subscriptions, disabled ones included.
    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Whether the registry holds no subscriptions.
    pub async fn is_empty(&self) -> bool {
        self.subscriptions.read().await.is_empty()
    }

    /// Targets of every active subscription on `channel`, sorted by id.
    pub async fn active_targets(&self, channel: ChannelKind) -> Vec<Target> {
        let mut targets: Vec<_> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.active && s.channel == channel)
            .map(Subscription::target)
            .collect();
        targets.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        targets
    }
}

#[async_trait::async_trait]
impl SubscriptionRegistry for MemorySubscriptionRegistry {
    async fn is_active(&self, subscription_id: &str) -> Result<bool> {
        Ok(self.subscriptions.read().await.get(subscription_id).is_some_and(|s| s.active))
    }

    async fn remove_batch(&self, subscription_ids: &[String]) -> Result<usize> {
        let mut subscriptions = self.subscriptions.write().await;
        let removed = subscription_ids.iter().filter(|id| subscriptions.remove(*id).is_some()).count();
        debug!(requested = subscription_ids.len(), removed, "removed subscriptions");
        Ok(removed)
    }

    async fn record_failure(&self, subscription_id: &str) -> Result<u32> {
        let mut subscriptions = self.subscriptions.write().await;
        let subscription = subscriptions.get_mut(subscription_id).ok_or_else(|| {
            DeliveryError::registry(format!("subscription {subscription_id} not found"))
        })?;
        subscription.failure_count = subscription.failure_count.saturating_add(1);
        Ok(subscription.failure_count)
    }

    async fn record_success(&self, subscription_id: &str) -> Result<()> {
        if let Some(subscription) = self.subscriptions.write().await.get_mut(subscription_id) {
            subscription.failure_count = 0;
        }
        Ok(())
    }

    async fn disable(&self, subscription_id: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let subscription = subscriptions.get_mut(subscription_id).ok_or_else(|| {
            DeliveryError::registry(format!("subscription {subscription_id} not found"))
        })?;
        subscription.active = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failure_count_accumulates_and_resets() {
        let registry = MemorySubscriptionRegistry::new();
        registry.insert(Subscription::new("s1", ChannelKind::Email, "ops@example.com")).await;

        assert_eq!(registry.record_failure("s1").await.unwrap(), 1);
        assert_eq!(registry.record_failure("s1").await.unwrap(), 2);
        registry.record_success("s1").await.unwrap();
        assert_eq!(registry.get("s1").await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn disabled_and_removed_subscriptions_are_inactive() {
        let registry = MemorySubscriptionRegistry::new();
        registry.insert(Subscription::new("s1", ChannelKind::Push, "tok-1")).await;
        registry.insert(Subscription::new("s2", ChannelKind::Push, "tok-2")).await;

        registry.disable("s1").await.unwrap();
        assert!(!registry.is_active("s1").await.unwrap());

        let removed = registry.remove_batch(&["s2".to_string(), "ghost".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!registry.is_active("s2").await.unwrap());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_subscription_failure_is_an_error() {
        let registry = MemorySubscriptionRegistry::new();
        assert!(matches!(
            registry.record_failure("ghost").await,
            Err(DeliveryError::Registry { .. })
        ));
    }
}
