//! Turns completed status checks into notifications.
//!
//! ```text
//! JobEvent::Completed ──▶ load job result ──▶ status changed? ──▶ DeliveryQueue
//! ```
//!
//! The first observation of a provider only becomes a notification when the
//! provider is not operational; after that every change is announced.

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vigil_core::{
    models::fields, DocumentStore, EventHandler, Filter, Job, JobEvent, JobId, JOBS_COLLECTION,
};
use vigil_delivery::{
    ChannelKind, DeliveryJob, DeliveryPayload, DeliveryQueue, MemorySubscriptionRegistry,
};

use crate::status::ProviderStatus;

/// Event name of status-change notifications.
pub const STATUS_CHANGED_EVENT: &str = "provider.status_changed";

/// Event handler that enqueues a notification whenever a provider's status
/// changes.
#[derive(Debug)]
pub struct StatusNotifier {
    store: Arc<dyn DocumentStore>,
    registry: Arc<MemorySubscriptionRegistry>,
    queue: Arc<DeliveryQueue>,
    last_status: Mutex<HashMap<String, String>>,
}

impl StatusNotifier {
    /// Creates a notifier reading job results from `store`.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<MemorySubscriptionRegistry>,
        queue: Arc<DeliveryQueue>,
    ) -> Self {
        Self { store, registry, queue, last_status: Mutex::new(HashMap::new()) }
    }

    /// Last status seen for `provider`.
    pub async fn last_status(&self, provider: &str) -> Option<String> {
        self.last_status.lock().await.get(provider).cloned()
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let documents = self
            .store
            .query(
                JOBS_COLLECTION,
                vec![Filter::eq(fields::ID, job_id.to_string())],
                Vec::new(),
                Some(1),
            )
            .await
            .context("job lookup failed")?;

        documents
            .into_iter()
            .next()
            .map(Job::from_document)
            .transpose()
            .context("stored job is malformed")
    }

    async fn on_completed(&self, job_id: JobId) -> Result<()> {
        let Some(job) = self.load_job(job_id).await? else {
            debug!(%job_id, "completed job already removed");
            return Ok(());
        };
        let Some(result) = job.result.as_ref() else {
            return Ok(());
        };
        let Some(status) = result.get("status").and_then(|s| s.as_str()) else {
            debug!(%job_id, "job result carries no status");
            return Ok(());
        };
        let provider = job.payload_key.clone();

        // Held until the change is queued, so a failed enqueue leaves it unannounced.
        let mut last_status = self.last_status.lock().await;
        let previous = last_status.get(&provider).cloned();
        let changed = match previous.as_deref() {
            Some(previous) => previous != status,
            None => status != ProviderStatus::Operational.as_str(),
        };
        if !changed {
            last_status.insert(provider, status.to_string());
            return Ok(());
        }

        let targets = self.registry.active_targets(ChannelKind::Webhook).await;
        if targets.is_empty() {
            debug!(provider = %provider, status, "status changed but nobody is subscribed");
            last_status.insert(provider, status.to_string());
            return Ok(());
        }

        let now = Utc::now();
        let parsed = ProviderStatus::from_name(status);
        let payload = DeliveryPayload {
            event_type: STATUS_CHANGED_EVENT.to_string(),
            provider_id: provider.clone(),
            status: status.to_string(),
            message: result.get("description").and_then(|d| d.as_str()).map(str::to_string),
            occurred_at: now,
            data: json!({ "previous_status": previous, "job_id": job_id.to_string() }),
        };

        let recipients = targets.len();
        let delivery_id = self
            .queue
            .enqueue(DeliveryJob::new(targets, payload, parsed.notification_priority(), now))
            .await
            .context("failed to enqueue notification")?;
        last_status.insert(provider.clone(), status.to_string());
        drop(last_status);

        info!(
            provider = %provider,
            status,
            previous = previous.as_deref().unwrap_or("none"),
            recipients,
            delivery_id = %delivery_id,
            "status change queued for delivery"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for StatusNotifier {
    async fn handle_event(&self, event: JobEvent) {
        if let JobEvent::Completed { job_id, .. } = event {
            if let Err(e) = self.on_completed(job_id).await {
                warn!(%job_id, error = %e, "status notification skipped");
            }
        }
    }
}
