//! Provider status checks.
//!
//! Each job key names a provider. The handler fetches the provider's
//! Statuspage-style summary (`{"status": {"indicator", "description"}}`) and
//! returns a normalized result document:
//!
//! ```json
//! {"provider": "github", "status": "degraded", "description": "...", "checked_at": "..."}
//! ```

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info_span, Instrument};
use vigil_core::Job;
use vigil_queue::{JobError, JobHandler};

use crate::config::ProviderConfig;

/// Normalized provider status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    /// No incidents.
    Operational,
    /// Minor incident.
    Degraded,
    /// Major incident.
    PartialOutage,
    /// Critical incident.
    MajorOutage,
    /// Maintenance or an indicator we do not know.
    Unknown,
}

impl ProviderStatus {
    /// Maps a Statuspage indicator.
    pub fn from_indicator(indicator: &str) -> Self {
        match indicator {
            "none" => Self::Operational,
            "minor" => Self::Degraded,
            "major" => Self::PartialOutage,
            "critical" => Self::MajorOutage,
            _ => Self::Unknown,
        }
    }

    /// Parses a name produced by [`ProviderStatus::as_str`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "operational" => Self::Operational,
            "degraded" => Self::Degraded,
            "partial_outage" => Self::PartialOutage,
            "major_outage" => Self::MajorOutage,
            _ => Self::Unknown,
        }
    }

    /// Name used in result documents and notifications.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Degraded => "degraded",
            Self::PartialOutage => "partial_outage",
            Self::MajorOutage => "major_outage",
            Self::Unknown => "unknown",
        }
    }

    /// Delivery priority of a notification about this status.
    pub fn notification_priority(self) -> i32 {
        match self {
            Self::MajorOutage => 10,
            Self::PartialOutage => 5,
            Self::Degraded => 1,
            Self::Operational | Self::Unknown => 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusSummary {
    status: StatusIndicator,
}

#[derive(Debug, Deserialize)]
struct StatusIndicator {
    indicator: String,
    #[serde(default)]
    description: Option<String>,
}

/// Job handler that polls provider status pages over HTTP.
#[derive(Debug, Clone)]
pub struct StatusCheckHandler {
    client: reqwest::Client,
    providers: HashMap<String, String>,
}

impl StatusCheckHandler {
    /// Builds the handler for `providers`.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn new(providers: &[ProviderConfig], timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Vigil-StatusCheck/1.0")
            .build()?;
        let providers = providers.iter().map(|p| (p.id.clone(), p.status_url.clone())).collect();
        Ok(Self { client, providers })
    }

    async fn fetch(&self, provider: &str, url: &str) -> Result<Value, JobError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_builder() {
                JobError::permanent(format!("invalid status url for {provider}: {e}"))
            } else {
                JobError::retryable(format!("status request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(JobError::permanent(format!("status page not found for {provider}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(JobError::retryable(format!("status page answered {status}")));
        }
        if !status.is_success() {
            return Err(JobError::from_message(format!("status page answered {status}")));
        }

        let summary: StatusSummary = response
            .json()
            .await
            .map_err(|e| JobError::permanent(format!("malformed status summary: {e}")))?;
        let normalized = ProviderStatus::from_indicator(&summary.status.indicator);
        debug!(provider, status = normalized.as_str(), "status fetched");

        Ok(json!({
            "provider": provider,
            "status": normalized.as_str(),
            "description": summary.status.description,
            "checked_at": Utc::now().to_rfc3339(),
        }))
    }
}

#[async_trait]
impl JobHandler for StatusCheckHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let provider = job.payload_key.as_str();
        let Some(url) = self.providers.get(provider) else {
            return Err(JobError::permanent(format!("unsupported provider {provider}")));
        };

        self.fetch(provider, url)
            .instrument(info_span!("status_check", provider, job_id = %job.id))
            .await
    }
}
