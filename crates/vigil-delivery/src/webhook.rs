//! Signed webhook channel over HTTP.
//!
//! Posts the JSON payload to every target concurrently. Each request
//! carries the event name, a timestamp, the retry count, a per-request
//! delivery id and, when the subscription has a secret, an HMAC signature
//! of the exact body bytes.
//!
//! Status mapping:
//!
//! | Response                 | Outcome                     |
//! |--------------------------|-----------------------------|
//! | 2xx                      | delivered                   |
//! | 404, 410                 | invalid (subscription gone) |
//! | 429, 5xx, timeout, I/O   | retryable failure           |
//! | other 4xx                | permanent failure           |

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    channel::{BatchOutcome, DeliveryChannel, TargetOutcome, TargetResult},
    error::{DeliveryError, Result},
    models::{ChannelKind, DeliveryPayload, Target},
    signing::sign_payload,
};

/// Signature header.
pub const SIGNATURE_HEADER: &str = "X-Vigil-Signature";
/// Event name header.
pub const EVENT_HEADER: &str = "X-Vigil-Event";
/// Send time header (unix seconds).
pub const TIMESTAMP_HEADER: &str = "X-Vigil-Timestamp";
/// Retry count header.
pub const RETRY_COUNT_HEADER: &str = "X-Vigil-Retry-Count";
/// Per-request id header.
pub const DELIVERY_ID_HEADER: &str = "X-Vigil-Delivery-Id";

/// Webhook client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Redirects followed before giving up.
    pub max_redirects: u32,
    /// Requests in flight per batch.
    pub max_concurrency: usize,
    /// Targets accepted per `send_batch` call.
    pub max_batch_size: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: "Vigil-Webhook/1.0".to_string(),
            max_redirects: 3,
            max_concurrency: 16,
            max_batch_size: 100,
        }
    }
}

/// Webhook delivery channel.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookChannel {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the client cannot be built.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    async fn send_one(
        &self,
        target: &Target,
        body: &Bytes,
        event_type: &str,
        timestamp: &str,
        attempt: u32,
    ) -> TargetOutcome {
        let delivery_id = Uuid::new_v4();
        let mut request = self
            .client
            .post(&target.address)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, event_type)
            .header(TIMESTAMP_HEADER, timestamp)
            .header(RETRY_COUNT_HEADER, attempt.to_string())
            .header(DELIVERY_ID_HEADER, delivery_id.to_string())
            .body(body.clone());

        if let Some(secret) = target.secret.as_deref() {
            match sign_payload(body, secret) {
                Ok(signature) => request = request.header(SIGNATURE_HEADER, signature),
                Err(e) => {
                    return TargetOutcome::Failed { error: e.to_string(), retryable: false };
                },
            }
        }

        let span = info_span!(
            "webhook_delivery",
            subscription_id = %target.subscription_id,
            delivery_id = %delivery_id,
            attempt
        );

        async move {
            match request.send().await {
                Ok(response) => {
                    let status_code = response.status().as_u16();
                    debug!(status = status_code, "webhook response received");
                    classify_status(status_code)
                },
                Err(e) if e.is_builder() => {
                    warn!(error = %e, "webhook url rejected");
                    TargetOutcome::Invalid { reason: format!("invalid webhook url: {e}") }
                },
                Err(e) if e.is_timeout() => {
                    let error = DeliveryError::Timeout { timeout: self.config.timeout };
                    warn!(error = %error, "webhook request timed out");
                    TargetOutcome::Failed { error: error.to_string(), retryable: true }
                },
                Err(e) => {
                    let error = DeliveryError::network(e.to_string());
                    warn!(error = %error, "webhook request failed");
                    TargetOutcome::Failed { error: error.to_string(), retryable: true }
                },
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait::async_trait]
impl DeliveryChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    async fn send_batch(
        &self,
        targets: &[Target],
        payload: &DeliveryPayload,
        attempt: u32,
    ) -> Result<BatchOutcome> {
        let body = serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(|e| DeliveryError::invalid_input(format!("payload not serializable: {e}")))?;
        let timestamp = Utc::now().timestamp().to_string();
        let (body, timestamp) = (&body, timestamp.as_str());
        let event_type = payload.event_type.as_str();

        let sends: Vec<_> = targets
            .iter()
            .map(|target| async move {
                let outcome = self.send_one(target, body, event_type, timestamp, attempt).await;
                TargetResult::new(target, outcome)
            })
            .collect();

        let results: Vec<TargetResult> = stream::iter(sends)
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        Ok(BatchOutcome::from_results(results))
    }
}

/// Maps an HTTP status to a target outcome.
pub fn classify_status(status_code: u16) -> TargetOutcome {
    match status_code {
        200..=299 => TargetOutcome::Delivered,
        404 | 410 => TargetOutcome::Invalid { reason: format!("endpoint returned {status_code}") },
        _ => {
            let error = DeliveryError::Http { status_code };
            TargetOutcome::Failed { retryable: error.is_retryable(), error: error.to_string() }
        },
    }
}
