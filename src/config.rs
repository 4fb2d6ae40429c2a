//! Service configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use vigil_delivery::{ChannelKind, DeliveryConfig, Subscription, WebhookConfig};
use vigil_queue::WorkerPoolConfig;

const CONFIG_FILE: &str = "vigil.toml";
const ENV_PREFIX: &str = "VIGIL_";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `VIGIL_` (highest priority)
/// 2. Configuration file (`vigil.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Providers and webhook subscriptions are lists and are only practical to
/// set from the file:
///
/// ```toml
/// [[providers]]
/// id = "github"
/// status_url = "https://www.githubstatus.com/api/v2/status.json"
///
/// [[subscriptions]]
/// id = "ops-team"
/// url = "https://hooks.example.com/vigil"
/// secret = "whsec_..."
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Engine
    /// Workers started at boot.
    ///
    /// Environment variable: `VIGIL_WORKER_COUNT`
    pub worker_count: usize,
    /// Jobs each worker runs concurrently.
    ///
    /// Environment variable: `VIGIL_WORKER_CONCURRENCY`
    pub worker_concurrency: usize,
    /// Requeues allowed before a status check is marked failed.
    ///
    /// Environment variable: `VIGIL_MAX_RETRIES`
    pub max_retries: u32,
    /// Waiting plus active jobs the engine accepts.
    ///
    /// Environment variable: `VIGIL_MAX_QUEUE_SIZE`
    pub max_queue_size: usize,
    /// Worker poll tick in milliseconds.
    ///
    /// Environment variable: `VIGIL_POLL_INTERVAL_MS`
    pub poll_interval_ms: u64,
    /// Seconds a job may stay active before it counts as stalled.
    ///
    /// Environment variable: `VIGIL_STALLED_INTERVAL_SECONDS`
    pub stalled_interval_seconds: u64,
    /// Store operations admitted per second.
    ///
    /// Environment variable: `VIGIL_RATE_LIMIT_PER_SECOND`
    pub rate_limit_per_second: f64,
    /// Consecutive store failures that open the circuit.
    ///
    /// Environment variable: `VIGIL_CIRCUIT_BREAKER_THRESHOLD`
    pub circuit_breaker_threshold: u32,
    /// Seconds the store circuit stays open.
    ///
    /// Environment variable: `VIGIL_CIRCUIT_BREAKER_TIMEOUT_SECONDS`
    pub circuit_breaker_timeout_seconds: u64,
    /// Seconds a graceful shutdown waits for active jobs.
    ///
    /// Environment variable: `VIGIL_SHUTDOWN_WAIT_SECONDS`
    pub shutdown_wait_seconds: u64,
    /// Days finished jobs are retained; 0 keeps them forever.
    ///
    /// Environment variable: `VIGIL_RETENTION_DAYS`
    pub retention_days: u64,

    // Status checks
    /// Seconds between status-check rounds over every provider.
    ///
    /// Environment variable: `VIGIL_CHECK_INTERVAL_SECONDS`
    pub check_interval_seconds: u64,
    /// Timeout of one status-page request in seconds.
    ///
    /// Environment variable: `VIGIL_CHECK_TIMEOUT_SECONDS`
    pub check_timeout_seconds: u64,
    /// Providers to watch.
    pub providers: Vec<ProviderConfig>,

    // Delivery
    /// Jobs per delivery batch.
    ///
    /// Environment variable: `VIGIL_DELIVERY_BATCH_SIZE`
    pub delivery_batch_size: usize,
    /// Channel calls in flight during a delivery pass.
    ///
    /// Environment variable: `VIGIL_DELIVERY_MAX_CONCURRENT_BATCHES`
    pub delivery_max_concurrent_batches: usize,
    /// Milliseconds between delivery passes.
    ///
    /// Environment variable: `VIGIL_DELIVERY_INTERVAL_MS`
    pub delivery_interval_ms: u64,
    /// Deadline of one delivery pass in seconds.
    ///
    /// Environment variable: `VIGIL_DELIVERY_PASS_TIMEOUT_SECONDS`
    pub delivery_pass_timeout_seconds: u64,
    /// Failed passes before a notification is dropped.
    ///
    /// Environment variable: `VIGIL_DELIVERY_MAX_RETRIES`
    pub delivery_max_retries: u32,
    /// Cumulative failures that disable a subscription.
    ///
    /// Environment variable: `VIGIL_DISABLE_AFTER_FAILURES`
    pub disable_after_failures: u32,
    /// Channel calls admitted per second.
    ///
    /// Environment variable: `VIGIL_DELIVERY_RATE_LIMIT_PER_SECOND`
    pub delivery_rate_limit_per_second: f64,
    /// Webhook request timeout in seconds.
    ///
    /// Environment variable: `VIGIL_WEBHOOK_TIMEOUT_SECONDS`
    pub webhook_timeout_seconds: u64,
    /// Webhook subscriptions registered at boot.
    pub subscriptions: Vec<WebhookSubscriptionConfig>,

    // Observability
    /// Log line format.
    ///
    /// Environment variable: `VIGIL_LOG_FORMAT` (`pretty` or `json`)
    pub log_format: LogFormat,
    /// Tracing filter used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `VIGIL_RUST_LOG`
    pub rust_log: String,
}

/// A provider whose status page is polled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider id, used as the job key.
    pub id: String,
    /// Status endpoint returning a Statuspage-style JSON summary.
    pub status_url: String,
}

/// A webhook subscriber registered at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscriptionConfig {
    /// Subscription id.
    pub id: String,
    /// Endpoint notifications are POSTed to.
    pub url: String,
    /// HMAC secret; unsigned when absent.
    #[serde(default)]
    pub secret: Option<String>,
}

impl WebhookSubscriptionConfig {
    /// Registry entry for this subscriber.
    pub fn to_subscription(&self) -> Subscription {
        let subscription = Subscription::new(&self.id, ChannelKind::Webhook, &self.url);
        match &self.secret {
            Some(secret) => subscription.with_secret(secret),
            None => subscription,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl Config {
    /// Loads configuration from defaults, `vigil.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Fails when a source cannot be parsed or the merged values are invalid.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Loads configuration from an explicit TOML document layered over the
    /// defaults, ignoring the environment.
    ///
    /// # Errors
    ///
    /// Fails when the document cannot be parsed or the values are invalid.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(
            Figment::new().merge(Serialized::defaults(Self::default())).merge(Toml::string(toml)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Engine settings.
    pub fn to_worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.worker_concurrency,
            max_retries: self.max_retries,
            max_queue_size: self.max_queue_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stalled_interval: Duration::from_secs(self.stalled_interval_seconds),
            rate_limit_per_second: self.rate_limit_per_second,
            circuit_breaker_threshold: self.circuit_breaker_threshold,
            circuit_breaker_timeout: Duration::from_secs(self.circuit_breaker_timeout_seconds),
            shutdown_wait: Duration::from_secs(self.shutdown_wait_seconds),
            ..WorkerPoolConfig::default()
        }
    }

    /// Delivery queue settings.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            batch_size: self.delivery_batch_size,
            max_concurrent_batches: self.delivery_max_concurrent_batches,
            process_interval: Duration::from_millis(self.delivery_interval_ms),
            pass_timeout: Duration::from_secs(self.delivery_pass_timeout_seconds),
            max_retries: self.delivery_max_retries,
            disable_after_failures: self.disable_after_failures,
            rate_limit_per_second: self.delivery_rate_limit_per_second,
            ..DeliveryConfig::default()
        }
    }

    /// Webhook channel settings.
    pub fn to_webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            timeout: Duration::from_secs(self.webhook_timeout_seconds),
            ..WebhookConfig::default()
        }
    }

    /// Retention window for finished jobs, if any.
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0).then(|| Duration::from_secs(self.retention_days * 24 * 60 * 60))
    }

    /// Validates values the library configs do not cover.
    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.check_interval_seconds == 0 {
            anyhow::bail!("check_interval_seconds must be greater than 0");
        }

        if self.check_timeout_seconds == 0 {
            anyhow::bail!("check_timeout_seconds must be greater than 0");
        }

        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                anyhow::bail!("provider id must not be empty");
            }
            if provider.status_url.trim().is_empty() {
                anyhow::bail!("provider {} has no status_url", provider.id);
            }
        }

        if let Some(duplicate) = first_duplicate(self.providers.iter().map(|p| p.id.as_str())) {
            anyhow::bail!("provider {duplicate} is configured twice");
        }

        if let Some(duplicate) = first_duplicate(self.subscriptions.iter().map(|s| s.id.as_str())) {
            anyhow::bail!("subscription {duplicate} is configured twice");
        }

        self.to_worker_pool_config().validate().context("invalid engine configuration")?;
        self.to_delivery_config().validate().context("invalid delivery configuration")?;

        Ok(())
    }
}

fn first_duplicate<'a>(ids: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().find(|id| !seen.insert(*id))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 2,
            worker_concurrency: 5,
            max_retries: 3,
            max_queue_size: 10_000,
            poll_interval_ms: 1_000,
            stalled_interval_seconds: 300,
            rate_limit_per_second: 50.0,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_seconds: 60,
            shutdown_wait_seconds: 30,
            retention_days: 7,
            check_interval_seconds: 60,
            check_timeout_seconds: 10,
            providers: Vec::new(),
            delivery_batch_size: 50,
            delivery_max_concurrent_batches: 4,
            delivery_interval_ms: 1_000,
            delivery_pass_timeout_seconds: 30,
            delivery_max_retries: 5,
            disable_after_failures: 10,
            delivery_rate_limit_per_second: 20.0,
            webhook_timeout_seconds: 10,
            subscriptions: Vec::new(),
            log_format: LogFormat::Pretty,
            rust_log: "info,vigil=debug".to_string(),
        }
    }
}
