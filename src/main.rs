//! Vigil provider status monitor.
//!
//! Main entry point for the Vigil service. Loads configuration, wires the job
//! queue engine to the delivery queue, schedules status-check rounds and
//! coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil::{Config, LogFormat, StatusCheckHandler, StatusNotifier};
use vigil_core::{store::memory::MemoryDocumentStore, Clock, DocumentStore, RealClock};
use vigil_delivery::{
    DeliveryQueue, MemorySubscriptionRegistry, SubscriptionRegistry, WebhookChannel,
};
use vigil_queue::{JobQueueEngine, QueueError};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    info!(
        providers = config.providers.len(),
        subscriptions = config.subscriptions.len(),
        workers = config.worker_count,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());

    let registry = Arc::new(MemorySubscriptionRegistry::new());
    for subscription in &config.subscriptions {
        registry.insert(subscription.to_subscription()).await;
    }

    let webhook = WebhookChannel::new(config.to_webhook_config())
        .context("Failed to build webhook channel")?;
    let shared_registry: Arc<dyn SubscriptionRegistry> = registry.clone();
    let delivery = Arc::new(
        DeliveryQueue::new(config.to_delivery_config(), shared_registry, clock.clone())
            .context("Invalid delivery configuration")?
            .with_channel(Arc::new(webhook)),
    );

    let handler = StatusCheckHandler::new(
        &config.providers,
        Duration::from_secs(config.check_timeout_seconds),
    )
    .context("Failed to build status-check client")?;
    let notifier = StatusNotifier::new(store.clone(), registry, delivery.clone());

    let engine = Arc::new(
        JobQueueEngine::with_components(
            store,
            Arc::new(handler),
            Arc::new(notifier),
            clock,
            config.to_worker_pool_config(),
        )
        .context("Invalid engine configuration")?,
    );
    engine.initialize().await.context("Failed to initialize job queue")?;
    delivery.start().await.context("Failed to start delivery queue")?;

    for i in 0..config.worker_count {
        engine
            .add_worker(&format!("worker-{i}"), config.worker_concurrency)
            .await
            .context("Failed to start worker")?;
    }

    let token = CancellationToken::new();
    let scheduler = tokio::spawn(run_scheduler(engine.clone(), config.clone(), token.clone()));

    info!("Vigil is watching providers");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    token.cancel();
    if let Err(e) = scheduler.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }

    match engine.shutdown(true).await {
        Ok(()) => info!("Job queue stopped"),
        Err(e) => warn!(error = %e, "Job queue did not drain before the deadline"),
    }

    delivery.stop().await;
    let stats = delivery.stats().await;
    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        dropped = stats.dropped,
        "Delivery queue stopped"
    );

    info!("Vigil shutdown complete");
    Ok(())
}

/// Queues one status check per provider every check interval and applies
/// the retention window to finished jobs.
async fn run_scheduler(engine: Arc<JobQueueEngine>, config: Config, token: CancellationToken) {
    let provider_ids: Vec<String> = config.providers.iter().map(|p| p.id.clone()).collect();
    let interval = Duration::from_secs(config.check_interval_seconds);
    let retention = config.retention();
    let mut round: u64 = 0;

    if provider_ids.is_empty() {
        warn!("No providers configured, status checks are idle");
    }

    loop {
        round += 1;
        let batch_id = format!("round-{round}");
        match engine.queue_batch(&provider_ids, Some(&batch_id), 0).await {
            Ok(ids) => debug!(round, jobs = ids.len(), "Status checks queued"),
            Err(QueueError::QueueFull { current, max }) => {
                warn!(round, current, max, "Queue full, skipping status-check round");
            },
            Err(QueueError::ShuttingDown) => {
                debug!(round, "Queue paused or shutting down, skipping round");
            },
            Err(e) => error!(round, error = %e, "Failed to queue status checks"),
        }

        if let Some(retention) = retention {
            match engine.cleanup_finished(retention).await {
                Ok(0) => {},
                Ok(removed) => info!(removed, "Removed finished jobs past retention"),
                Err(e) => warn!(error = %e, "Retention cleanup failed"),
            }
        }

        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(interval) => {},
        }
    }

    debug!("Scheduler stopped");
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
