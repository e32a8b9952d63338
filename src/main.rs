//! Meterflow entry point
//!
//! Wires the platform together: configuration, observability, the hot and
//! durable stores, the pipeline, billing, payment and alerting services,
//! the scheduler, and the HTTP API. Shuts down cleanly on SIGINT/SIGTERM:
//! the scheduler stops, the API drains, the hot store flushes and the pool
//! closes.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use meterflow_api::{state::AppState, ApiServer};
use meterflow_billing::{CurrencyService, InvoiceGenerator};
use meterflow_core::capability::{
    ChannelRegistry, EmailSender, LogNotificationChannel, LoggingEmailSender, MemoryObjectStore,
    ObjectStore, PassthroughPdfRenderer, PdfRenderer,
};
use meterflow_core::config::PlatformConfig;
use meterflow_core::observability;
use meterflow_payments::{
    MockGateway, PaymentGateway, PaymentRetryEngine, PaymentService, RazorpayGateway,
    RefundService,
};
use meterflow_pipeline::{cleanup::CleanupTask, IngestService, MigrationWorker, ProjectKeyCache};
use meterflow_scheduler::{
    AlertEngine, JobSet, PlatformScheduler, ReconciliationService, ReminderService,
};
use meterflow_storage::{DurableStore, HotEventStore};

#[derive(Debug, Parser)]
#[command(name = "meterflow", about = "Multi-tenant usage-based billing backend")]
struct Args {
    /// Configuration file (TOML); env vars METERFLOW_* override it
    #[arg(long)]
    config: Option<String>,

    /// Emit JSON logs for log aggregation
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    observability::init_tracing(args.json_logs);

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("prometheus recorder not installed: {e}");
            None
        }
    };

    let config = PlatformConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    info!("starting meterflow");

    let hot = Arc::new(HotEventStore::open(&config.hot_store).context("failed to open hot store")?);
    let store = DurableStore::connect(&config.database)
        .await
        .context("failed to connect to durable store")?;
    info!("stores ready");

    // Capability transports; real providers slot in behind the same traits
    let email: Arc<dyn EmailSender> = Arc::new(LoggingEmailSender);
    let pdf: Arc<dyn PdfRenderer> = Arc::new(PassthroughPdfRenderer);
    let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::default());
    let mut channels = ChannelRegistry::new();
    channels.register(Arc::new(LogNotificationChannel));
    let channels = Arc::new(channels);

    let gateway: Arc<dyn PaymentGateway> = if config.gateway.key_id.is_empty() {
        warn!("gateway credentials missing; using the in-memory mock gateway");
        Arc::new(MockGateway::new())
    } else {
        Arc::new(RazorpayGateway::new(&config.gateway)?)
    };

    let keys = Arc::new(ProjectKeyCache::new(store.clone()));
    let (hint_tx, hint_rx) = tokio::sync::mpsc::channel(config.ingest.hint_queue_capacity);
    let ingest = Arc::new(IngestService::new(
        Arc::clone(&hot),
        Arc::clone(&keys),
        config.ingest.clone(),
        hint_tx,
    ));

    let migration = Arc::new(MigrationWorker::new(
        Arc::clone(&hot),
        store.clone(),
        config.migration.clone(),
    ));
    let cleanup = Arc::new(CleanupTask::new(Arc::clone(&hot), config.cleanup.clone()));

    let currency = Arc::new(CurrencyService::new(store.clone(), config.rates.clone()));
    let generator = Arc::new(InvoiceGenerator::new(
        store.clone(),
        Arc::clone(&currency),
        Arc::clone(&email),
        Arc::clone(&pdf),
        Arc::clone(&objects),
        config.billing.clone(),
        config.pdf.clone(),
    ));

    let payments = Arc::new(PaymentService::new(
        store.clone(),
        Arc::clone(&gateway),
        Arc::clone(&currency),
        config.gateway.clone(),
        config.retry.clone(),
    ));
    let refunds = Arc::new(RefundService::new(store.clone(), Arc::clone(&gateway)));
    let retry = Arc::new(PaymentRetryEngine::new(
        store.clone(),
        Arc::clone(&gateway),
        config.retry.clone(),
    ));

    let alerts = Arc::new(AlertEngine::new(
        store.clone(),
        Arc::clone(&channels),
        config.alerts.clone(),
    ));
    let reconciliation = Arc::new(ReconciliationService::new(
        Arc::clone(&hot),
        store.clone(),
        Arc::clone(&gateway),
        Arc::clone(&channels),
    ));
    let reminders = Arc::new(ReminderService::new(store.clone(), Arc::clone(&email)));

    let shutdown = CancellationToken::new();

    // Hint-driven migration keeps the hot store small between scheduled runs
    let hint_listener = migration.spawn_hint_listener(hint_rx, shutdown.clone());
    let hint_runner = {
        let migration = Arc::clone(&migration);
        let cancel = shutdown.clone();
        tokio::spawn(async move { migration.run_on_hints(cancel).await })
    };

    let mut scheduler = if config.scheduler.enabled {
        Some(
            PlatformScheduler::start(JobSet {
                migration: Arc::clone(&migration),
                cleanup: Arc::clone(&cleanup),
                generator: Arc::clone(&generator),
                retry: Arc::clone(&retry),
                alerts: Arc::clone(&alerts),
                reconciliation: Arc::clone(&reconciliation),
                reminders: Arc::clone(&reminders),
                payments: Arc::clone(&payments),
                currency: Arc::clone(&currency),
                cancel: shutdown.clone(),
            })
            .await?,
        )
    } else {
        warn!("scheduler disabled by configuration");
        None
    };

    let state = AppState {
        ingest,
        payments,
        refunds,
        retry,
        generator,
        currency,
        keys,
        store: store.clone(),
        hot: Arc::clone(&hot),
        api_config: config.api.clone(),
        prometheus,
    };
    let server = ApiServer::new(config.api.clone(), state);
    let server_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(shutdown).await {
                error!("api server failed: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();

    if let Some(scheduler) = scheduler.as_mut() {
        if let Err(e) = scheduler.shutdown().await {
            warn!("scheduler shutdown failed: {e}");
        }
    }
    let _ = server_handle.await;
    let _ = hint_runner.await;
    hint_listener.abort();

    if let Err(e) = hot.flush() {
        warn!("hot store flush failed: {e}");
    }
    store.close().await;
    info!("meterflow stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
