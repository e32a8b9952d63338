//! Hot-to-durable migration worker
//!
//! Drains hot-store batches into the durable store. Per batch, one durable
//! transaction inserts events with `ON CONFLICT (idempotency_key) DO
//! NOTHING` and folds the newly inserted ones into their monthly aggregates;
//! only after that commit are the hot rows marked processed, so a marked row
//! always has a durable counterpart. Any error aborts the run (fail-fast)
//! and the next run redoes the batch.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meterflow_core::config::MigrationConfig;
use meterflow_core::errors::{PlatformResult, StoreError};
use meterflow_core::model::UsageEvent;
use meterflow_core::observability;
use meterflow_storage::{aggregates, events, DurableStore, HotEventStore};

use crate::ingest::MigrationHint;

/// Outcome of one migration run
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationReport {
    pub batches: usize,
    pub migrated: usize,
    pub already_present: usize,
}

/// The migration worker; driven by the scheduler every five minutes and
/// nudged early by ingest hints.
pub struct MigrationWorker {
    hot: Arc<HotEventStore>,
    durable: DurableStore,
    config: MigrationConfig,
    wakeup: Arc<Notify>,
}

impl MigrationWorker {
    pub fn new(hot: Arc<HotEventStore>, durable: DurableStore, config: MigrationConfig) -> Self {
        Self {
            hot,
            durable,
            config,
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Consume ingest hints into wakeups. Hints coalesce; the worker never
    /// runs more than one migration at a time.
    pub fn spawn_hint_listener(
        &self,
        mut hint_rx: mpsc::Receiver<MigrationHint>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let wakeup = Arc::clone(&self.wakeup);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    hint = hint_rx.recv() => match hint {
                        Some(MigrationHint) => wakeup.notify_one(),
                        None => break,
                    },
                }
            }
        })
    }

    /// Run hint-driven migrations until cancelled. Scheduled runs still
    /// happen independently through [`MigrationWorker::run_once`].
    pub async fn run_on_hints(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wakeup.notified() => {}
            }
            // Let a burst of hints coalesce before scanning
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once(&cancel).await {
                warn!("hint-driven migration run failed: {e}");
            }
        }
    }

    /// One migration run: up to `max_batches` batches of `batch_size`.
    pub async fn run_once(&self, cancel: &CancellationToken) -> PlatformResult<MigrationReport> {
        let mut report = MigrationReport::default();
        for _ in 0..self.config.max_batches {
            if cancel.is_cancelled() {
                debug!("migration cancelled between batches");
                break;
            }
            let batch = self.hot.scan_unprocessed(self.config.batch_size)?;
            if batch.is_empty() {
                break;
            }
            let started = Instant::now();
            let (migrated, already_present) = self.migrate_batch(&batch).await?;
            observability::record_migration_batch_seconds(started.elapsed().as_secs_f64());
            report.batches += 1;
            report.migrated += migrated;
            report.already_present += already_present;
            if batch.len() < self.config.batch_size {
                break;
            }
        }

        observability::record_events_migrated(report.migrated as u64);
        observability::record_hot_events_pending(self.hot.pending_len() as u64);
        if report.batches > 0 {
            info!(
                batches = report.batches,
                migrated = report.migrated,
                already_present = report.already_present,
                "migration run complete"
            );
        }
        Ok(report)
    }

    /// Insert one batch durably, fold aggregates for the fresh inserts, and
    /// mark the whole batch processed. Every event in the batch is present
    /// in the durable store after the transaction commits, whether this run
    /// inserted it or a previous one did, so the whole batch is safe to mark.
    async fn migrate_batch(
        &self,
        batch: &[meterflow_core::model::HotUsageEvent],
    ) -> Result<(usize, usize), StoreError> {
        let mut tx = self.durable.begin().await?;
        let mut migrated = 0usize;
        let mut already_present = 0usize;

        for hot_event in batch {
            let event = UsageEvent::from(hot_event);
            if events::insert_ignore_duplicate(&mut tx, &event).await? {
                aggregates::apply_event_delta(&mut tx, &event).await?;
                migrated += 1;
            } else {
                already_present += 1;
            }
        }

        tx.commit().await?;
        self.hot.mark_processed(batch, Utc::now())?;
        Ok((migrated, already_present))
    }
}
