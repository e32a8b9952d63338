//! Hot store retention sweep
//!
//! Deletes processed hot events once they are older than the configured
//! retention. Non-critical: a failed sweep retries on the next daily run.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;

use meterflow_core::config::CleanupConfig;
use meterflow_core::errors::StoreResult;
use meterflow_core::observability;
use meterflow_storage::HotEventStore;

pub struct CleanupTask {
    hot: Arc<HotEventStore>,
    config: CleanupConfig,
}

impl CleanupTask {
    pub fn new(hot: Arc<HotEventStore>, config: CleanupConfig) -> Self {
        Self { hot, config }
    }

    pub fn run_once(&self) -> StoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        let deleted = self.hot.delete_processed_older_than(cutoff)?;
        observability::record_hot_events_pending(self.hot.pending_len() as u64);
        if deleted > 0 {
            info!(deleted, retention_days = self.config.retention_days, "hot store cleanup");
        }
        Ok(deleted)
    }
}
