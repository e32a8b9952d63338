//! Event ingest path
//!
//! Validates, authenticates and deduplicates incoming usage events, writes
//! them to the hot store, and publishes a migration hint without awaiting
//! the publish: the hot store is the durable record, so a full hint queue is
//! counted and logged but never fails the request. Latency is bounded by a
//! single hot-store write.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use meterflow_core::config::IngestConfig;
use meterflow_core::errors::{IngestError, IngestResult, StoreError};
use meterflow_core::model::{HotUsageEvent, IngestEvent, IngestOutcome};
use meterflow_core::observability;
use meterflow_storage::HotEventStore;

use crate::keycache::ProjectKeyCache;

/// Nudge for the migration worker; carries no payload because the worker
/// scans the hot store itself.
#[derive(Debug, Clone)]
pub struct MigrationHint;

/// The ingest service behind `POST /api/v1/events`
pub struct IngestService {
    hot: Arc<HotEventStore>,
    keys: Arc<ProjectKeyCache>,
    config: IngestConfig,
    hint_tx: mpsc::Sender<MigrationHint>,
}

impl IngestService {
    pub fn new(
        hot: Arc<HotEventStore>,
        keys: Arc<ProjectKeyCache>,
        config: IngestConfig,
        hint_tx: mpsc::Sender<MigrationHint>,
    ) -> Self {
        Self {
            hot,
            keys,
            config,
            hint_tx,
        }
    }

    /// Accept one event. Returns `Accepted` or `Duplicate`; both are 202 to
    /// the caller so replays stay cheap.
    pub async fn ingest(
        &self,
        api_key: &str,
        event: IngestEvent,
    ) -> IngestResult<IngestOutcome> {
        validate_event(&self.config, &event)?;

        let (organisation_id, project_id) = self
            .keys
            .resolve(api_key)
            .await
            .map_err(IngestError::Store)?
            .ok_or(IngestError::Unauthorized)?;

        let now = Utc::now();
        let timestamp = event.timestamp.unwrap_or(now);
        let max_skew = Duration::seconds(self.config.max_future_skew_secs as i64);
        if timestamp > now + max_skew {
            observability::record_ingest_rejected("future_timestamp");
            return Err(IngestError::TimestampInFuture {
                timestamp: timestamp.to_rfc3339(),
                max_skew_secs: self.config.max_future_skew_secs,
            });
        }

        if self.hot.exists(&event.event_id).map_err(IngestError::Store)? {
            observability::record_ingest_duplicate();
            return Ok(IngestOutcome::Duplicate);
        }

        let hot_event = HotUsageEvent {
            id: Uuid::new_v4(),
            organisation_id,
            project_id,
            metric_name: event.metric_name,
            metric_value: event.metric_value,
            unit: event.unit,
            timestamp,
            metadata: event
                .metadata
                .map(|m| serde_json::to_value(m).unwrap_or_default()),
            idempotency_key: event.event_id,
            ingested_at: now,
            processed_at: None,
        };

        match self.hot.put(&hot_event) {
            Ok(()) => {}
            // Raced another request with the same event id between the
            // exists check and the put
            Err(StoreError::DuplicateKey { .. }) => {
                observability::record_ingest_duplicate();
                return Ok(IngestOutcome::Duplicate);
            }
            Err(e) => return Err(IngestError::Store(e)),
        }

        self.publish_hint();
        observability::record_ingest_accepted();
        debug!(
            event_id = %hot_event.idempotency_key,
            metric = %hot_event.metric_name,
            "event accepted into hot store"
        );
        Ok(IngestOutcome::Accepted)
    }

    /// Fire-and-forget: a full queue is dropped and counted, never awaited.
    fn publish_hint(&self) {
        if let Err(e) = self.hint_tx.try_send(MigrationHint) {
            observability::record_hint_dropped();
            warn!("migration hint dropped: {e}");
        }
    }
}

/// Wire-format validation shared by the service and its tests.
pub fn validate_event(config: &IngestConfig, event: &IngestEvent) -> IngestResult<()> {
    if event.event_id.is_empty() || event.event_id.len() > config.max_event_id_len {
        return Err(IngestError::Validation {
            field: "event_id",
            message: format!("must be 1..={} characters", config.max_event_id_len),
        });
    }
    if event.metric_name.is_empty() || event.metric_name.len() > config.max_metric_name_len {
        return Err(IngestError::Validation {
            field: "metric_name",
            message: format!("must be 1..={} characters", config.max_metric_name_len),
        });
    }
    if event.unit.is_empty() || event.unit.len() > config.max_unit_len {
        return Err(IngestError::Validation {
            field: "unit",
            message: format!("must be 1..={} characters", config.max_unit_len),
        });
    }
    if event.metric_value.is_sign_negative() {
        return Err(IngestError::Validation {
            field: "metric_value",
            message: "must be non-negative".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn test_event(event_id: &str) -> IngestEvent {
        IngestEvent {
            event_id: event_id.to_string(),
            metric_name: "api_calls".to_string(),
            metric_value: Decimal::ONE,
            unit: "count".to_string(),
            timestamp: None,
            metadata: None,
        }
    }

    #[test]
    fn accepts_a_well_formed_event() {
        let config = IngestConfig::default();
        assert!(validate_event(&config, &test_event("e1")).is_ok());
    }

    #[test]
    fn rejects_negative_metric_values() {
        let config = IngestConfig::default();
        let event = IngestEvent {
            metric_value: Decimal::NEGATIVE_ONE,
            ..test_event("e1")
        };
        let err = validate_event(&config, &event).unwrap_err();
        assert!(matches!(
            err,
            IngestError::Validation { field: "metric_value", .. }
        ));
    }

    #[test]
    fn rejects_oversized_or_empty_fields() {
        let config = IngestConfig::default();

        let err = validate_event(
            &config,
            &IngestEvent { event_id: "x".repeat(256), ..test_event("e") },
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Validation { field: "event_id", .. }));

        let err = validate_event(
            &config,
            &IngestEvent { metric_name: "m".repeat(101), ..test_event("e") },
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Validation { field: "metric_name", .. }));

        let err = validate_event(
            &config,
            &IngestEvent { unit: String::new(), ..test_event("e") },
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Validation { field: "unit", .. }));

        let err = validate_event(
            &config,
            &IngestEvent { event_id: String::new(), ..test_event("e") },
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Validation { field: "event_id", .. }));
    }
}
