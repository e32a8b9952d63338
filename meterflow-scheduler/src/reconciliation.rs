//! Reconciliation
//!
//! Three daily routines compare independent sources of truth and record
//! discrepancy rows: processed hot events against durable events, local
//! payment state against the gateway, and stored aggregates against a
//! recompute from durable events (which also repairs drift). Discrepancies
//! raise notifications through the alert channels; a routine's failure
//! never blocks the others.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use meterflow_core::capability::{AlertNotification, ChannelRegistry};
use meterflow_core::errors::{ReconciliationError, ReconciliationResult};
use meterflow_core::model::{PaymentStatus, ReconciliationRun, ReconciliationScope};
use meterflow_core::observability;
use meterflow_payments::PaymentGateway;
use meterflow_storage::events::DailyCountKey;
use meterflow_storage::{aggregates, events, payments, reconciliation, DurableStore, HotEventStore};

/// Summary of one full daily reconciliation
#[derive(Debug, Default)]
pub struct ReconciliationReport {
    pub total_discrepancies: i64,
    pub failed_routines: usize,
}

pub struct ReconciliationService {
    hot: Arc<HotEventStore>,
    store: DurableStore,
    gateway: Arc<dyn PaymentGateway>,
    channels: Arc<ChannelRegistry>,
}

impl ReconciliationService {
    pub fn new(
        hot: Arc<HotEventStore>,
        store: DurableStore,
        gateway: Arc<dyn PaymentGateway>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            hot,
            store,
            gateway,
            channels,
        }
    }

    /// Run all three routines under one correlation id.
    pub async fn run_all(&self, now: DateTime<Utc>) -> ReconciliationReport {
        let run_id = reconciliation::new_run_id();
        let mut report = ReconciliationReport::default();

        for (name, result) in [
            ("hot_vs_durable", self.reconcile_events(run_id, now).await),
            ("gateway_vs_durable", self.reconcile_payments(run_id, now).await),
            ("aggregates_vs_events", self.reconcile_aggregates(run_id, now).await),
        ] {
            match result {
                Ok(discrepancies) => report.total_discrepancies += discrepancies,
                Err(e) => {
                    report.failed_routines += 1;
                    error!(%run_id, routine = name, "reconciliation routine failed: {e}");
                }
            }
        }

        info!(
            %run_id,
            discrepancies = report.total_discrepancies,
            failed_routines = report.failed_routines,
            "reconciliation run complete"
        );
        report
    }

    /// Hot vs durable: every processed hot event must exist durably, and
    /// recent durable events must trace back to the hot store.
    async fn reconcile_events(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> ReconciliationResult<i64> {
        let started = now;
        let window_start = now - Duration::days(1);

        let mut hot_counts: HashMap<DailyCountKey, i64> = HashMap::new();
        let mut hot_total = 0i64;
        for event in self.hot.all_events()? {
            // Unprocessed events are legitimately absent from the durable
            // store until the next migration run
            if event.processed_at.is_none() || event.ingested_at < window_start {
                continue;
            }
            hot_total += 1;
            *hot_counts
                .entry(DailyCountKey {
                    organisation_id: event.organisation_id,
                    project_id: event.project_id,
                    metric_name: event.metric_name.clone(),
                    unit: event.unit.clone(),
                    day: event.timestamp.date_naive(),
                })
                .or_insert(0) += 1;
        }

        let durable_counts = events::daily_counts_since(&self.store, window_start).await?;
        let durable_total: i64 = durable_counts.iter().map(|(_, n)| n).sum();
        let mut durable_map: HashMap<DailyCountKey, i64> = HashMap::with_capacity(durable_counts.len());
        for (key, count) in durable_counts {
            durable_map.insert(key, count);
        }

        let mut discrepancies = Vec::new();
        for (key, hot_count) in &hot_counts {
            let durable_count = durable_map.get(key).copied().unwrap_or(0);
            if *hot_count != durable_count {
                discrepancies.push(json!({
                    "organisation_id": key.organisation_id,
                    "project_id": key.project_id,
                    "metric_name": key.metric_name,
                    "unit": key.unit,
                    "day": key.day,
                    "hot_count": hot_count,
                    "durable_count": durable_count,
                }));
            }
        }
        for (key, durable_count) in &durable_map {
            if !hot_counts.contains_key(key) {
                discrepancies.push(json!({
                    "organisation_id": key.organisation_id,
                    "project_id": key.project_id,
                    "metric_name": key.metric_name,
                    "unit": key.unit,
                    "day": key.day,
                    "hot_count": 0,
                    "durable_count": durable_count,
                }));
            }
        }

        self.record(
            run_id,
            ReconciliationScope::HotVsDurable,
            hot_total,
            durable_total,
            discrepancies,
            started,
        )
        .await
    }

    /// Gateway vs durable payments over a rolling week.
    async fn reconcile_payments(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> ReconciliationResult<i64> {
        let started = now;
        let window_start = now - Duration::days(7);
        let local = payments::list_created_since(&self.store, window_start).await?;
        let local_total = local.len() as i64;
        let mut gateway_total = 0i64;
        let mut discrepancies = Vec::new();

        for payment in &local {
            let Some(gateway_payment_id) = payment.gateway_payment_id.as_deref() else {
                // Order created, payment never attempted; nothing to compare
                continue;
            };
            let gateway_state = self
                .gateway
                .fetch_payment(gateway_payment_id)
                .await
                .map_err(|e| ReconciliationError::GatewayUnavailable(e.to_string()))?;

            match gateway_state {
                None => {
                    discrepancies.push(json!({
                        "payment_id": payment.id,
                        "gateway_payment_id": gateway_payment_id,
                        "kind": "missing_at_gateway",
                        "local_status": payment.status.as_str(),
                    }));
                }
                Some(state) => {
                    gateway_total += 1;
                    match map_gateway_status(&state.status) {
                        Some(expected) if expected == payment.status => {
                            payments::mark_reconciled(&self.store, payment.id, now).await?;
                        }
                        Some(expected) => {
                            discrepancies.push(json!({
                                "payment_id": payment.id,
                                "gateway_payment_id": gateway_payment_id,
                                "kind": "status_mismatch",
                                "local_status": payment.status.as_str(),
                                "gateway_status": expected.as_str(),
                            }));
                        }
                        None => {
                            // A state we cannot map needs an operator
                            discrepancies.push(json!({
                                "payment_id": payment.id,
                                "gateway_payment_id": gateway_payment_id,
                                "kind": "unreconciled",
                                "gateway_status": state.status,
                            }));
                        }
                    }
                }
            }
        }

        self.record(
            run_id,
            ReconciliationScope::GatewayVsDurable,
            gateway_total,
            local_total,
            discrepancies,
            started,
        )
        .await
    }

    /// Aggregates vs events for the current and previous month; drifted
    /// aggregates are overwritten from the recompute.
    async fn reconcile_aggregates(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> ReconciliationResult<i64> {
        let started = now;
        let current = (now.month(), now.year());
        let previous = if now.month() == 1 {
            (12, now.year() - 1)
        } else {
            (now.month() - 1, now.year())
        };

        let mut checked = 0i64;
        let mut discrepancies = Vec::new();
        for (month, year) in [current, previous] {
            for aggregate in aggregates::list_for_period(&self.store, month, year).await? {
                checked += 1;
                let (recomputed_total, recomputed_count) = events::recompute_aggregate_totals(
                    &self.store,
                    aggregate.organisation_id,
                    aggregate.project_id,
                    &aggregate.metric_name,
                    &aggregate.unit,
                    month,
                    year,
                )
                .await?;
                if recomputed_total != aggregate.total_value
                    || recomputed_count != aggregate.event_count
                {
                    warn!(
                        aggregate_id = %aggregate.id,
                        stored_total = %aggregate.total_value,
                        recomputed_total = %recomputed_total,
                        "aggregate drift repaired"
                    );
                    aggregates::overwrite_totals(
                        &self.store,
                        aggregate.id,
                        recomputed_total,
                        recomputed_count,
                    )
                    .await?;
                    discrepancies.push(json!({
                        "aggregate_id": aggregate.id,
                        "organisation_id": aggregate.organisation_id,
                        "metric_name": aggregate.metric_name,
                        "month": month,
                        "year": year,
                        "stored_total": aggregate.total_value.to_string(),
                        "recomputed_total": recomputed_total.to_string(),
                        "stored_count": aggregate.event_count,
                        "recomputed_count": recomputed_count,
                    }));
                }
            }
        }

        self.record(
            run_id,
            ReconciliationScope::AggregatesVsEvents,
            checked,
            checked,
            discrepancies,
            started,
        )
        .await
    }

    async fn record(
        &self,
        run_id: Uuid,
        scope: ReconciliationScope,
        left_count: i64,
        right_count: i64,
        discrepancies: Vec<serde_json::Value>,
        started_at: DateTime<Utc>,
    ) -> ReconciliationResult<i64> {
        let discrepancy_count = discrepancies.len() as i64;
        let status = if discrepancy_count == 0 {
            "completed"
        } else {
            "completed_with_discrepancies"
        };
        let run = ReconciliationRun {
            id: Uuid::new_v4(),
            run_id,
            scope,
            left_count,
            right_count,
            discrepancy_count,
            details: serde_json::Value::Array(discrepancies),
            status: status.to_string(),
            started_at,
            finished_at: Utc::now(),
        };
        reconciliation::insert(&self.store, &run).await?;

        if discrepancy_count > 0 {
            observability::record_reconciliation_discrepancies(
                scope.as_str(),
                discrepancy_count as u64,
            );
            self.raise_alert(scope, discrepancy_count).await;
        }
        Ok(discrepancy_count)
    }

    async fn raise_alert(&self, scope: ReconciliationScope, discrepancy_count: i64) {
        let notification = AlertNotification {
            rule_name: format!("reconciliation:{}", scope.as_str()),
            rule_type: "reconciliation".to_string(),
            message: format!(
                "reconciliation found {discrepancy_count} discrepancies in {}",
                scope.as_str()
            ),
            actual_value: discrepancy_count.to_string(),
            threshold_value: Some("0".to_string()),
            organisation_id: None,
        };
        if let Some(channel) = self.channels.get("log") {
            if let Err(e) = channel.notify(&notification).await {
                warn!("reconciliation alert delivery failed: {e}");
            }
        }
    }
}

/// Map a gateway-reported payment status onto ours; `None` means a state we
/// do not recognise and an operator must look at.
pub fn map_gateway_status(status: &str) -> Option<PaymentStatus> {
    match status {
        "created" | "pending" => Some(PaymentStatus::Pending),
        "authorized" => Some(PaymentStatus::Authorized),
        "captured" => Some(PaymentStatus::Captured),
        "failed" => Some(PaymentStatus::Failed),
        "refunded" => Some(PaymentStatus::Refunded),
        "partially_refunded" => Some(PaymentStatus::PartiallyRefunded),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses_map_onto_the_state_machine() {
        assert_eq!(map_gateway_status("created"), Some(PaymentStatus::Pending));
        assert_eq!(map_gateway_status("captured"), Some(PaymentStatus::Captured));
        assert_eq!(map_gateway_status("refunded"), Some(PaymentStatus::Refunded));
        assert_eq!(map_gateway_status("disputed"), None);
    }
}
