//! Observability kernel
//!
//! Structured logging bootstrap and the metric names every component records
//! against. Metrics go through the `metrics` facade; the binary installs a
//! Prometheus recorder and the API crate exposes the scrape endpoint.

use metrics::{counter, gauge, histogram};

/// Metric names recorded across the platform.
pub mod names {
    pub const INGEST_ACCEPTED: &str = "ingest_accepted_total";
    pub const INGEST_DUPLICATE: &str = "ingest_duplicate_total";
    pub const INGEST_REJECTED: &str = "ingest_rejected_total";
    pub const HINT_QUEUE_DROPPED: &str = "hint_queue_dropped_total";
    pub const MIGRATION_EVENTS_MIGRATED: &str = "migration_events_migrated_total";
    pub const MIGRATION_RUNS_FAILED: &str = "migration_runs_failed_total";
    pub const MIGRATION_BATCH_SECONDS: &str = "migration_batch_seconds";
    pub const HOT_EVENTS_PENDING: &str = "hot_events_pending";
    pub const INVOICES_GENERATED: &str = "invoices_generated_total";
    pub const INVOICES_FAILED: &str = "invoices_failed_total";
    pub const WEBHOOK_ACCEPTED: &str = "webhook_accepted_total";
    pub const WEBHOOK_REJECTED: &str = "webhook_rejected_total";
    pub const PAYMENT_RETRIES: &str = "payment_retries_total";
    pub const REFUNDS_CREATED: &str = "refunds_created_total";
    pub const ALERTS_TRIGGERED: &str = "alerts_triggered_total";
    pub const RECONCILIATION_DISCREPANCIES: &str = "reconciliation_discrepancies_total";
    pub const EMAILS_SENT: &str = "emails_sent_total";
    pub const EMAILS_FAILED: &str = "emails_failed_total";
}

/// Initialise structured logging. JSON output for production deployments,
/// pretty output for local runs; level configured via `RUST_LOG` with a
/// `meterflow=info` default.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meterflow=info,warn"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

pub fn record_ingest_accepted() {
    counter!(names::INGEST_ACCEPTED).increment(1);
}

pub fn record_ingest_duplicate() {
    counter!(names::INGEST_DUPLICATE).increment(1);
}

pub fn record_ingest_rejected(reason: &'static str) {
    counter!(names::INGEST_REJECTED, "reason" => reason).increment(1);
}

pub fn record_hint_dropped() {
    counter!(names::HINT_QUEUE_DROPPED).increment(1);
}

pub fn record_events_migrated(count: u64) {
    counter!(names::MIGRATION_EVENTS_MIGRATED).increment(count);
}

pub fn record_migration_failed() {
    counter!(names::MIGRATION_RUNS_FAILED).increment(1);
}

pub fn record_migration_batch_seconds(seconds: f64) {
    histogram!(names::MIGRATION_BATCH_SECONDS).record(seconds);
}

pub fn record_hot_events_pending(count: u64) {
    gauge!(names::HOT_EVENTS_PENDING).set(count as f64);
}

pub fn record_invoice_generated() {
    counter!(names::INVOICES_GENERATED).increment(1);
}

pub fn record_invoice_failed() {
    counter!(names::INVOICES_FAILED).increment(1);
}

pub fn record_webhook_accepted(event: &str) {
    counter!(names::WEBHOOK_ACCEPTED, "event" => event.to_string()).increment(1);
}

pub fn record_webhook_rejected(reason: &'static str) {
    counter!(names::WEBHOOK_REJECTED, "reason" => reason).increment(1);
}

pub fn record_payment_retry(success: bool) {
    counter!(names::PAYMENT_RETRIES, "outcome" => if success { "ok" } else { "error" })
        .increment(1);
}

pub fn record_refund_created() {
    counter!(names::REFUNDS_CREATED).increment(1);
}

pub fn record_alert_triggered(rule_type: &str) {
    counter!(names::ALERTS_TRIGGERED, "rule_type" => rule_type.to_string()).increment(1);
}

pub fn record_reconciliation_discrepancies(scope: &str, count: u64) {
    counter!(names::RECONCILIATION_DISCREPANCIES, "scope" => scope.to_string()).increment(count);
}

pub fn record_email(sent: bool) {
    if sent {
        counter!(names::EMAILS_SENT).increment(1);
    } else {
        counter!(names::EMAILS_FAILED).increment(1);
    }
}
