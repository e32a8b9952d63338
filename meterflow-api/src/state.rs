//! Shared handler state

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use meterflow_billing::{CurrencyService, InvoiceGenerator};
use meterflow_core::config::ApiConfig;
use meterflow_payments::{PaymentRetryEngine, PaymentService, RefundService};
use meterflow_pipeline::{IngestService, ProjectKeyCache};
use meterflow_storage::{DurableStore, HotEventStore};

/// Everything the handlers need, cheaply cloneable
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub payments: Arc<PaymentService>,
    pub refunds: Arc<RefundService>,
    pub retry: Arc<PaymentRetryEngine>,
    pub generator: Arc<InvoiceGenerator>,
    pub currency: Arc<CurrencyService>,
    pub keys: Arc<ProjectKeyCache>,
    pub store: DurableStore,
    pub hot: Arc<HotEventStore>,
    pub api_config: ApiConfig,
    /// Rendered by `GET /metrics`; None when the recorder is not installed
    pub prometheus: Option<PrometheusHandle>,
}
