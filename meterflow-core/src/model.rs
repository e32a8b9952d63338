//! Shared domain model
//!
//! Entities persisted by the durable store and exchanged between subsystems.
//! Monetary values are exact decimals, timestamps are UTC, currency is an
//! ISO 4217 code. Status enums are flat string-mapped values (TEXT columns);
//! the legal transitions live next to the enums so every writer goes through
//! the same table.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Currency;

pub type OrganisationId = Uuid;
pub type ProjectId = Uuid;
pub type InvoiceId = Uuid;
pub type PaymentId = Uuid;

/// A paying tenant; owns projects, invoices and payments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organisation {
    pub id: OrganisationId,
    pub name: String,
    /// Billing currency for the organisation's invoices
    pub currency: Currency,
    /// Customer handle at the payment gateway, once one exists
    pub gateway_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft delete; history is preserved
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A project under an organisation; the unit of ingest authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub organisation_id: OrganisationId,
    pub name: String,
    /// SHA-256 hash of the api key; the plaintext is shown once at creation
    /// and never stored
    pub api_key_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A usage event in the write-optimised hot store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotUsageEvent {
    pub id: Uuid,
    pub organisation_id: OrganisationId,
    pub project_id: ProjectId,
    pub metric_name: String,
    /// Non-negative usage quantity
    pub metric_value: Decimal,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    /// Client-chosen event id; unique across the hot store
    pub idempotency_key: String,
    pub ingested_at: DateTime<Utc>,
    /// Set by the migration worker once the event is present in the durable
    /// store
    pub processed_at: Option<DateTime<Utc>>,
}

/// A usage event in the durable store; insert-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub organisation_id: OrganisationId,
    pub project_id: ProjectId,
    pub metric_name: String,
    pub metric_value: Decimal,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    pub idempotency_key: String,
    pub ingested_at: DateTime<Utc>,
}

impl From<&HotUsageEvent> for UsageEvent {
    fn from(event: &HotUsageEvent) -> Self {
        UsageEvent {
            id: event.id,
            organisation_id: event.organisation_id,
            project_id: event.project_id,
            metric_name: event.metric_name.clone(),
            metric_value: event.metric_value,
            unit: event.unit.clone(),
            timestamp: event.timestamp,
            metadata: event.metadata.clone(),
            idempotency_key: event.idempotency_key.clone(),
            ingested_at: event.ingested_at,
        }
    }
}

/// Monthly usage rollup per (organisation, project, metric, unit)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAggregate {
    pub id: Uuid,
    pub organisation_id: OrganisationId,
    pub project_id: ProjectId,
    pub metric_name: String,
    pub unit: String,
    pub month: u32,
    pub year: i32,
    pub total_value: Decimal,
    /// Number of folded events; used by reconciliation for validation
    pub event_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Price per unit for a metric, effective over `[from, to)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: Uuid,
    /// None = global rule; organisation-specific rules take precedence
    pub organisation_id: Option<OrganisationId>,
    pub metric_name: String,
    pub unit: String,
    pub price_per_unit: Decimal,
    pub currency: Currency,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Minimum monthly charge, effective over `[from, to)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimumChargeRule {
    pub id: Uuid,
    pub organisation_id: Option<OrganisationId>,
    pub minimum_amount: Decimal,
    pub currency: Currency,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Per-organisation billing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub organisation_id: OrganisationId,
    /// Tax rate as a decimal fraction, e.g. 0.18 for 18%
    pub tax_rate: Decimal,
    pub currency: Currency,
    pub payment_terms_days: i32,
    pub minimum_charge_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Invoice lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Sent,
    Overdue,
    Paid,
    Cancelled,
    Void,
    Refunded,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Finalized => "finalized",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Refunded => "refunded",
        }
    }

    /// Legal status transitions. Finalisation freezes financial fields; from
    /// there the invoice may only be sent, flagged overdue, or settle into a
    /// terminal state.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Finalized)
                | (Draft, Cancelled)
                | (Finalized, Sent)
                | (Finalized, Paid)
                | (Finalized, Cancelled)
                | (Finalized, Void)
                | (Finalized, Refunded)
                | (Sent, Overdue)
                | (Sent, Paid)
                | (Sent, Cancelled)
                | (Sent, Void)
                | (Sent, Refunded)
                | (Overdue, Paid)
                | (Overdue, Cancelled)
                | (Overdue, Void)
                | (Overdue, Refunded)
                | (Paid, Refunded)
        )
    }

    /// Cancelled rows do not count against the one-invoice-per-period rule.
    pub fn counts_for_period_uniqueness(&self) -> bool {
        !matches!(self, InvoiceStatus::Cancelled)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "finalized" => Ok(InvoiceStatus::Finalized),
            "sent" => Ok(InvoiceStatus::Sent),
            "overdue" => Ok(InvoiceStatus::Overdue),
            "paid" => Ok(InvoiceStatus::Paid),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            "void" => Ok(InvoiceStatus::Void),
            "refunded" => Ok(InvoiceStatus::Refunded),
            other => Err(format!("unknown invoice status: {other}")),
        }
    }
}

/// Immutable monthly invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub organisation_id: OrganisationId,
    /// Human-readable unique number, e.g. `INV-ACME-202401-0042`
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub subtotal: Decimal,
    /// Subtotal after the minimum-charge adjustment, the tax base
    pub subtotal_after_min: Decimal,
    pub tax: Decimal,
    /// Reserved; currently always zero
    pub discount: Decimal,
    /// total = subtotal_after_min + tax - discount
    pub total: Decimal,
    pub currency: Currency,
    pub month: u32,
    pub year: i32,
    pub due_date: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub pdf_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single priced line on an invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: Uuid,
    pub invoice_id: InvoiceId,
    pub line_number: i32,
    pub description: String,
    pub metric_name: Option<String>,
    pub unit: Option<String>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    /// Original currency/amount when the line was converted, plus anything
    /// else the calculator wants to preserve
    pub metadata: Option<serde_json::Value>,
}

/// Payment lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Captured,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Authorized)
                | (Pending, Captured)
                | (Pending, Failed)
                | (Authorized, Captured)
                | (Authorized, Failed)
                | (Captured, Refunded)
                | (Captured, PartiallyRefunded)
                | (PartiallyRefunded, Refunded)
                | (PartiallyRefunded, PartiallyRefunded)
        )
    }

    /// Terminal states never change again except through refunds.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Captured | PaymentStatus::Refunded | PaymentStatus::PartiallyRefunded
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "authorized" => Ok(PaymentStatus::Authorized),
            "captured" => Ok(PaymentStatus::Captured),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            "partially_refunded" => Ok(PaymentStatus::PartiallyRefunded),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// One retry attempt against the gateway, kept in `retry_history`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: i32,
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_order_id: Option<String>,
}

/// A payment attempt against an invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub organisation_id: OrganisationId,
    pub invoice_id: InvoiceId,
    pub gateway_order_id: String,
    /// Unique once the gateway has assigned it
    pub gateway_payment_id: Option<String>,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub retry_history: Vec<RetryAttempt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Refund lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Processed,
    Failed,
    Cancelled,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Processed => "processed",
            RefundStatus::Failed => "failed",
            RefundStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefundStatus::Pending),
            "processed" => Ok(RefundStatus::Processed),
            "failed" => Ok(RefundStatus::Failed),
            "cancelled" => Ok(RefundStatus::Cancelled),
            other => Err(format!("unknown refund status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundType {
    Full,
    Partial,
}

impl RefundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundType::Full => "full",
            RefundType::Partial => "partial",
        }
    }
}

impl FromStr for RefundType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RefundType::Full),
            "partial" => Ok(RefundType::Partial),
            other => Err(format!("unknown refund type: {other}")),
        }
    }
}

/// A refund against a captured payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: PaymentId,
    /// Denormalised for the admin listing paths
    pub invoice_id: InvoiceId,
    pub refund_number: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: RefundStatus,
    pub refund_type: RefundType,
    pub reason: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub initiated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Exchange rate effective over `[from, to)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub id: Uuid,
    pub base_currency: Currency,
    pub target_currency: Currency,
    /// Strictly positive multiplier: target = base * rate
    pub rate: Decimal,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Alert rule kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertRuleType {
    UsageThreshold,
    UsageSpike,
    CostThreshold,
    UnusualPattern,
}

impl AlertRuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertRuleType::UsageThreshold => "usage_threshold",
            AlertRuleType::UsageSpike => "usage_spike",
            AlertRuleType::CostThreshold => "cost_threshold",
            AlertRuleType::UnusualPattern => "unusual_pattern",
        }
    }
}

impl FromStr for AlertRuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "usage_threshold" => Ok(AlertRuleType::UsageThreshold),
            "usage_spike" => Ok(AlertRuleType::UsageSpike),
            "cost_threshold" => Ok(AlertRuleType::CostThreshold),
            "unusual_pattern" => Ok(AlertRuleType::UnusualPattern),
            other => Err(format!("unknown alert rule type: {other}")),
        }
    }
}

/// Comparison operator for threshold rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl ThresholdOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOperator::Gt => "gt",
            ThresholdOperator::Gte => "gte",
            ThresholdOperator::Lt => "lt",
            ThresholdOperator::Lte => "lte",
            ThresholdOperator::Eq => "eq",
        }
    }

    pub fn compare(&self, actual: Decimal, threshold: Decimal) -> bool {
        match self {
            ThresholdOperator::Gt => actual > threshold,
            ThresholdOperator::Gte => actual >= threshold,
            ThresholdOperator::Lt => actual < threshold,
            ThresholdOperator::Lte => actual <= threshold,
            ThresholdOperator::Eq => actual == threshold,
        }
    }
}

impl FromStr for ThresholdOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gt" => Ok(ThresholdOperator::Gt),
            "gte" => Ok(ThresholdOperator::Gte),
            "lt" => Ok(ThresholdOperator::Lt),
            "lte" => Ok(ThresholdOperator::Lte),
            "eq" => Ok(ThresholdOperator::Eq),
            other => Err(format!("unknown threshold operator: {other}")),
        }
    }
}

/// Period over which alert rules aggregate usage, ending at evaluation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonPeriod {
    Hour,
    Day,
    Week,
    Month,
}

impl ComparisonPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonPeriod::Hour => "hour",
            ComparisonPeriod::Day => "day",
            ComparisonPeriod::Week => "week",
            ComparisonPeriod::Month => "month",
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            ComparisonPeriod::Hour => chrono::Duration::hours(1),
            ComparisonPeriod::Day => chrono::Duration::days(1),
            ComparisonPeriod::Week => chrono::Duration::weeks(1),
            ComparisonPeriod::Month => chrono::Duration::days(30),
        }
    }
}

impl FromStr for ComparisonPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(ComparisonPeriod::Hour),
            "day" => Ok(ComparisonPeriod::Day),
            "week" => Ok(ComparisonPeriod::Week),
            "month" => Ok(ComparisonPeriod::Month),
            other => Err(format!("unknown comparison period: {other}")),
        }
    }
}

/// A configured alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub organisation_id: Option<OrganisationId>,
    pub name: String,
    pub rule_type: AlertRuleType,
    pub metric_name: Option<String>,
    pub unit: Option<String>,
    pub threshold: Option<Decimal>,
    pub operator: Option<ThresholdOperator>,
    pub comparison_period: ComparisonPeriod,
    /// Spike rules: percentage increase over the reference period that fires
    pub spike_percent: Option<Decimal>,
    pub reference_period: Option<ComparisonPeriod>,
    pub is_active: bool,
    /// Notification channel names, e.g. `["email", "log"]`
    pub channels: Vec<String>,
    /// Minimum interval between two triggers of this rule
    pub cooldown_minutes: i64,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Delivery state of a triggered alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Sent,
    Failed,
    Acknowledged,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Sent => "sent",
            AlertStatus::Failed => "failed",
            AlertStatus::Acknowledged => "acknowledged",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertStatus::Pending),
            "sent" => Ok(AlertStatus::Sent),
            "failed" => Ok(AlertStatus::Failed),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            other => Err(format!("unknown alert status: {other}")),
        }
    }
}

/// One row per alert trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub organisation_id: Option<OrganisationId>,
    pub status: AlertStatus,
    pub actual_value: Decimal,
    pub threshold_value: Option<Decimal>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
}

/// Append-only audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub actor: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Scope of a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationScope {
    HotVsDurable,
    GatewayVsDurable,
    AggregatesVsEvents,
}

impl ReconciliationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationScope::HotVsDurable => "hot_vs_durable",
            ReconciliationScope::GatewayVsDurable => "gateway_vs_durable",
            ReconciliationScope::AggregatesVsEvents => "aggregates_vs_events",
        }
    }
}

impl FromStr for ReconciliationScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot_vs_durable" => Ok(ReconciliationScope::HotVsDurable),
            "gateway_vs_durable" => Ok(ReconciliationScope::GatewayVsDurable),
            "aggregates_vs_events" => Ok(ReconciliationScope::AggregatesVsEvents),
            other => Err(format!("unknown reconciliation scope: {other}")),
        }
    }
}

/// Outcome of one reconciliation routine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: Uuid,
    /// Correlation id shared by all routines of the same daily run
    pub run_id: Uuid,
    pub scope: ReconciliationScope,
    pub left_count: i64,
    pub right_count: i64,
    pub discrepancy_count: i64,
    /// Per-discrepancy detail for operator inspection
    pub details: serde_json::Value,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Email queued or sent through the notification capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailNotification {
    pub id: Uuid,
    pub organisation_id: Option<OrganisationId>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub kind: String,
    pub status: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Authenticated caller identity consumed by the core; produced by the
/// out-of-scope auth middleware surface
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub actor: String,
    pub organisation_id: Option<OrganisationId>,
    pub permissions: Vec<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuthContext {
    pub fn system(job: &str) -> Self {
        AuthContext {
            actor: format!("system:{job}"),
            organisation_id: None,
            permissions: vec!["*".to_string()],
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == "*" || p == permission)
    }
}

/// Pure output of the billing calculator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedInvoice {
    pub organisation_id: OrganisationId,
    pub currency: Currency,
    pub month: u32,
    pub year: i32,
    pub line_items: Vec<CalculatedLineItem>,
    pub subtotal: Decimal,
    /// Subtotal after the minimum-charge adjustment line, the tax base
    pub subtotal_after_min: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    /// Metrics that had usage but no effective pricing rule
    pub unpriced_metrics: Vec<UnpricedMetric>,
}

/// Line produced by the calculator, before persistence assigns ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedLineItem {
    pub line_number: i32,
    pub description: String,
    pub metric_name: Option<String>,
    pub unit: Option<String>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    pub metadata: Option<serde_json::Value>,
}

/// A metric the calculator could not price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpricedMetric {
    pub metric_name: String,
    pub unit: String,
    pub total_value: Decimal,
}

/// Ingest outcome: both shapes answer 202
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestOutcome {
    Accepted,
    Duplicate,
}

/// Monthly usage summary line for the admin read paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummaryRow {
    pub project_id: ProjectId,
    pub metric_name: String,
    pub unit: String,
    pub total_value: Decimal,
    pub event_count: i64,
}

/// Daily usage point for trend queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageTrendPoint {
    pub day: DateTime<Utc>,
    pub total_value: Decimal,
    pub event_count: i64,
}

/// Validated event payload accepted by the ingest path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub event_id: String,
    pub metric_name: String,
    pub metric_value: Decimal,
    pub unit: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_invoice_restricts_transitions() {
        let from = InvoiceStatus::Finalized;
        assert!(from.can_transition_to(InvoiceStatus::Paid));
        assert!(from.can_transition_to(InvoiceStatus::Cancelled));
        assert!(from.can_transition_to(InvoiceStatus::Void));
        assert!(from.can_transition_to(InvoiceStatus::Refunded));
        assert!(from.can_transition_to(InvoiceStatus::Sent));
        assert!(!from.can_transition_to(InvoiceStatus::Draft));
        assert!(!from.can_transition_to(InvoiceStatus::Finalized));
    }

    #[test]
    fn payment_transitions_follow_the_state_machine() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Authorized));
        assert!(Pending.can_transition_to(Captured));
        assert!(Pending.can_transition_to(Failed));
        assert!(Authorized.can_transition_to(Captured));
        assert!(Captured.can_transition_to(Refunded));
        assert!(Captured.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(Refunded));
        assert!(!Failed.can_transition_to(Captured));
        assert!(!Captured.can_transition_to(Pending));
        assert!(!Refunded.can_transition_to(PartiallyRefunded));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            InvoiceStatus::Draft,
            InvoiceStatus::Finalized,
            InvoiceStatus::Sent,
            InvoiceStatus::Overdue,
            InvoiceStatus::Paid,
            InvoiceStatus::Cancelled,
            InvoiceStatus::Void,
            InvoiceStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<InvoiceStatus>().unwrap(), status);
        }
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Authorized,
            PaymentStatus::Captured,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
            PaymentStatus::PartiallyRefunded,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
    }

    #[test]
    fn threshold_operators_compare() {
        let ten = Decimal::from(10);
        let five = Decimal::from(5);
        assert!(ThresholdOperator::Gt.compare(ten, five));
        assert!(!ThresholdOperator::Gt.compare(five, ten));
        assert!(ThresholdOperator::Lte.compare(five, five));
        assert!(ThresholdOperator::Eq.compare(ten, ten));
    }

    #[test]
    fn cancelled_invoices_do_not_block_the_period() {
        assert!(!InvoiceStatus::Cancelled.counts_for_period_uniqueness());
        assert!(InvoiceStatus::Void.counts_for_period_uniqueness());
        assert!(InvoiceStatus::Draft.counts_for_period_uniqueness());
    }
}
