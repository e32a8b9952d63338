//! Error types for the billing platform
//!
//! Every subsystem raises a typed error; the variants map onto the platform's
//! error kinds: validation, unauthorized, not-found, conflict (carrying the
//! surviving entity id), transient backend, permanent backend, calculation
//! mismatch, missing exchange rate and retry exhaustion. Components log with
//! a correlation id and re-raise unless they can locally recover.

use thiserror::Error;

/// Top-level error type for platform operations
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Ingest path errors
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Storage errors (hot store or durable store)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Money arithmetic errors
    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    /// Billing calculation and invoice generation errors
    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    /// Payment lifecycle errors
    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    /// Currency conversion errors
    #[error("Currency error: {0}")]
    Currency(#[from] CurrencyError),

    /// Alert evaluation errors
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    /// Reconciliation errors
    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    /// Capability transport errors (email, PDF, object store)
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Ingest path errors
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed input; surfaced as 400 and never retried
    #[error("Validation failed for {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Unknown or inactive project api key; surfaced as 401
    #[error("Unauthorized: unknown or inactive api key")]
    Unauthorized,

    /// Event timestamp too far in the future
    #[error("Timestamp {timestamp} is more than {max_skew_secs}s in the future")]
    TimestampInFuture { timestamp: String, max_skew_secs: u64 },

    /// Hot store failure while accepting the event
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Storage errors shared by the hot event store and the durable store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Unique key collision on insert
    #[error("Duplicate key: {key}")]
    DuplicateKey { key: String },

    /// Missing entity on a read path
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Idempotency conflict; carries the entity id of the first writer so
    /// callers can choose idempotent-success or 409
    #[error("Idempotency conflict for {entity_type}: existing entity {existing_id}")]
    IdempotencyConflict {
        entity_type: String,
        existing_id: String,
    },

    /// Invalid state transition rejected by the store
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Durable store errors (retryable when the backend is unreachable)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Hot store errors
    #[error("Hot store error: {0}")]
    Hot(#[from] sled::Error),

    /// Value encoding errors for hot store records
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Unexpected column contents while mapping a row
    #[error("Row decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the error is a transient backend condition worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Io(_))
            | StoreError::Database(sqlx::Error::PoolTimedOut)
            | StoreError::Database(sqlx::Error::PoolClosed) => true,
            StoreError::Hot(sled::Error::Io(_)) => true,
            _ => false,
        }
    }
}

/// Exact-decimal money kernel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// Arithmetic across two different currencies; must go through the
    /// currency service instead
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    /// Division by a zero quantity
    #[error("Division by zero")]
    DivideByZero,

    /// Not a valid ISO 4217 code
    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    /// Unparseable decimal amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Amount does not fit in minor units of the currency
    #[error("Amount {amount} overflows minor units of {currency}")]
    MinorUnitOverflow { amount: String, currency: String },
}

/// Billing calculation and invoice generation errors
#[derive(Error, Debug)]
pub enum BillingError {
    /// No pricing rule effective for an aggregate's metric at the billing date
    #[error("No pricing rule for metric {metric} ({unit}) effective at {at}")]
    UnpricedMetric {
        metric: String,
        unit: String,
        at: String,
    },

    /// The validation gate found a mismatch between recomputed and calculated
    /// amounts; fatal for the invoice, no partial writes
    #[error("Calculation mismatch on {field}: calculated {calculated}, recomputed {recomputed}")]
    CalculationMismatch {
        field: &'static str,
        calculated: String,
        recomputed: String,
    },

    /// No billing config row for the organisation
    #[error("No billing config for organisation {organisation_id}")]
    MissingBillingConfig { organisation_id: String },

    /// Month outside 1..=12
    #[error("Invalid billing period: month {month}")]
    InvalidPeriod { month: u32 },

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    #[error("Currency error: {0}")]
    Currency(#[from] CurrencyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Payment lifecycle errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Orders can only be created against finalized invoices
    #[error("Invoice {invoice_id} is {status}, expected finalized")]
    InvoiceNotFinalized { invoice_id: String, status: String },

    /// Webhook signature did not verify; terminal for the gateway (400)
    #[error("Webhook signature verification failed")]
    BadSignature,

    /// Webhook payload could not be parsed; terminal for the gateway (400)
    #[error("Malformed webhook payload: {0}")]
    MalformedWebhook(String),

    /// Webhook referenced an order with no local payment row
    #[error("Unknown gateway order: {order_id}")]
    UnknownOrder { order_id: String },

    /// Disallowed payment state transition
    #[error("Invalid payment transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Gateway refused the request; permanent, not retried
    #[error("Gateway rejected request ({status}): {message}")]
    GatewayRejected { status: u16, message: String },

    /// Gateway or network failure; retryable
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Refunds require a captured payment
    #[error("Payment {payment_id} is {status}, refunds require captured")]
    NotRefundable { payment_id: String, status: String },

    /// Refund amount exceeds what remains on the payment
    #[error("Refund of {requested} exceeds remaining refundable amount {remaining}")]
    RefundExceedsRemaining { requested: String, remaining: String },

    /// Refund amount must be positive
    #[error("Refund amount {0} must be positive")]
    InvalidRefundAmount(String),

    /// Terminal: retry budget spent; alerting channel is notified
    #[error("Payment {payment_id} exhausted its {max_retries} retries")]
    MaxRetriesExhausted { payment_id: String, max_retries: i32 },

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    #[error("Currency error: {0}")]
    Currency(#[from] CurrencyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Currency conversion errors
#[derive(Error, Debug)]
pub enum CurrencyError {
    /// No exchange rate effective for the pair at the requested date;
    /// fatal for the operation needing it
    #[error("No exchange rate {base}->{target} effective at {at}")]
    MissingRate {
        base: String,
        target: String,
        at: String,
    },

    /// Rates must be strictly positive
    #[error("Invalid exchange rate {base}->{target}: {rate}")]
    InvalidRate {
        base: String,
        target: String,
        rate: String,
    },

    /// External source sync failed; existing rows keep being used
    #[error("Exchange rate sync failed: {0}")]
    SyncFailed(String),

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Alert engine errors
#[derive(Error, Debug)]
pub enum AlertError {
    /// Rule is missing fields its type requires
    #[error("Invalid alert rule {rule_id}: {message}")]
    InvalidRule { rule_id: String, message: String },

    /// All configured channels failed for a triggered alert
    #[error("Notification delivery failed: {0}")]
    NotificationFailed(String),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum ReconciliationError {
    /// Gateway could not be queried for the payment window
    #[error("Gateway unavailable during reconciliation: {0}")]
    GatewayUnavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Capability transport errors
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Email send failed: {0}")]
    SendFailed(String),

    #[error("PDF rendering failed: {0}")]
    RenderFailed(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),
}

/// Result type alias for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Result type alias for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Result type alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

/// Result type alias for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;

/// Result type alias for currency operations
pub type CurrencyResult<T> = Result<T, CurrencyError>;

/// Result type alias for alert operations
pub type AlertResult<T> = Result<T, AlertError>;

/// Result type alias for reconciliation operations
pub type ReconciliationResult<T> = Result<T, ReconciliationError>;
