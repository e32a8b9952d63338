//! API error envelope
//!
//! Every error leaves the API as `{error, code, statusCode, details?}`.
//! The mapping follows the platform's error kinds: validation and malformed
//! webhooks are 400, auth failures 401/403, missing entities 404, conflicts
//! 409 with the surviving entity id, transient backend trouble 5xx (which
//! invites gateway retries), everything permanent 400/422.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use meterflow_core::errors::{
    AlertError, BillingError, CurrencyError, IngestError, PaymentError, StoreError,
};

pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "authentication required")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", "insufficient permissions")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, "api error: {}", self.message);
        }
        let mut body = json!({
            "error": self.message,
            "code": self.code,
            "statusCode": self.status.as_u16(),
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { entity, id } => {
                ApiError::not_found(format!("{entity} {id} not found"))
            }
            StoreError::DuplicateKey { key } => ApiError::new(
                StatusCode::CONFLICT,
                "duplicate_key",
                format!("duplicate key {key}"),
            ),
            StoreError::IdempotencyConflict { existing_id, .. } => ApiError::new(
                StatusCode::CONFLICT,
                "idempotency_conflict",
                "operation already performed",
            )
            .with_details(json!({ "existing_id": existing_id })),
            StoreError::InvalidTransition { entity, from, to } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_transition",
                format!("{entity} cannot move from {from} to {to}"),
            ),
            StoreError::Database(db) if meterflow_storage::store::is_immutability_violation(db) => {
                ApiError::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "invoice_immutable",
                    "finalized invoices are immutable",
                )
            }
            _ if err.is_transient() => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable", err.to_string())
            }
            _ => ApiError::internal(err.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation { .. } | IngestError::TimestampInFuture { .. } => {
                ApiError::bad_request(err.to_string())
            }
            IngestError::Unauthorized => ApiError::unauthorized(),
            IngestError::Store(store) => store.into(),
        }
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::BadSignature => {
                ApiError::new(StatusCode::BAD_REQUEST, "bad_signature", "signature verification failed")
            }
            PaymentError::MalformedWebhook(_) => ApiError::bad_request(err.to_string()),
            PaymentError::UnknownOrder { .. } => ApiError::not_found(err.to_string()),
            PaymentError::InvoiceNotFinalized { .. }
            | PaymentError::InvalidTransition { .. }
            | PaymentError::NotRefundable { .. }
            | PaymentError::RefundExceedsRemaining { .. }
            | PaymentError::InvalidRefundAmount(_)
            | PaymentError::MaxRetriesExhausted { .. } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "payment_error",
                err.to_string(),
            ),
            PaymentError::GatewayRejected { .. } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "gateway_rejected", err.to_string())
            }
            PaymentError::GatewayUnavailable(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "gateway_unavailable", err.to_string())
            }
            PaymentError::Money(_) => ApiError::bad_request(err.to_string()),
            PaymentError::Currency(currency) => currency.into(),
            PaymentError::Store(store) => store.into(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::UnpricedMetric { .. } | BillingError::InvalidPeriod { .. } => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "billing_error", err.to_string())
            }
            BillingError::CalculationMismatch { .. } => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "calculation_mismatch",
                err.to_string(),
            ),
            BillingError::MissingBillingConfig { .. } => ApiError::bad_request(err.to_string()),
            BillingError::Money(_) => ApiError::bad_request(err.to_string()),
            BillingError::Currency(currency) => currency.into(),
            BillingError::Store(store) => store.into(),
        }
    }
}

impl From<CurrencyError> for ApiError {
    fn from(err: CurrencyError) -> Self {
        match err {
            CurrencyError::MissingRate { .. } | CurrencyError::InvalidRate { .. } => {
                ApiError::bad_request(err.to_string())
            }
            CurrencyError::SyncFailed(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "sync_failed", err.to_string())
            }
            CurrencyError::Money(_) => ApiError::bad_request(err.to_string()),
            CurrencyError::Store(store) => store.into(),
        }
    }
}

impl From<AlertError> for ApiError {
    fn from(err: AlertError) -> Self {
        match err {
            AlertError::InvalidRule { .. } => ApiError::bad_request(err.to_string()),
            AlertError::NotificationFailed(_) => ApiError::internal(err.to_string()),
            AlertError::Billing(billing) => billing.into(),
            AlertError::Store(store) => store.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
