//! Payment gateway webhook endpoint
//!
//! `POST /webhooks/razorpay` with the hex HMAC-SHA-256 of the raw body in
//! `X-Razorpay-Signature`. Signature and payload problems are 400 (terminal
//! for the gateway), unknown invoices 404, transient backend failures 5xx
//! so the gateway retries; successful and replayed deliveries both answer
//! 200.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;

use meterflow_payments::service::WebhookOutcome;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-razorpay-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WebhookResponse>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "missing_signature",
                "signature header required",
            )
        })?;

    let outcome = state.payments.handle_webhook(&body, signature).await?;
    let status = match outcome {
        WebhookOutcome::Applied => "processed",
        WebhookOutcome::Replayed => "ok",
        WebhookOutcome::Ignored => "ignored",
    };
    Ok((StatusCode::OK, Json(WebhookResponse { status })))
}
