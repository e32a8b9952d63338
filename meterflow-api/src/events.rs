//! Event ingest endpoint
//!
//! `POST /api/v1/events` (also mounted at `/events`). Authenticated by the
//! project api key in the `Authorization: Bearer` header; both accepted and
//! duplicate events answer 202 so client retries stay cheap.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use meterflow_core::model::{IngestEvent, IngestOutcome};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub event_id: String,
    pub metric_name: String,
    pub metric_value: Decimal,
    pub unit: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub event_id: String,
    pub status: IngestOutcome,
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(ApiError::unauthorized)
}

pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let api_key = bearer_token(&headers)?;
    let event = IngestEvent {
        event_id: request.event_id.clone(),
        metric_name: request.metric_name,
        metric_value: request.metric_value,
        unit: request.unit,
        timestamp: request.timestamp,
        metadata: request.metadata,
    };
    let outcome = state.ingest.ingest(api_key, event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            event_id: request.event_id,
            status: outcome,
        }),
    ))
}
