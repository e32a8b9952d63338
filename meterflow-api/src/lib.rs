//! # Meterflow API
//!
//! The HTTP surface: `POST /api/v1/events` for project-authenticated event
//! ingest, `POST /webhooks/razorpay` for signed gateway callbacks, the
//! admin surface under `/admin`, plus `/health` and `/metrics`. Handlers
//! hold no business logic; they translate between the wire and the services
//! in [`state::AppState`] and map typed errors onto the
//! `{error, code, statusCode, details?}` envelope.

pub mod admin;
pub mod error;
pub mod events;
pub mod state;
pub mod webhooks;

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use meterflow_core::config::ApiConfig;
use meterflow_core::errors::PlatformError;

use crate::state::AppState;

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let admin_routes = admin::router().route_layer(axum::middleware::from_fn_with_state(
        state.clone(),
        admin::require_admin,
    ));
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/events", post(events::ingest_event))
        .route("/events", post(events::ingest_event))
        .route("/webhooks/razorpay", post(webhooks::razorpay_webhook))
        .nest("/admin", admin_routes);
    if state.api_config.cors_enabled {
        app = app.layer(CorsLayer::permissive());
    }
    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// The API server; serves until the cancellation token fires, then drains.
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), PlatformError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| PlatformError::Config(format!("bind {addr}: {e}")))?;
        info!(%addr, "api server listening");

        let app = router(self.state)
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        info!("api server drained");
        Ok(())
    }
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    let hot_ok = state.hot.ping().is_ok();
    let durable_ok = state.store.ping().await.is_ok();
    let status = if hot_ok && durable_ok {
        StatusCode::OK
    } else {
        warn!(hot_ok, durable_ok, "health check degraded");
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if status == StatusCode::OK { "ok" } else { "degraded" },
            "hot_store": if hot_ok { "ok" } else { "unreachable" },
            "durable_store": if durable_ok { "ok" } else { "unreachable" },
        })),
    )
}

async fn metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
