//! Admin surface
//!
//! Organisation/project lifecycle, usage read paths, invoices, payments,
//! refunds, pricing and minimum-charge rules, exchange rates, alert rules
//! and history, email notifications and reconciliation runs. Every route
//! requires the admin api key (and the source allowlist when configured);
//! mutations are audit logged with the caller identity.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use meterflow_billing::{calculate, GeneratedOutcome, RateSet};
use meterflow_core::model::{
    AlertRule, AlertRuleType, AuditLogEntry, AuthContext, BillingConfig, CalculatedInvoice,
    ComparisonPeriod, ExchangeRate, Invoice, InvoiceLineItem, MinimumChargeRule, Organisation,
    Payment, PricingRule, Project, ThresholdOperator,
};
use meterflow_core::money::Currency;
use meterflow_pipeline::{generate_api_key, hash_api_key};
use meterflow_storage::{
    alerts, audit, aggregates, events, invoices, notifications, organisations, payments,
    pricing, reconciliation, refunds,
};

use crate::error::{ApiError, ApiResult};
use crate::events::bearer_token;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/organisations", post(create_organisation).get(list_organisations))
        .route("/organisations/:id", get(get_organisation).delete(delete_organisation))
        .route("/organisations/:id/billing-config", put(put_billing_config))
        .route("/organisations/:id/projects", post(create_project).get(list_projects))
        .route("/projects/:id/rotate-key", post(rotate_project_key))
        .route("/organisations/:id/usage/summary", get(usage_summary))
        .route("/organisations/:id/usage/trend", get(usage_trend))
        .route("/organisations/:id/usage/cost", get(usage_cost))
        .route("/organisations/:id/invoices", get(list_invoices))
        .route("/organisations/:id/invoices/generate", post(generate_invoice))
        .route("/invoices/:id", get(get_invoice))
        .route("/invoices/:id/pay", post(create_payment_order))
        .route("/organisations/:id/payments", get(list_payments))
        .route("/payments/:id/retry", post(retry_payment))
        .route("/payments/:id/retry-status", get(retry_status))
        .route("/payments/:id/refund", post(create_refund))
        .route("/payments/:id/refunds", get(list_refunds))
        .route("/pricing-rules", post(create_pricing_rule).get(list_pricing_rules))
        .route("/pricing-rules/:id", delete(delete_pricing_rule))
        .route("/minimum-charge-rules", post(create_minimum_rule))
        .route("/exchange-rates", post(upsert_exchange_rate).get(list_exchange_rates))
        .route("/exchange-rates/sync", post(sync_exchange_rates))
        .route("/alert-rules", post(create_alert_rule).get(list_alert_rules))
        .route(
            "/alert-rules/:id",
            put(update_alert_rule).delete(delete_alert_rule),
        )
        .route("/alerts/history", get(alert_history))
        .route("/email-notifications", get(list_email_notifications))
        .route("/reconciliation/runs", get(reconciliation_runs))
}

/// Admin gate applied in front of the whole `/admin` subtree. The surface is
/// disabled entirely until an admin api key is configured.
pub async fn require_admin(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_config.admin_api_key.as_deref() else {
        return Err(ApiError::forbidden());
    };
    let token = admin_token(request.headers())?;
    if token != expected {
        return Err(ApiError::unauthorized());
    }
    if !state.api_config.admin_ip_whitelist.is_empty() {
        let allowed = connect_info
            .map(|ConnectInfo(addr)| {
                let ip = addr.ip().to_string();
                state.api_config.admin_ip_whitelist.iter().any(|entry| entry == &ip)
            })
            .unwrap_or(false);
        if !allowed {
            return Err(ApiError::forbidden());
        }
    }
    Ok(next.run(request).await)
}

fn admin_token(headers: &HeaderMap) -> ApiResult<&str> {
    if let Some(key) = headers.get("x-admin-key").and_then(|v| v.to_str().ok()) {
        return Ok(key.trim());
    }
    bearer_token(headers)
}

fn auth_context(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> AuthContext {
    AuthContext {
        actor: "admin".to_string(),
        organisation_id: None,
        permissions: vec!["*".to_string()],
        ip_address: connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

async fn record_admin_audit(
    state: &AppState,
    entity_type: &str,
    entity_id: &str,
    action: &str,
    actor: &AuthContext,
    after: Option<serde_json::Value>,
) {
    let entry = AuditLogEntry {
        id: Uuid::new_v4(),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        action: action.to_string(),
        actor: actor.actor.clone(),
        before: None,
        after,
        ip_address: actor.ip_address.clone(),
        user_agent: actor.user_agent.clone(),
        created_at: Utc::now(),
    };
    if let Err(e) = audit::append_standalone(&state.store, &entry).await {
        tracing::warn!("admin audit append failed: {e}");
    }
}

// ---------------------------------------------------------------- organisations

#[derive(Debug, Deserialize)]
pub struct CreateOrganisationRequest {
    pub name: String,
    #[serde(default)]
    pub currency: Option<String>,
}

async fn create_organisation(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<CreateOrganisationRequest>,
) -> ApiResult<(StatusCode, Json<Organisation>)> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("organisation name must not be empty"));
    }
    let currency = match request.currency.as_deref() {
        Some(code) => Currency::parse(code).map_err(|e| ApiError::bad_request(e.to_string()))?,
        None => Currency::INR,
    };
    let now = Utc::now();
    let organisation = Organisation {
        id: Uuid::new_v4(),
        name: request.name.trim().to_string(),
        currency,
        gateway_customer_id: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    organisations::insert_organisation(&state.store, &organisation).await?;

    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(
        &state,
        "organisation",
        &organisation.id.to_string(),
        "created",
        &actor,
        serde_json::to_value(&organisation).ok(),
    )
    .await;
    Ok((StatusCode::CREATED, Json(organisation)))
}

async fn list_organisations(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Organisation>>> {
    Ok(Json(organisations::list_organisations(&state.store, false).await?))
}

async fn get_organisation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Organisation>> {
    Ok(Json(organisations::get_organisation(&state.store, id).await?))
}

async fn delete_organisation(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    organisations::soft_delete_organisation(&state.store, id).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(&state, "organisation", &id.to_string(), "deleted", &actor, None).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BillingConfigRequest {
    pub tax_rate: Decimal,
    pub currency: String,
    pub payment_terms_days: i32,
    pub minimum_charge_enabled: bool,
}

async fn put_billing_config(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<BillingConfigRequest>,
) -> ApiResult<Json<BillingConfig>> {
    organisations::get_organisation(&state.store, id).await?;
    if request.tax_rate < Decimal::ZERO || request.tax_rate >= Decimal::ONE {
        return Err(ApiError::bad_request("tax_rate must be in [0, 1)"));
    }
    let config = BillingConfig {
        organisation_id: id,
        tax_rate: request.tax_rate,
        currency: Currency::parse(&request.currency)
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        payment_terms_days: request.payment_terms_days,
        minimum_charge_enabled: request.minimum_charge_enabled,
        updated_at: Utc::now(),
    };
    organisations::upsert_billing_config(&state.store, &config).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(
        &state,
        "billing_config",
        &id.to_string(),
        "updated",
        &actor,
        serde_json::to_value(&config).ok(),
    )
    .await;
    Ok(Json(config))
}

// ---------------------------------------------------------------- projects

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ProjectCreatedResponse {
    #[serde(flatten)]
    pub project: Project,
    /// Shown exactly once; only the hash is stored
    pub api_key: String,
}

async fn create_project(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(organisation_id): Path<Uuid>,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<ProjectCreatedResponse>)> {
    organisations::get_organisation(&state.store, organisation_id).await?;
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("project name must not be empty"));
    }
    let api_key = generate_api_key();
    let now = Utc::now();
    let project = Project {
        id: Uuid::new_v4(),
        organisation_id,
        name: request.name.trim().to_string(),
        api_key_hash: hash_api_key(&api_key),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    organisations::insert_project(&state.store, &project).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(
        &state,
        "project",
        &project.id.to_string(),
        "created",
        &actor,
        serde_json::json!({ "name": project.name, "organisation_id": organisation_id }).into(),
    )
    .await;
    Ok((
        StatusCode::CREATED,
        Json(ProjectCreatedResponse { project, api_key }),
    ))
}

async fn list_projects(
    State(state): State<AppState>,
    Path(organisation_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(
        organisations::list_projects(&state.store, organisation_id).await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct RotatedKeyResponse {
    pub project_id: Uuid,
    /// The new key, shown exactly once
    pub api_key: String,
}

async fn rotate_project_key(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<RotatedKeyResponse>> {
    let project = organisations::get_project(&state.store, project_id).await?;
    let api_key = generate_api_key();
    organisations::rotate_project_key(&state.store, project_id, &hash_api_key(&api_key)).await?;
    state.keys.invalidate_hash(&project.api_key_hash);
    state.keys.invalidate_project(project_id);
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(&state, "project", &project_id.to_string(), "key_rotated", &actor, None)
        .await;
    Ok(Json(RotatedKeyResponse { project_id, api_key }))
}

// ---------------------------------------------------------------- usage

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub month: u32,
    pub year: i32,
}

async fn usage_summary(
    State(state): State<AppState>,
    Path(organisation_id): Path<Uuid>,
    Query(period): Query<PeriodQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let rows = aggregates::usage_summary(&state.store, organisation_id, period.month, period.year)
        .await?;
    Ok(Json(serde_json::json!({
        "organisation_id": organisation_id,
        "month": period.month,
        "year": period.year,
        "metrics": rows,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    pub metric: String,
    pub unit: String,
    #[serde(default = "default_trend_days")]
    pub days: i64,
}

fn default_trend_days() -> i64 {
    30
}

async fn usage_trend(
    State(state): State<AppState>,
    Path(organisation_id): Path<Uuid>,
    Query(query): Query<TrendQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let to = Utc::now();
    let from = to - Duration::days(query.days.clamp(1, 365));
    let points = events::usage_trend(
        &state.store,
        organisation_id,
        &query.metric,
        &query.unit,
        from,
        to,
    )
    .await?;
    Ok(Json(serde_json::json!({
        "organisation_id": organisation_id,
        "metric": query.metric,
        "unit": query.unit,
        "points": points,
    })))
}

/// Cost preview: the calculator runs on live aggregates without persisting
/// anything.
async fn usage_cost(
    State(state): State<AppState>,
    Path(organisation_id): Path<Uuid>,
    Query(period): Query<PeriodQuery>,
) -> ApiResult<Json<CalculatedInvoice>> {
    let period_aggregates =
        aggregates::list_for_org_period(&state.store, organisation_id, period.month, period.year)
            .await?;
    let config = organisations::get_billing_config(&state.store, organisation_id)
        .await?
        .ok_or_else(|| {
            ApiError::bad_request(format!("no billing config for organisation {organisation_id}"))
        })?;
    let at = Utc::now();
    let pricing_rules = pricing::effective_pricing_rules(&state.store, organisation_id, at).await?;
    let minimum_rules = pricing::effective_minimum_rules(&state.store, organisation_id, at).await?;
    let rate_set: RateSet = state
        .currency
        .snapshot()
        .await
        .map_err(ApiError::from)?;
    let preview = calculate(
        &period_aggregates,
        &pricing_rules,
        &minimum_rules,
        &config,
        &rate_set,
        period.month,
        period.year,
    )?;
    Ok(Json(preview))
}

// ---------------------------------------------------------------- invoices

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_invoices(
    State(state): State<AppState>,
    Path(organisation_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Invoice>>> {
    Ok(Json(
        invoices::list_for_org(
            &state.store,
            organisation_id,
            page.limit.clamp(1, 500),
            page.offset.max(0),
        )
        .await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct InvoiceDetailResponse {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub line_items: Vec<InvoiceLineItem>,
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InvoiceDetailResponse>> {
    let invoice = invoices::get(&state.store, id).await?;
    let line_items = invoices::lines_for(&state.store, id).await?;
    Ok(Json(InvoiceDetailResponse { invoice, line_items }))
}

#[derive(Debug, Serialize)]
pub struct GenerateInvoiceResponse {
    pub created: bool,
    pub invoice: Option<Invoice>,
}

async fn generate_invoice(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(organisation_id): Path<Uuid>,
    Json(period): Json<PeriodQuery>,
) -> ApiResult<(StatusCode, Json<GenerateInvoiceResponse>)> {
    let actor = auth_context(&headers, connect_info.as_ref());
    let outcome = state
        .generator
        .generate_for_org(organisation_id, period.month, period.year, &actor)
        .await?;
    let response = match outcome {
        GeneratedOutcome::Created(invoice) => (
            StatusCode::CREATED,
            GenerateInvoiceResponse { created: true, invoice: Some(invoice) },
        ),
        GeneratedOutcome::Existing(invoice) => (
            StatusCode::OK,
            GenerateInvoiceResponse { created: false, invoice: Some(invoice) },
        ),
        GeneratedOutcome::NoUsage => (
            StatusCode::OK,
            GenerateInvoiceResponse { created: false, invoice: None },
        ),
    };
    Ok((response.0, Json(response.1)))
}

// ---------------------------------------------------------------- payments

async fn create_payment_order(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Payment>)> {
    let actor = auth_context(&headers, connect_info.as_ref());
    let payment = state.payments.create_order(invoice_id, &actor).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn list_payments(
    State(state): State<AppState>,
    Path(organisation_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Payment>>> {
    Ok(Json(
        payments::list_for_org(
            &state.store,
            organisation_id,
            page.limit.clamp(1, 500),
            page.offset.max(0),
        )
        .await?,
    ))
}

async fn retry_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<Payment>> {
    state.retry.retry_one(payment_id).await?;
    Ok(Json(payments::get(&state.store, payment_id).await?))
}

#[derive(Debug, Serialize)]
pub struct RetryStatusResponse {
    pub payment_id: Uuid,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub retry_history: Vec<meterflow_core::model::RetryAttempt>,
}

async fn retry_status(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<RetryStatusResponse>> {
    let payment = payments::get(&state.store, payment_id).await?;
    Ok(Json(RetryStatusResponse {
        payment_id,
        status: payment.status.to_string(),
        retry_count: payment.retry_count,
        max_retries: payment.max_retries,
        next_retry_at: payment.next_retry_at,
        last_retry_at: payment.last_retry_at,
        retry_history: payment.retry_history,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn create_refund(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> ApiResult<(StatusCode, Json<meterflow_core::model::Refund>)> {
    let actor = auth_context(&headers, connect_info.as_ref());
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let refund = state
        .refunds
        .refund(payment_id, request.amount, request.reason, &request_id, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(refund)))
}

async fn list_refunds(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<Vec<meterflow_core::model::Refund>>> {
    Ok(Json(refunds::list_for_payment(&state.store, payment_id).await?))
}

// ---------------------------------------------------------------- pricing

#[derive(Debug, Deserialize)]
pub struct PricingRuleRequest {
    #[serde(default)]
    pub organisation_id: Option<Uuid>,
    pub metric_name: String,
    pub unit: String,
    pub price_per_unit: Decimal,
    pub currency: String,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
}

async fn create_pricing_rule(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<PricingRuleRequest>,
) -> ApiResult<(StatusCode, Json<PricingRule>)> {
    if request.price_per_unit < Decimal::ZERO {
        return Err(ApiError::bad_request("price_per_unit must be non-negative"));
    }
    let now = Utc::now();
    let rule = PricingRule {
        id: Uuid::new_v4(),
        organisation_id: request.organisation_id,
        metric_name: request.metric_name,
        unit: request.unit,
        price_per_unit: request.price_per_unit,
        currency: Currency::parse(&request.currency)
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        effective_from: request.effective_from.unwrap_or(now),
        effective_to: None,
        created_at: now,
    };
    pricing::insert_pricing_rule(&state.store, &rule).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(
        &state,
        "pricing_rule",
        &rule.id.to_string(),
        "created",
        &actor,
        serde_json::to_value(&rule).ok(),
    )
    .await;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[derive(Debug, Deserialize)]
pub struct RuleListQuery {
    #[serde(default)]
    pub organisation_id: Option<Uuid>,
}

async fn list_pricing_rules(
    State(state): State<AppState>,
    Query(query): Query<RuleListQuery>,
) -> ApiResult<Json<Vec<PricingRule>>> {
    Ok(Json(
        pricing::list_pricing_rules(&state.store, query.organisation_id).await?,
    ))
}

async fn delete_pricing_rule(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    pricing::delete_pricing_rule(&state.store, id).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(&state, "pricing_rule", &id.to_string(), "deleted", &actor, None).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MinimumRuleRequest {
    #[serde(default)]
    pub organisation_id: Option<Uuid>,
    pub minimum_amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
}

async fn create_minimum_rule(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<MinimumRuleRequest>,
) -> ApiResult<(StatusCode, Json<MinimumChargeRule>)> {
    if request.minimum_amount <= Decimal::ZERO {
        return Err(ApiError::bad_request("minimum_amount must be positive"));
    }
    let now = Utc::now();
    let rule = MinimumChargeRule {
        id: Uuid::new_v4(),
        organisation_id: request.organisation_id,
        minimum_amount: request.minimum_amount,
        currency: Currency::parse(&request.currency)
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        effective_from: request.effective_from.unwrap_or(now),
        effective_to: None,
        created_at: now,
    };
    pricing::insert_minimum_rule(&state.store, &rule).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(
        &state,
        "minimum_charge_rule",
        &rule.id.to_string(),
        "created",
        &actor,
        serde_json::to_value(&rule).ok(),
    )
    .await;
    Ok((StatusCode::CREATED, Json(rule)))
}

// ---------------------------------------------------------------- exchange rates

#[derive(Debug, Deserialize)]
pub struct ExchangeRateRequest {
    pub base_currency: String,
    pub target_currency: String,
    pub rate: Decimal,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
}

async fn upsert_exchange_rate(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<ExchangeRateRequest>,
) -> ApiResult<(StatusCode, Json<ExchangeRate>)> {
    let now = Utc::now();
    let rate = ExchangeRate {
        id: Uuid::new_v4(),
        base_currency: Currency::parse(&request.base_currency)
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        target_currency: Currency::parse(&request.target_currency)
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        rate: request.rate,
        effective_from: request.effective_from.unwrap_or(now),
        effective_to: None,
        source: "manual".to_string(),
        created_at: now,
    };
    state.currency.upsert(&rate).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(
        &state,
        "exchange_rate",
        &rate.id.to_string(),
        "created",
        &actor,
        serde_json::to_value(&rate).ok(),
    )
    .await;
    Ok((StatusCode::CREATED, Json(rate)))
}

#[derive(Debug, Deserialize)]
pub struct RateListQuery {
    #[serde(default)]
    pub base: Option<String>,
}

async fn list_exchange_rates(
    State(state): State<AppState>,
    Query(query): Query<RateListQuery>,
) -> ApiResult<Json<Vec<ExchangeRate>>> {
    let base = query
        .base
        .as_deref()
        .map(Currency::parse)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(state.currency.list(base).await?))
}

async fn sync_exchange_rates(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let applied = state.currency.sync().await?;
    Ok(Json(serde_json::json!({ "applied": applied })))
}

// ---------------------------------------------------------------- alerts

#[derive(Debug, Deserialize)]
pub struct AlertRuleRequest {
    #[serde(default)]
    pub organisation_id: Option<Uuid>,
    pub name: String,
    pub rule_type: AlertRuleType,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub threshold: Option<Decimal>,
    #[serde(default)]
    pub operator: Option<ThresholdOperator>,
    pub comparison_period: ComparisonPeriod,
    #[serde(default)]
    pub spike_percent: Option<Decimal>,
    #[serde(default)]
    pub reference_period: Option<ComparisonPeriod>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: i64,
}

fn default_true() -> bool {
    true
}

fn default_channels() -> Vec<String> {
    vec!["log".to_string()]
}

fn default_cooldown() -> i64 {
    60
}

fn rule_from_request(id: Uuid, request: AlertRuleRequest) -> ApiResult<AlertRule> {
    match request.rule_type {
        AlertRuleType::UsageThreshold | AlertRuleType::CostThreshold | AlertRuleType::UnusualPattern => {
            if request.metric_name.is_none() || request.threshold.is_none() {
                return Err(ApiError::bad_request(
                    "threshold rules require metric_name and threshold",
                ));
            }
        }
        AlertRuleType::UsageSpike => {
            if request.metric_name.is_none() || request.spike_percent.is_none() {
                return Err(ApiError::bad_request(
                    "spike rules require metric_name and spike_percent",
                ));
            }
        }
    }
    Ok(AlertRule {
        id,
        organisation_id: request.organisation_id,
        name: request.name,
        rule_type: request.rule_type,
        metric_name: request.metric_name,
        unit: request.unit,
        threshold: request.threshold,
        operator: request.operator,
        comparison_period: request.comparison_period,
        spike_percent: request.spike_percent,
        reference_period: request.reference_period,
        is_active: request.is_active,
        channels: request.channels,
        cooldown_minutes: request.cooldown_minutes,
        last_alert_at: None,
        created_at: Utc::now(),
    })
}

async fn create_alert_rule(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<AlertRuleRequest>,
) -> ApiResult<(StatusCode, Json<AlertRule>)> {
    let rule = rule_from_request(Uuid::new_v4(), request)?;
    alerts::insert_rule(&state.store, &rule).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(
        &state,
        "alert_rule",
        &rule.id.to_string(),
        "created",
        &actor,
        serde_json::to_value(&rule).ok(),
    )
    .await;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn list_alert_rules(State(state): State<AppState>) -> ApiResult<Json<Vec<AlertRule>>> {
    Ok(Json(alerts::list_rules(&state.store, false).await?))
}

async fn update_alert_rule(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<AlertRuleRequest>,
) -> ApiResult<Json<AlertRule>> {
    alerts::get_rule(&state.store, id).await?;
    let rule = rule_from_request(id, request)?;
    alerts::update_rule(&state.store, &rule).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(
        &state,
        "alert_rule",
        &id.to_string(),
        "updated",
        &actor,
        serde_json::to_value(&rule).ok(),
    )
    .await;
    Ok(Json(rule))
}

async fn delete_alert_rule(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    alerts::delete_rule(&state.store, id).await?;
    let actor = auth_context(&headers, connect_info.as_ref());
    record_admin_audit(&state, "alert_rule", &id.to_string(), "deleted", &actor, None).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AlertHistoryQuery {
    #[serde(default)]
    pub rule_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

async fn alert_history(
    State(state): State<AppState>,
    Query(query): Query<AlertHistoryQuery>,
) -> ApiResult<Json<Vec<meterflow_core::model::AlertEvent>>> {
    Ok(Json(
        alerts::list_history(&state.store, query.rule_id, query.limit.clamp(1, 500)).await?,
    ))
}

// ---------------------------------------------------------------- misc

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub organisation_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

async fn list_email_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Json<Vec<meterflow_core::model::EmailNotification>>> {
    Ok(Json(
        notifications::list(
            &state.store,
            query.organisation_id,
            query.limit.clamp(1, 500),
        )
        .await?,
    ))
}

async fn reconciliation_runs(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<meterflow_core::model::ReconciliationRun>>> {
    Ok(Json(
        reconciliation::list_recent(&state.store, None, page.limit.clamp(1, 500)).await?,
    ))
}
