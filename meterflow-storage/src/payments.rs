//! Payment repository
//!
//! Payments are inserted `pending` at order creation and advance through
//! webhook-driven transitions; the webhook handler locks the row before any
//! transition so concurrent deliveries serialise. Retry bookkeeping lives in
//! columns plus a JSONB history the retry engine appends to.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use meterflow_core::errors::{StoreError, StoreResult};
use meterflow_core::model::{
    InvoiceId, OrganisationId, Payment, PaymentId, PaymentStatus, RetryAttempt,
};

use crate::store::{parse_currency, parse_enum, DsTransaction, DurableStore};

fn payment_from_row(row: &PgRow) -> StoreResult<Payment> {
    let history: serde_json::Value = row.try_get("retry_history")?;
    let retry_history: Vec<RetryAttempt> =
        serde_json::from_value(history).map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(Payment {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        invoice_id: row.try_get("invoice_id")?,
        gateway_order_id: row.try_get("gateway_order_id")?,
        gateway_payment_id: row.try_get("gateway_payment_id")?,
        amount: row.try_get("amount")?,
        currency: parse_currency(row.try_get("currency")?)?,
        status: parse_enum(row.try_get("status")?)?,
        method: row.try_get("method")?,
        paid_at: row.try_get("paid_at")?,
        reconciled_at: row.try_get("reconciled_at")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_retry_at: row.try_get("last_retry_at")?,
        retry_history,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(tx: &mut DsTransaction<'_>, payment: &Payment) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO payments (
            id, organisation_id, invoice_id, gateway_order_id, gateway_payment_id,
            amount, currency, status, method, paid_at, reconciled_at,
            retry_count, max_retries, next_retry_at, last_retry_at, retry_history,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                  $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(payment.id)
    .bind(payment.organisation_id)
    .bind(payment.invoice_id)
    .bind(&payment.gateway_order_id)
    .bind(&payment.gateway_payment_id)
    .bind(payment.amount)
    .bind(payment.currency.as_str())
    .bind(payment.status.as_str())
    .bind(&payment.method)
    .bind(payment.paid_at)
    .bind(payment.reconciled_at)
    .bind(payment.retry_count)
    .bind(payment.max_retries)
    .bind(payment.next_retry_at)
    .bind(payment.last_retry_at)
    .bind(serde_json::to_value(&payment.retry_history).map_err(StoreError::Encoding)?)
    .bind(payment.created_at)
    .bind(payment.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get(store: &DurableStore, id: PaymentId) -> StoreResult<Payment> {
    let row = sqlx::query("SELECT * FROM payments WHERE id = $1")
        .bind(id)
        .fetch_optional(store.pool())
        .await?;
    match row {
        Some(row) => payment_from_row(&row),
        None => Err(StoreError::NotFound {
            entity: "payment",
            id: id.to_string(),
        }),
    }
}

pub async fn get_for_update(
    tx: &mut DsTransaction<'_>,
    id: PaymentId,
) -> StoreResult<Payment> {
    let row = sqlx::query("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(row) => payment_from_row(&row),
        None => Err(StoreError::NotFound {
            entity: "payment",
            id: id.to_string(),
        }),
    }
}

/// Row-locked lookup by the gateway's order id; webhook deliveries reference
/// payments this way before a gateway payment id exists locally.
pub async fn find_by_order_id_for_update(
    tx: &mut DsTransaction<'_>,
    gateway_order_id: &str,
) -> StoreResult<Option<Payment>> {
    let row = sqlx::query("SELECT * FROM payments WHERE gateway_order_id = $1 FOR UPDATE")
        .bind(gateway_order_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(payment_from_row).transpose()
}

pub async fn find_by_gateway_payment_id_for_update(
    tx: &mut DsTransaction<'_>,
    gateway_payment_id: &str,
) -> StoreResult<Option<Payment>> {
    let row = sqlx::query("SELECT * FROM payments WHERE gateway_payment_id = $1 FOR UPDATE")
        .bind(gateway_payment_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(payment_from_row).transpose()
}

pub async fn find_by_gateway_payment_id(
    store: &DurableStore,
    gateway_payment_id: &str,
) -> StoreResult<Option<Payment>> {
    let row = sqlx::query("SELECT * FROM payments WHERE gateway_payment_id = $1")
        .bind(gateway_payment_id)
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(payment_from_row).transpose()
}

/// A non-failed payment already covering the invoice, making order creation
/// idempotent per invoice.
pub async fn find_active_for_invoice(
    store: &DurableStore,
    invoice_id: InvoiceId,
) -> StoreResult<Option<Payment>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM payments
        WHERE invoice_id = $1 AND status <> 'failed'
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(invoice_id)
    .fetch_optional(store.pool())
    .await?;
    row.as_ref().map(payment_from_row).transpose()
}

/// Apply a webhook-driven transition under the row lock the caller holds.
pub async fn apply_transition(
    tx: &mut DsTransaction<'_>,
    id: PaymentId,
    to: PaymentStatus,
    gateway_payment_id: Option<&str>,
    method: Option<&str>,
    paid_at: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE payments
        SET status = $2,
            gateway_payment_id = COALESCE($3, gateway_payment_id),
            method = COALESCE($4, method),
            paid_at = COALESCE($5, paid_at),
            updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(to.as_str())
    .bind(gateway_payment_id)
    .bind(method)
    .bind(paid_at)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Failed payments whose backoff has elapsed and whose retry budget remains.
pub async fn list_retry_eligible(
    store: &DurableStore,
    now: DateTime<Utc>,
) -> StoreResult<Vec<Payment>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM payments
        WHERE status = 'failed'
          AND retry_count < max_retries
          AND next_retry_at IS NOT NULL
          AND next_retry_at <= $1
        ORDER BY next_retry_at
        "#,
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(payment_from_row).collect()
}

/// Record one retry attempt: bump the counter, append to the history, and
/// schedule (or clear) the next attempt. A successful retry re-enters
/// `pending` under the new gateway order.
pub async fn record_retry_attempt(
    tx: &mut DsTransaction<'_>,
    id: PaymentId,
    attempt: &RetryAttempt,
    next_retry_at: Option<DateTime<Utc>>,
    new_order_id: Option<&str>,
    new_status: PaymentStatus,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE payments
        SET retry_count = retry_count + 1,
            last_retry_at = $2,
            next_retry_at = $3,
            retry_history = retry_history || $4::jsonb,
            gateway_order_id = COALESCE($5, gateway_order_id),
            status = $6,
            updated_at = $2
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(attempt.at)
    .bind(next_retry_at)
    .bind(serde_json::to_value(attempt).map_err(StoreError::Encoding)?)
    .bind(new_order_id)
    .bind(new_status.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Payments stuck in `pending` beyond the gateway TTL; the janitor fails
/// them so the retry engine can take over.
pub async fn list_stale_pending(
    store: &DurableStore,
    cutoff: DateTime<Utc>,
) -> StoreResult<Vec<Payment>> {
    let rows = sqlx::query(
        "SELECT * FROM payments WHERE status = 'pending' AND created_at < $1",
    )
    .bind(cutoff)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(payment_from_row).collect()
}

/// Fail a payment and arm its first retry slot.
pub async fn mark_failed(
    tx: &mut DsTransaction<'_>,
    id: PaymentId,
    next_retry_at: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE payments
        SET status = 'failed', next_retry_at = $2, updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(next_retry_at)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn mark_reconciled(
    store: &DurableStore,
    id: PaymentId,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query("UPDATE payments SET reconciled_at = $2, updated_at = $2 WHERE id = $1")
        .bind(id)
        .bind(at)
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Rolling window for gateway-vs-durable reconciliation.
pub async fn list_created_since(
    store: &DurableStore,
    since: DateTime<Utc>,
) -> StoreResult<Vec<Payment>> {
    let rows = sqlx::query(
        "SELECT * FROM payments WHERE created_at >= $1 ORDER BY created_at",
    )
    .bind(since)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(payment_from_row).collect()
}

pub async fn list_for_org(
    store: &DurableStore,
    organisation_id: OrganisationId,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<Payment>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM payments
        WHERE organisation_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(organisation_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(payment_from_row).collect()
}
