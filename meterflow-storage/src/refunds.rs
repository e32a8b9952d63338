//! Refund repository
//!
//! Refund rows are inserted `pending` and settled by gateway webhooks. The
//! `apply_processed_refund` trigger owns the payment/invoice coupling: when
//! a refund lands `processed` it moves the payment to `refunded` or
//! `partially_refunded` and the invoice to `refunded` once the full amount
//! has been returned.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meterflow_core::errors::{StoreError, StoreResult};
use meterflow_core::model::{InvoiceId, PaymentId, Refund, RefundStatus};

use crate::store::{parse_currency, parse_enum, DsTransaction, DurableStore};

fn refund_from_row(row: &PgRow) -> StoreResult<Refund> {
    Ok(Refund {
        id: row.try_get("id")?,
        payment_id: row.try_get("payment_id")?,
        invoice_id: row.try_get("invoice_id")?,
        refund_number: row.try_get("refund_number")?,
        amount: row.try_get("amount")?,
        currency: parse_currency(row.try_get("currency")?)?,
        status: parse_enum(row.try_get("status")?)?,
        refund_type: parse_enum(row.try_get("refund_type")?)?,
        reason: row.try_get("reason")?,
        gateway_refund_id: row.try_get("gateway_refund_id")?,
        initiated_by: row.try_get("initiated_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(tx: &mut DsTransaction<'_>, refund: &Refund) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO refunds (
            id, payment_id, invoice_id, refund_number, amount, currency,
            status, refund_type, reason, gateway_refund_id, initiated_by,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(refund.id)
    .bind(refund.payment_id)
    .bind(refund.invoice_id)
    .bind(&refund.refund_number)
    .bind(refund.amount)
    .bind(refund.currency.as_str())
    .bind(refund.status.as_str())
    .bind(refund.refund_type.as_str())
    .bind(&refund.reason)
    .bind(&refund.gateway_refund_id)
    .bind(&refund.initiated_by)
    .bind(refund.created_at)
    .bind(refund.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get(store: &DurableStore, id: Uuid) -> StoreResult<Refund> {
    let row = sqlx::query("SELECT * FROM refunds WHERE id = $1")
        .bind(id)
        .fetch_optional(store.pool())
        .await?;
    match row {
        Some(row) => refund_from_row(&row),
        None => Err(StoreError::NotFound {
            entity: "refund",
            id: id.to_string(),
        }),
    }
}

pub async fn find_by_gateway_refund_id(
    store: &DurableStore,
    gateway_refund_id: &str,
) -> StoreResult<Option<Refund>> {
    let row = sqlx::query("SELECT * FROM refunds WHERE gateway_refund_id = $1")
        .bind(gateway_refund_id)
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(refund_from_row).transpose()
}

/// Sum of refunds already claimed against a payment, counting in-flight
/// pending refunds so concurrent requests cannot over-refund.
pub async fn claimed_total_for_payment(
    store: &DurableStore,
    payment_id: PaymentId,
) -> StoreResult<Decimal> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(amount), 0) AS total
        FROM refunds
        WHERE payment_id = $1 AND status IN ('pending', 'processed')
        "#,
    )
    .bind(payment_id)
    .fetch_one(store.pool())
    .await?;
    Ok(row.try_get("total")?)
}

/// Settle a refund from a gateway webhook; the trigger cascades payment and
/// invoice updates inside the same transaction.
pub async fn update_status(
    tx: &mut DsTransaction<'_>,
    id: Uuid,
    status: RefundStatus,
    gateway_refund_id: Option<&str>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE refunds
        SET status = $2,
            gateway_refund_id = COALESCE($3, gateway_refund_id),
            updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(gateway_refund_id)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_for_payment(
    store: &DurableStore,
    payment_id: PaymentId,
) -> StoreResult<Vec<Refund>> {
    let rows = sqlx::query(
        "SELECT * FROM refunds WHERE payment_id = $1 ORDER BY created_at",
    )
    .bind(payment_id)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(refund_from_row).collect()
}

pub async fn list_for_invoice(
    store: &DurableStore,
    invoice_id: InvoiceId,
) -> StoreResult<Vec<Refund>> {
    let rows = sqlx::query(
        "SELECT * FROM refunds WHERE invoice_id = $1 ORDER BY created_at",
    )
    .bind(invoice_id)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(refund_from_row).collect()
}
