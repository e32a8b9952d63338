//! Invoice repository
//!
//! Inserts happen inside the generator's transaction; the partial unique
//! index on `(organisation_id, month, year)` over non-cancelled rows and the
//! immutability trigger are the last line of defence behind the status
//! transition checks here.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use meterflow_core::errors::{StoreError, StoreResult};
use meterflow_core::model::{
    Invoice, InvoiceId, InvoiceLineItem, InvoiceStatus, OrganisationId,
};

use crate::store::{parse_currency, parse_enum, DsTransaction, DurableStore};

fn invoice_from_row(row: &PgRow) -> StoreResult<Invoice> {
    Ok(Invoice {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        invoice_number: row.try_get("invoice_number")?,
        status: parse_enum(row.try_get("status")?)?,
        subtotal: row.try_get("subtotal")?,
        subtotal_after_min: row.try_get("subtotal_after_min")?,
        tax: row.try_get("tax")?,
        discount: row.try_get("discount")?,
        total: row.try_get("total")?,
        currency: parse_currency(row.try_get("currency")?)?,
        month: row.try_get::<i32, _>("month")? as u32,
        year: row.try_get("year")?,
        due_date: row.try_get("due_date")?,
        issued_at: row.try_get("issued_at")?,
        paid_at: row.try_get("paid_at")?,
        pdf_url: row.try_get("pdf_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn line_item_from_row(row: &PgRow) -> StoreResult<InvoiceLineItem> {
    Ok(InvoiceLineItem {
        id: row.try_get("id")?,
        invoice_id: row.try_get("invoice_id")?,
        line_number: row.try_get("line_number")?,
        description: row.try_get("description")?,
        metric_name: row.try_get("metric_name")?,
        unit: row.try_get("unit")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        total: row.try_get("total")?,
        metadata: row.try_get("metadata")?,
    })
}

/// Insert an invoice and its line items in the caller's transaction.
pub async fn insert_with_lines(
    tx: &mut DsTransaction<'_>,
    invoice: &Invoice,
    lines: &[InvoiceLineItem],
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoices (
            id, organisation_id, invoice_number, status, subtotal,
            subtotal_after_min, tax, discount, total, currency,
            month, year, due_date, issued_at, paid_at, pdf_url,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                  $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(invoice.id)
    .bind(invoice.organisation_id)
    .bind(&invoice.invoice_number)
    .bind(invoice.status.as_str())
    .bind(invoice.subtotal)
    .bind(invoice.subtotal_after_min)
    .bind(invoice.tax)
    .bind(invoice.discount)
    .bind(invoice.total)
    .bind(invoice.currency.as_str())
    .bind(invoice.month as i32)
    .bind(invoice.year)
    .bind(invoice.due_date)
    .bind(invoice.issued_at)
    .bind(invoice.paid_at)
    .bind(&invoice.pdf_url)
    .bind(invoice.created_at)
    .bind(invoice.updated_at)
    .execute(&mut **tx)
    .await?;

    for line in lines {
        sqlx::query(
            r#"
            INSERT INTO invoice_line_items (
                id, invoice_id, line_number, description, metric_name,
                unit, quantity, unit_price, total, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(line.id)
        .bind(line.invoice_id)
        .bind(line.line_number)
        .bind(&line.description)
        .bind(&line.metric_name)
        .bind(&line.unit)
        .bind(line.quantity)
        .bind(line.unit_price)
        .bind(line.total)
        .bind(&line.metadata)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn get(store: &DurableStore, id: InvoiceId) -> StoreResult<Invoice> {
    let row = sqlx::query("SELECT * FROM invoices WHERE id = $1")
        .bind(id)
        .fetch_optional(store.pool())
        .await?;
    match row {
        Some(row) => invoice_from_row(&row),
        None => Err(StoreError::NotFound {
            entity: "invoice",
            id: id.to_string(),
        }),
    }
}

/// Fetch and row-lock an invoice inside a transaction; used by the payment
/// state machine before coupling invoice status to payment transitions.
pub async fn get_for_update(
    tx: &mut DsTransaction<'_>,
    id: InvoiceId,
) -> StoreResult<Invoice> {
    let row = sqlx::query("SELECT * FROM invoices WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(row) => invoice_from_row(&row),
        None => Err(StoreError::NotFound {
            entity: "invoice",
            id: id.to_string(),
        }),
    }
}

pub async fn lines_for(
    store: &DurableStore,
    invoice_id: InvoiceId,
) -> StoreResult<Vec<InvoiceLineItem>> {
    let rows = sqlx::query(
        "SELECT * FROM invoice_line_items WHERE invoice_id = $1 ORDER BY line_number",
    )
    .bind(invoice_id)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(line_item_from_row).collect()
}

pub async fn list_for_org(
    store: &DurableStore,
    organisation_id: OrganisationId,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<Invoice>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM invoices
        WHERE organisation_id = $1
        ORDER BY year DESC, month DESC, created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(organisation_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(invoice_from_row).collect()
}

/// The non-cancelled invoice for a period, if one exists.
pub async fn find_for_period(
    store: &DurableStore,
    organisation_id: OrganisationId,
    month: u32,
    year: i32,
) -> StoreResult<Option<Invoice>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM invoices
        WHERE organisation_id = $1 AND month = $2 AND year = $3 AND status <> 'cancelled'
        "#,
    )
    .bind(organisation_id)
    .bind(month as i32)
    .bind(year)
    .fetch_optional(store.pool())
    .await?;
    row.as_ref().map(invoice_from_row).transpose()
}

/// Move an invoice between statuses, validating the transition against the
/// current row under lock.
pub async fn transition_status(
    tx: &mut DsTransaction<'_>,
    id: InvoiceId,
    to: InvoiceStatus,
    paid_at: Option<DateTime<Utc>>,
) -> StoreResult<Invoice> {
    let invoice = get_for_update(tx, id).await?;
    if invoice.status == to {
        return Ok(invoice);
    }
    if !invoice.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            entity: "invoice",
            from: invoice.status.to_string(),
            to: to.to_string(),
        });
    }
    sqlx::query(
        r#"
        UPDATE invoices
        SET status = $2,
            paid_at = COALESCE($3, paid_at),
            issued_at = CASE WHEN $2 = 'finalized' THEN COALESCE(issued_at, $4) ELSE issued_at END,
            updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(to.as_str())
    .bind(paid_at)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    get_for_update(tx, id).await
}

/// Sweep `sent` invoices past their due date into `overdue`; returns the
/// affected rows for the reminder job.
pub async fn sweep_overdue(
    store: &DurableStore,
    now: DateTime<Utc>,
) -> StoreResult<Vec<Invoice>> {
    let rows = sqlx::query(
        r#"
        UPDATE invoices
        SET status = 'overdue', updated_at = $1
        WHERE status = 'sent' AND due_date < $1
        RETURNING *
        "#,
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(invoice_from_row).collect()
}

/// Unpaid invoices that reminders should cover: sent or already overdue.
pub async fn list_unpaid_due(
    store: &DurableStore,
    now: DateTime<Utc>,
) -> StoreResult<Vec<Invoice>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM invoices
        WHERE status IN ('sent', 'overdue') AND due_date < $1
        ORDER BY due_date
        "#,
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(invoice_from_row).collect()
}

pub async fn set_pdf_url(
    store: &DurableStore,
    id: InvoiceId,
    pdf_url: &str,
) -> StoreResult<()> {
    sqlx::query("UPDATE invoices SET pdf_url = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(pdf_url)
        .bind(Utc::now())
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Next sequence number for invoice numbering within an organisation.
pub async fn count_for_org(
    store: &DurableStore,
    organisation_id: OrganisationId,
) -> StoreResult<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM invoices WHERE organisation_id = $1")
        .bind(organisation_id)
        .fetch_one(store.pool())
        .await?;
    Ok(row.try_get("n")?)
}
