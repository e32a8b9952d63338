//! Email notification record repository
//!
//! Every email handed to the capability transport leaves a row here so the
//! admin listing endpoint can show delivery history regardless of provider.

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meterflow_core::errors::StoreResult;
use meterflow_core::model::{EmailNotification, OrganisationId};

use crate::store::DurableStore;

fn notification_from_row(row: &PgRow) -> StoreResult<EmailNotification> {
    Ok(EmailNotification {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        recipient: row.try_get("recipient")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        kind: row.try_get("kind")?,
        status: row.try_get("status")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert(store: &DurableStore, notification: &EmailNotification) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO email_notifications (
            id, organisation_id, recipient, subject, body, kind, status, error, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(notification.id)
    .bind(notification.organisation_id)
    .bind(&notification.recipient)
    .bind(&notification.subject)
    .bind(&notification.body)
    .bind(&notification.kind)
    .bind(&notification.status)
    .bind(&notification.error)
    .bind(notification.created_at)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn set_status(
    store: &DurableStore,
    id: Uuid,
    status: &str,
    error: Option<&str>,
) -> StoreResult<()> {
    sqlx::query("UPDATE email_notifications SET status = $2, error = $3 WHERE id = $1")
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(store.pool())
        .await?;
    Ok(())
}

pub async fn list(
    store: &DurableStore,
    organisation_id: Option<OrganisationId>,
    limit: i64,
) -> StoreResult<Vec<EmailNotification>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM email_notifications
        WHERE ($1::uuid IS NULL OR organisation_id = $1)
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(organisation_id)
    .bind(limit)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(notification_from_row).collect()
}

/// Record-and-mark helper used by services that send immediately.
pub async fn record_delivery(
    store: &DurableStore,
    organisation_id: Option<OrganisationId>,
    recipient: &str,
    subject: &str,
    body: &str,
    kind: &str,
    delivered: bool,
    error: Option<&str>,
) -> StoreResult<Uuid> {
    let id = Uuid::new_v4();
    let notification = EmailNotification {
        id,
        organisation_id,
        recipient: recipient.to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
        kind: kind.to_string(),
        status: if delivered { "sent" } else { "failed" }.to_string(),
        error: error.map(str::to_string),
        created_at: Utc::now(),
    };
    insert(store, &notification).await?;
    Ok(id)
}
