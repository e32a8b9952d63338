//! Append-only audit log repository

use sqlx::postgres::PgRow;
use sqlx::Row;

use meterflow_core::errors::StoreResult;
use meterflow_core::model::AuditLogEntry;

use crate::store::{DsTransaction, DurableStore};

fn entry_from_row(row: &PgRow) -> StoreResult<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: row.try_get("id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        action: row.try_get("action")?,
        actor: row.try_get("actor")?,
        before: row.try_get("before")?,
        after: row.try_get("after")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Append inside the caller's transaction so the audit row commits with the
/// state change it records.
pub async fn append(tx: &mut DsTransaction<'_>, entry: &AuditLogEntry) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_logs (
            id, entity_type, entity_id, action, actor,
            before, after, ip_address, user_agent, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(entry.id)
    .bind(&entry.entity_type)
    .bind(&entry.entity_id)
    .bind(&entry.action)
    .bind(&entry.actor)
    .bind(&entry.before)
    .bind(&entry.after)
    .bind(&entry.ip_address)
    .bind(&entry.user_agent)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Standalone append for admin mutations that do not run in a wider
/// transaction.
pub async fn append_standalone(
    store: &DurableStore,
    entry: &AuditLogEntry,
) -> StoreResult<()> {
    let mut tx = store.begin().await?;
    append(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn list_for_entity(
    store: &DurableStore,
    entity_type: &str,
    entity_id: &str,
    limit: i64,
) -> StoreResult<Vec<AuditLogEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM audit_logs
        WHERE entity_type = $1 AND entity_id = $2
        ORDER BY created_at DESC
        LIMIT $3
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(limit)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(entry_from_row).collect()
}
