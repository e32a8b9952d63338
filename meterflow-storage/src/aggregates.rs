//! Usage aggregate repository
//!
//! Monthly rollups per `(organisation, project, metric, unit)`. Deltas are
//! applied inside the migration transaction so an aggregate never counts an
//! event the durable store does not hold; reconciliation overwrites totals
//! when drift is detected.

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meterflow_core::errors::StoreResult;
use meterflow_core::model::{OrganisationId, UsageAggregate, UsageEvent, UsageSummaryRow};

use crate::store::{DsTransaction, DurableStore};

fn aggregate_from_row(row: &PgRow) -> StoreResult<UsageAggregate> {
    Ok(UsageAggregate {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        project_id: row.try_get("project_id")?,
        metric_name: row.try_get("metric_name")?,
        unit: row.try_get("unit")?,
        month: row.try_get::<i32, _>("month")? as u32,
        year: row.try_get("year")?,
        total_value: row.try_get("total_value")?,
        event_count: row.try_get("event_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Fold one newly inserted durable event into its monthly aggregate.
/// Commutative, so migration batches may apply events in any order.
pub async fn apply_event_delta(
    tx: &mut DsTransaction<'_>,
    event: &UsageEvent,
) -> StoreResult<()> {
    let month = event.timestamp.month() as i32;
    let year = event.timestamp.year();
    sqlx::query(
        r#"
        INSERT INTO usage_aggregates (
            id, organisation_id, project_id, metric_name, unit,
            month, year, total_value, event_count, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9)
        ON CONFLICT (organisation_id, project_id, metric_name, unit, month, year)
        DO UPDATE SET
            total_value = usage_aggregates.total_value + EXCLUDED.total_value,
            event_count = usage_aggregates.event_count + 1,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(event.organisation_id)
    .bind(event.project_id)
    .bind(&event.metric_name)
    .bind(&event.unit)
    .bind(month)
    .bind(year)
    .bind(event.metric_value)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_for_org_period(
    store: &DurableStore,
    organisation_id: OrganisationId,
    month: u32,
    year: i32,
) -> StoreResult<Vec<UsageAggregate>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM usage_aggregates
        WHERE organisation_id = $1 AND month = $2 AND year = $3
        ORDER BY project_id, metric_name, unit
        "#,
    )
    .bind(organisation_id)
    .bind(month as i32)
    .bind(year)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(aggregate_from_row).collect()
}

pub async fn list_for_period(
    store: &DurableStore,
    month: u32,
    year: i32,
) -> StoreResult<Vec<UsageAggregate>> {
    let rows = sqlx::query(
        "SELECT * FROM usage_aggregates WHERE month = $1 AND year = $2 ORDER BY organisation_id",
    )
    .bind(month as i32)
    .bind(year)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(aggregate_from_row).collect()
}

/// Organisations that produced usage in a period; the invoice generator's
/// work list.
pub async fn organisations_with_usage(
    store: &DurableStore,
    month: u32,
    year: i32,
) -> StoreResult<Vec<OrganisationId>> {
    let rows = sqlx::query(
        "SELECT DISTINCT organisation_id FROM usage_aggregates WHERE month = $1 AND year = $2",
    )
    .bind(month as i32)
    .bind(year)
    .fetch_all(store.pool())
    .await?;
    rows.iter()
        .map(|row| Ok(row.try_get("organisation_id")?))
        .collect()
}

/// Overwrite an aggregate's totals; the reconciliation repair path.
pub async fn overwrite_totals(
    store: &DurableStore,
    aggregate_id: Uuid,
    total_value: Decimal,
    event_count: i64,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE usage_aggregates
        SET total_value = $2, event_count = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(aggregate_id)
    .bind(total_value)
    .bind(event_count)
    .bind(Utc::now())
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Per-metric rollup for the admin usage summary endpoint.
pub async fn usage_summary(
    store: &DurableStore,
    organisation_id: OrganisationId,
    month: u32,
    year: i32,
) -> StoreResult<Vec<UsageSummaryRow>> {
    let rows = sqlx::query(
        r#"
        SELECT project_id, metric_name, unit, total_value, event_count
        FROM usage_aggregates
        WHERE organisation_id = $1 AND month = $2 AND year = $3
        ORDER BY metric_name, unit, project_id
        "#,
    )
    .bind(organisation_id)
    .bind(month as i32)
    .bind(year)
    .fetch_all(store.pool())
    .await?;

    let mut summary = Vec::with_capacity(rows.len());
    for row in rows {
        summary.push(UsageSummaryRow {
            project_id: row.try_get("project_id")?,
            metric_name: row.try_get("metric_name")?,
            unit: row.try_get("unit")?,
            total_value: row.try_get("total_value")?,
            event_count: row.try_get("event_count")?,
        });
    }
    Ok(summary)
}
