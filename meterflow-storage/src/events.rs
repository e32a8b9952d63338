//! Durable usage event repository
//!
//! Durable events are insert-only; the unique index on `idempotency_key`
//! makes replays from the hot store no-ops. Read paths serve alerts,
//! reconciliation and the admin trend queries.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;

use meterflow_core::errors::StoreResult;
use meterflow_core::model::{OrganisationId, ProjectId, UsageEvent, UsageTrendPoint};

use crate::store::{DsTransaction, DurableStore};

fn event_from_row(row: &PgRow) -> StoreResult<UsageEvent> {
    Ok(UsageEvent {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        project_id: row.try_get("project_id")?,
        metric_name: row.try_get("metric_name")?,
        metric_value: row.try_get("metric_value")?,
        unit: row.try_get("unit")?,
        timestamp: row.try_get("event_timestamp")?,
        metadata: row.try_get("metadata")?,
        idempotency_key: row.try_get("idempotency_key")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

/// Insert one event, ignoring idempotency-key collisions. Returns whether a
/// new row was written; `false` means the key was already present, which is
/// equally safe to mark processed in the hot store.
pub async fn insert_ignore_duplicate(
    tx: &mut DsTransaction<'_>,
    event: &UsageEvent,
) -> StoreResult<bool> {
    let row = sqlx::query(
        r#"
        INSERT INTO usage_events (
            id, organisation_id, project_id, metric_name, metric_value,
            unit, event_timestamp, metadata, idempotency_key, ingested_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(event.id)
    .bind(event.organisation_id)
    .bind(event.project_id)
    .bind(&event.metric_name)
    .bind(event.metric_value)
    .bind(&event.unit)
    .bind(event.timestamp)
    .bind(&event.metadata)
    .bind(&event.idempotency_key)
    .bind(event.ingested_at)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.is_some())
}

pub async fn find_by_key(
    store: &DurableStore,
    idempotency_key: &str,
) -> StoreResult<Option<UsageEvent>> {
    let row = sqlx::query("SELECT * FROM usage_events WHERE idempotency_key = $1")
        .bind(idempotency_key)
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(event_from_row).transpose()
}

pub async fn count_with_key(store: &DurableStore, idempotency_key: &str) -> StoreResult<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM usage_events WHERE idempotency_key = $1")
        .bind(idempotency_key)
        .fetch_one(store.pool())
        .await?;
    Ok(row.try_get("n")?)
}

/// One row per `(organisation, project, metric, unit, day)` with its event
/// count; the durable side of hot-vs-durable reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DailyCountKey {
    pub organisation_id: OrganisationId,
    pub project_id: ProjectId,
    pub metric_name: String,
    pub unit: String,
    pub day: NaiveDate,
}

pub async fn daily_counts_since(
    store: &DurableStore,
    since: DateTime<Utc>,
) -> StoreResult<Vec<(DailyCountKey, i64)>> {
    let rows = sqlx::query(
        r#"
        SELECT organisation_id, project_id, metric_name, unit,
               DATE(event_timestamp AT TIME ZONE 'UTC') AS day,
               COUNT(*) AS n
        FROM usage_events
        WHERE ingested_at >= $1
        GROUP BY organisation_id, project_id, metric_name, unit, day
        "#,
    )
    .bind(since)
    .fetch_all(store.pool())
    .await?;

    let mut counts = Vec::with_capacity(rows.len());
    for row in rows {
        counts.push((
            DailyCountKey {
                organisation_id: row.try_get("organisation_id")?,
                project_id: row.try_get("project_id")?,
                metric_name: row.try_get("metric_name")?,
                unit: row.try_get("unit")?,
                day: row.try_get("day")?,
            },
            row.try_get("n")?,
        ));
    }
    Ok(counts)
}

/// Total usage of a metric over a window, optionally scoped to one
/// organisation. Serves the alert evaluator's period comparisons.
pub async fn sum_for_window(
    store: &DurableStore,
    organisation_id: Option<OrganisationId>,
    metric_name: &str,
    unit: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> StoreResult<(Decimal, i64)> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(metric_value), 0) AS total, COUNT(*) AS n
        FROM usage_events
        WHERE metric_name = $1
          AND unit = $2
          AND event_timestamp >= $3
          AND event_timestamp < $4
          AND ($5::uuid IS NULL OR organisation_id = $5)
        "#,
    )
    .bind(metric_name)
    .bind(unit)
    .bind(from)
    .bind(to)
    .bind(organisation_id)
    .fetch_one(store.pool())
    .await?;
    Ok((row.try_get("total")?, row.try_get("n")?))
}

/// Recompute an aggregate's totals straight from the durable events; the
/// reconciliation rebuild path.
pub async fn recompute_aggregate_totals(
    store: &DurableStore,
    organisation_id: OrganisationId,
    project_id: ProjectId,
    metric_name: &str,
    unit: &str,
    month: u32,
    year: i32,
) -> StoreResult<(Decimal, i64)> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(metric_value), 0) AS total, COUNT(*) AS n
        FROM usage_events
        WHERE organisation_id = $1
          AND project_id = $2
          AND metric_name = $3
          AND unit = $4
          AND EXTRACT(MONTH FROM event_timestamp AT TIME ZONE 'UTC') = $5
          AND EXTRACT(YEAR FROM event_timestamp AT TIME ZONE 'UTC') = $6
        "#,
    )
    .bind(organisation_id)
    .bind(project_id)
    .bind(metric_name)
    .bind(unit)
    .bind(month as i32)
    .bind(year)
    .fetch_one(store.pool())
    .await?;
    Ok((row.try_get("total")?, row.try_get("n")?))
}

/// Daily usage points for the admin trend endpoint.
pub async fn usage_trend(
    store: &DurableStore,
    organisation_id: OrganisationId,
    metric_name: &str,
    unit: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> StoreResult<Vec<UsageTrendPoint>> {
    let rows = sqlx::query(
        r#"
        SELECT date_trunc('day', event_timestamp AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS day,
               COALESCE(SUM(metric_value), 0) AS total,
               COUNT(*) AS n
        FROM usage_events
        WHERE organisation_id = $1
          AND metric_name = $2
          AND unit = $3
          AND event_timestamp >= $4
          AND event_timestamp < $5
        GROUP BY day
        ORDER BY day
        "#,
    )
    .bind(organisation_id)
    .bind(metric_name)
    .bind(unit)
    .bind(from)
    .bind(to)
    .fetch_all(store.pool())
    .await?;

    let mut points = Vec::with_capacity(rows.len());
    for row in rows {
        points.push(UsageTrendPoint {
            day: row.try_get("day")?,
            total_value: row.try_get("total")?,
            event_count: row.try_get("n")?,
        });
    }
    Ok(points)
}
