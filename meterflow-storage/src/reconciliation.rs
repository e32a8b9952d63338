//! Reconciliation run repository

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meterflow_core::errors::StoreResult;
use meterflow_core::model::{ReconciliationRun, ReconciliationScope};

use crate::store::{parse_enum, DurableStore};

fn run_from_row(row: &PgRow) -> StoreResult<ReconciliationRun> {
    Ok(ReconciliationRun {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        scope: parse_enum(row.try_get("scope")?)?,
        left_count: row.try_get("left_count")?,
        right_count: row.try_get("right_count")?,
        discrepancy_count: row.try_get("discrepancy_count")?,
        details: row.try_get("details")?,
        status: row.try_get("status")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

pub async fn insert(store: &DurableStore, run: &ReconciliationRun) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO reconciliation_runs (
            id, run_id, scope, left_count, right_count,
            discrepancy_count, details, status, started_at, finished_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(run.id)
    .bind(run.run_id)
    .bind(run.scope.as_str())
    .bind(run.left_count)
    .bind(run.right_count)
    .bind(run.discrepancy_count)
    .bind(&run.details)
    .bind(&run.status)
    .bind(run.started_at)
    .bind(run.finished_at)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn list_recent(
    store: &DurableStore,
    scope: Option<ReconciliationScope>,
    limit: i64,
) -> StoreResult<Vec<ReconciliationRun>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM reconciliation_runs
        WHERE ($1::varchar IS NULL OR scope = $1)
        ORDER BY finished_at DESC
        LIMIT $2
        "#,
    )
    .bind(scope.map(|s| s.as_str().to_string()))
    .bind(limit)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(run_from_row).collect()
}

pub fn new_run_id() -> Uuid {
    Uuid::new_v4()
}
