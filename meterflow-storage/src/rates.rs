//! Exchange rate repository

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use meterflow_core::errors::StoreResult;
use meterflow_core::model::ExchangeRate;
use meterflow_core::money::Currency;

use crate::store::{parse_currency, DurableStore};

fn rate_from_row(row: &PgRow) -> StoreResult<ExchangeRate> {
    Ok(ExchangeRate {
        id: row.try_get("id")?,
        base_currency: parse_currency(row.try_get("base_currency")?)?,
        target_currency: parse_currency(row.try_get("target_currency")?)?,
        rate: row.try_get("rate")?,
        effective_from: row.try_get("effective_from")?,
        effective_to: row.try_get("effective_to")?,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
    })
}

/// The rate effective at `at` for the pair; when several sources overlap the
/// most recently effective row wins.
pub async fn find_effective(
    store: &DurableStore,
    base: Currency,
    target: Currency,
    at: DateTime<Utc>,
) -> StoreResult<Option<ExchangeRate>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM exchange_rates
        WHERE base_currency = $1
          AND target_currency = $2
          AND effective_from <= $3
          AND (effective_to IS NULL OR effective_to > $3)
        ORDER BY effective_from DESC
        LIMIT 1
        "#,
    )
    .bind(base.as_str())
    .bind(target.as_str())
    .bind(at)
    .fetch_optional(store.pool())
    .await?;
    row.as_ref().map(rate_from_row).transpose()
}

/// Insert a rate, closing the open window it supersedes for the same pair.
pub async fn upsert(store: &DurableStore, rate: &ExchangeRate) -> StoreResult<()> {
    let mut tx = store.begin().await?;
    sqlx::query(
        r#"
        UPDATE exchange_rates
        SET effective_to = $1
        WHERE base_currency = $2
          AND target_currency = $3
          AND effective_to IS NULL
          AND effective_from < $1
        "#,
    )
    .bind(rate.effective_from)
    .bind(rate.base_currency.as_str())
    .bind(rate.target_currency.as_str())
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO exchange_rates (
            id, base_currency, target_currency, rate,
            effective_from, effective_to, source, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(rate.id)
    .bind(rate.base_currency.as_str())
    .bind(rate.target_currency.as_str())
    .bind(rate.rate)
    .bind(rate.effective_from)
    .bind(rate.effective_to)
    .bind(&rate.source)
    .bind(rate.created_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn list(store: &DurableStore, base: Option<Currency>) -> StoreResult<Vec<ExchangeRate>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM exchange_rates
        WHERE ($1::varchar IS NULL OR base_currency = $1)
        ORDER BY base_currency, target_currency, effective_from DESC
        "#,
    )
    .bind(base.map(|c| c.as_str().to_string()))
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(rate_from_row).collect()
}
