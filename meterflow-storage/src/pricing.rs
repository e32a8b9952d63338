//! Pricing and minimum-charge rule repository
//!
//! Rules are effective-dated over `[from, to)`; the calculator resolves
//! precedence (organisation-specific over global, then latest
//! `effective_from`) from the candidate set these queries return.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meterflow_core::errors::{StoreError, StoreResult};
use meterflow_core::model::{MinimumChargeRule, OrganisationId, PricingRule};

use crate::store::{parse_currency, DurableStore};

fn pricing_rule_from_row(row: &PgRow) -> StoreResult<PricingRule> {
    Ok(PricingRule {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        metric_name: row.try_get("metric_name")?,
        unit: row.try_get("unit")?,
        price_per_unit: row.try_get("price_per_unit")?,
        currency: parse_currency(row.try_get("currency")?)?,
        effective_from: row.try_get("effective_from")?,
        effective_to: row.try_get("effective_to")?,
        created_at: row.try_get("created_at")?,
    })
}

fn minimum_rule_from_row(row: &PgRow) -> StoreResult<MinimumChargeRule> {
    Ok(MinimumChargeRule {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        minimum_amount: row.try_get("minimum_amount")?,
        currency: parse_currency(row.try_get("currency")?)?,
        effective_from: row.try_get("effective_from")?,
        effective_to: row.try_get("effective_to")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert a pricing rule, closing the window of the rule it supersedes for
/// the same `(organisation, metric, unit)` scope.
pub async fn insert_pricing_rule(
    store: &DurableStore,
    rule: &PricingRule,
) -> StoreResult<()> {
    let mut tx = store.begin().await?;
    sqlx::query(
        r#"
        UPDATE pricing_rules
        SET effective_to = $1
        WHERE metric_name = $2
          AND unit = $3
          AND organisation_id IS NOT DISTINCT FROM $4
          AND effective_to IS NULL
          AND effective_from < $1
        "#,
    )
    .bind(rule.effective_from)
    .bind(&rule.metric_name)
    .bind(&rule.unit)
    .bind(rule.organisation_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO pricing_rules (
            id, organisation_id, metric_name, unit, price_per_unit,
            currency, effective_from, effective_to, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(rule.id)
    .bind(rule.organisation_id)
    .bind(&rule.metric_name)
    .bind(&rule.unit)
    .bind(rule.price_per_unit)
    .bind(rule.currency.as_str())
    .bind(rule.effective_from)
    .bind(rule.effective_to)
    .bind(rule.created_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Pricing rules effective at `at` for the organisation: its own rules plus
/// the global ones. The calculator picks the winner per metric.
pub async fn effective_pricing_rules(
    store: &DurableStore,
    organisation_id: OrganisationId,
    at: DateTime<Utc>,
) -> StoreResult<Vec<PricingRule>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM pricing_rules
        WHERE (organisation_id = $1 OR organisation_id IS NULL)
          AND effective_from <= $2
          AND (effective_to IS NULL OR effective_to > $2)
        ORDER BY metric_name, unit, effective_from DESC
        "#,
    )
    .bind(organisation_id)
    .bind(at)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(pricing_rule_from_row).collect()
}

pub async fn list_pricing_rules(
    store: &DurableStore,
    organisation_id: Option<OrganisationId>,
) -> StoreResult<Vec<PricingRule>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM pricing_rules
        WHERE ($1::uuid IS NULL OR organisation_id = $1 OR organisation_id IS NULL)
        ORDER BY metric_name, unit, effective_from DESC
        "#,
    )
    .bind(organisation_id)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(pricing_rule_from_row).collect()
}

pub async fn delete_pricing_rule(store: &DurableStore, id: Uuid) -> StoreResult<()> {
    let result = sqlx::query("DELETE FROM pricing_rules WHERE id = $1")
        .bind(id)
        .execute(store.pool())
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "pricing rule",
            id: id.to_string(),
        });
    }
    Ok(())
}

pub async fn insert_minimum_rule(
    store: &DurableStore,
    rule: &MinimumChargeRule,
) -> StoreResult<()> {
    let mut tx = store.begin().await?;
    sqlx::query(
        r#"
        UPDATE minimum_charge_rules
        SET effective_to = $1
        WHERE organisation_id IS NOT DISTINCT FROM $2
          AND effective_to IS NULL
          AND effective_from < $1
        "#,
    )
    .bind(rule.effective_from)
    .bind(rule.organisation_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO minimum_charge_rules (
            id, organisation_id, minimum_amount, currency,
            effective_from, effective_to, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(rule.id)
    .bind(rule.organisation_id)
    .bind(rule.minimum_amount)
    .bind(rule.currency.as_str())
    .bind(rule.effective_from)
    .bind(rule.effective_to)
    .bind(rule.created_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn effective_minimum_rules(
    store: &DurableStore,
    organisation_id: OrganisationId,
    at: DateTime<Utc>,
) -> StoreResult<Vec<MinimumChargeRule>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM minimum_charge_rules
        WHERE (organisation_id = $1 OR organisation_id IS NULL)
          AND effective_from <= $2
          AND (effective_to IS NULL OR effective_to > $2)
        ORDER BY effective_from DESC
        "#,
    )
    .bind(organisation_id)
    .bind(at)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(minimum_rule_from_row).collect()
}
