//! Alert rule and history repository

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use meterflow_core::errors::{StoreError, StoreResult};
use meterflow_core::model::{AlertEvent, AlertRule, AlertStatus};

use crate::store::{parse_enum, DurableStore};

fn rule_from_row(row: &PgRow) -> StoreResult<AlertRule> {
    let channels: serde_json::Value = row.try_get("channels")?;
    let channels: Vec<String> =
        serde_json::from_value(channels).map_err(|e| StoreError::Decode(e.to_string()))?;
    let operator: Option<&str> = row.try_get("operator")?;
    let reference_period: Option<&str> = row.try_get("reference_period")?;
    Ok(AlertRule {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        name: row.try_get("name")?,
        rule_type: parse_enum(row.try_get("rule_type")?)?,
        metric_name: row.try_get("metric_name")?,
        unit: row.try_get("unit")?,
        threshold: row.try_get("threshold")?,
        operator: operator.map(parse_enum).transpose()?,
        comparison_period: parse_enum(row.try_get("comparison_period")?)?,
        spike_percent: row.try_get("spike_percent")?,
        reference_period: reference_period.map(parse_enum).transpose()?,
        is_active: row.try_get("is_active")?,
        channels,
        cooldown_minutes: row.try_get("cooldown_minutes")?,
        last_alert_at: row.try_get("last_alert_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<AlertEvent> {
    Ok(AlertEvent {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        organisation_id: row.try_get("organisation_id")?,
        status: parse_enum(row.try_get("status")?)?,
        actual_value: row.try_get("actual_value")?,
        threshold_value: row.try_get("threshold_value")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        message: row.try_get("message")?,
        triggered_at: row.try_get("triggered_at")?,
    })
}

pub async fn insert_rule(store: &DurableStore, rule: &AlertRule) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO alert_rules (
            id, organisation_id, name, rule_type, metric_name, unit,
            threshold, operator, comparison_period, spike_percent,
            reference_period, is_active, channels, cooldown_minutes,
            last_alert_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(rule.id)
    .bind(rule.organisation_id)
    .bind(&rule.name)
    .bind(rule.rule_type.as_str())
    .bind(&rule.metric_name)
    .bind(&rule.unit)
    .bind(rule.threshold)
    .bind(rule.operator.map(|o| o.as_str()))
    .bind(rule.comparison_period.as_str())
    .bind(rule.spike_percent)
    .bind(rule.reference_period.map(|p| p.as_str()))
    .bind(rule.is_active)
    .bind(serde_json::to_value(&rule.channels).map_err(StoreError::Encoding)?)
    .bind(rule.cooldown_minutes)
    .bind(rule.last_alert_at)
    .bind(rule.created_at)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn update_rule(store: &DurableStore, rule: &AlertRule) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE alert_rules
        SET name = $2, metric_name = $3, unit = $4, threshold = $5,
            operator = $6, comparison_period = $7, spike_percent = $8,
            reference_period = $9, is_active = $10, channels = $11,
            cooldown_minutes = $12
        WHERE id = $1
        "#,
    )
    .bind(rule.id)
    .bind(&rule.name)
    .bind(&rule.metric_name)
    .bind(&rule.unit)
    .bind(rule.threshold)
    .bind(rule.operator.map(|o| o.as_str()))
    .bind(rule.comparison_period.as_str())
    .bind(rule.spike_percent)
    .bind(rule.reference_period.map(|p| p.as_str()))
    .bind(rule.is_active)
    .bind(serde_json::to_value(&rule.channels).map_err(StoreError::Encoding)?)
    .bind(rule.cooldown_minutes)
    .execute(store.pool())
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "alert rule",
            id: rule.id.to_string(),
        });
    }
    Ok(())
}

pub async fn get_rule(store: &DurableStore, id: Uuid) -> StoreResult<AlertRule> {
    let row = sqlx::query("SELECT * FROM alert_rules WHERE id = $1")
        .bind(id)
        .fetch_optional(store.pool())
        .await?;
    match row {
        Some(row) => rule_from_row(&row),
        None => Err(StoreError::NotFound {
            entity: "alert rule",
            id: id.to_string(),
        }),
    }
}

pub async fn list_rules(store: &DurableStore, active_only: bool) -> StoreResult<Vec<AlertRule>> {
    let rows = sqlx::query(
        "SELECT * FROM alert_rules WHERE ($1 = FALSE OR is_active) ORDER BY created_at",
    )
    .bind(active_only)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(rule_from_row).collect()
}

pub async fn delete_rule(store: &DurableStore, id: Uuid) -> StoreResult<()> {
    let result = sqlx::query("DELETE FROM alert_rules WHERE id = $1")
        .bind(id)
        .execute(store.pool())
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "alert rule",
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Stamp the cooldown clock. Only moves forward so replayed evaluations
/// cannot shrink the window.
pub async fn touch_last_alert(
    store: &DurableStore,
    rule_id: Uuid,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE alert_rules
        SET last_alert_at = GREATEST(COALESCE(last_alert_at, $2), $2)
        WHERE id = $1
        "#,
    )
    .bind(rule_id)
    .bind(at)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn insert_event(store: &DurableStore, event: &AlertEvent) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO alert_history (
            id, rule_id, organisation_id, status, actual_value,
            threshold_value, period_start, period_end, message, triggered_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(event.id)
    .bind(event.rule_id)
    .bind(event.organisation_id)
    .bind(event.status.as_str())
    .bind(event.actual_value)
    .bind(event.threshold_value)
    .bind(event.period_start)
    .bind(event.period_end)
    .bind(&event.message)
    .bind(event.triggered_at)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn update_event_status(
    store: &DurableStore,
    event_id: Uuid,
    status: AlertStatus,
) -> StoreResult<()> {
    sqlx::query("UPDATE alert_history SET status = $2 WHERE id = $1")
        .bind(event_id)
        .bind(status.as_str())
        .execute(store.pool())
        .await?;
    Ok(())
}

pub async fn list_history(
    store: &DurableStore,
    rule_id: Option<Uuid>,
    limit: i64,
) -> StoreResult<Vec<AlertEvent>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM alert_history
        WHERE ($1::uuid IS NULL OR rule_id = $1)
        ORDER BY triggered_at DESC
        LIMIT $2
        "#,
    )
    .bind(rule_id)
    .bind(limit)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(event_from_row).collect()
}
