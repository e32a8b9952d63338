//! Organisation, project and billing-config repository

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::Row;

use meterflow_core::errors::{StoreError, StoreResult};
use meterflow_core::model::{BillingConfig, Organisation, OrganisationId, Project, ProjectId};

use crate::store::{parse_currency, DurableStore};

fn organisation_from_row(row: &PgRow) -> StoreResult<Organisation> {
    Ok(Organisation {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        currency: parse_currency(row.try_get("currency")?)?,
        gateway_customer_id: row.try_get("gateway_customer_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn project_from_row(row: &PgRow) -> StoreResult<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation_id")?,
        name: row.try_get("name")?,
        api_key_hash: row.try_get("api_key_hash")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn billing_config_from_row(row: &PgRow) -> StoreResult<BillingConfig> {
    Ok(BillingConfig {
        organisation_id: row.try_get("organisation_id")?,
        tax_rate: row.try_get("tax_rate")?,
        currency: parse_currency(row.try_get("currency")?)?,
        payment_terms_days: row.try_get("payment_terms_days")?,
        minimum_charge_enabled: row.try_get("minimum_charge_enabled")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert_organisation(
    store: &DurableStore,
    organisation: &Organisation,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO organisations (id, name, currency, gateway_customer_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(organisation.id)
    .bind(&organisation.name)
    .bind(organisation.currency.as_str())
    .bind(&organisation.gateway_customer_id)
    .bind(organisation.created_at)
    .bind(organisation.updated_at)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn get_organisation(
    store: &DurableStore,
    id: OrganisationId,
) -> StoreResult<Organisation> {
    let row = sqlx::query("SELECT * FROM organisations WHERE id = $1")
        .bind(id)
        .fetch_optional(store.pool())
        .await?;
    match row {
        Some(row) => organisation_from_row(&row),
        None => Err(StoreError::NotFound {
            entity: "organisation",
            id: id.to_string(),
        }),
    }
}

pub async fn list_organisations(
    store: &DurableStore,
    include_deleted: bool,
) -> StoreResult<Vec<Organisation>> {
    let rows = sqlx::query(
        "SELECT * FROM organisations WHERE ($1 OR deleted_at IS NULL) ORDER BY created_at",
    )
    .bind(include_deleted)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(organisation_from_row).collect()
}

pub async fn update_organisation(
    store: &DurableStore,
    organisation: &Organisation,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE organisations
        SET name = $2, currency = $3, gateway_customer_id = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(organisation.id)
    .bind(&organisation.name)
    .bind(organisation.currency.as_str())
    .bind(&organisation.gateway_customer_id)
    .bind(Utc::now())
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Soft delete; history is preserved and events keep their foreign keys.
pub async fn soft_delete_organisation(
    store: &DurableStore,
    id: OrganisationId,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE organisations SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(Utc::now())
    .execute(store.pool())
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "organisation",
            id: id.to_string(),
        });
    }
    Ok(())
}

pub async fn insert_project(store: &DurableStore, project: &Project) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO projects (id, organisation_id, name, api_key_hash, is_active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(project.id)
    .bind(project.organisation_id)
    .bind(&project.name)
    .bind(&project.api_key_hash)
    .bind(project.is_active)
    .bind(project.created_at)
    .bind(project.updated_at)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn get_project(store: &DurableStore, id: ProjectId) -> StoreResult<Project> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(store.pool())
        .await?;
    match row {
        Some(row) => project_from_row(&row),
        None => Err(StoreError::NotFound {
            entity: "project",
            id: id.to_string(),
        }),
    }
}

pub async fn list_projects(
    store: &DurableStore,
    organisation_id: OrganisationId,
) -> StoreResult<Vec<Project>> {
    let rows = sqlx::query(
        "SELECT * FROM projects WHERE organisation_id = $1 ORDER BY created_at",
    )
    .bind(organisation_id)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(project_from_row).collect()
}

/// The ingest authentication lookup: only hashes are compared, the plaintext
/// key never reaches the store.
pub async fn find_project_by_api_key_hash(
    store: &DurableStore,
    api_key_hash: &str,
) -> StoreResult<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE api_key_hash = $1 AND is_active = TRUE")
        .bind(api_key_hash)
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(project_from_row).transpose()
}

/// Swap in a new key hash; the old key stops authenticating immediately.
pub async fn rotate_project_key(
    store: &DurableStore,
    id: ProjectId,
    new_api_key_hash: &str,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE projects SET api_key_hash = $2, updated_at = $3 WHERE id = $1",
    )
    .bind(id)
    .bind(new_api_key_hash)
    .bind(Utc::now())
    .execute(store.pool())
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "project",
            id: id.to_string(),
        });
    }
    Ok(())
}

pub async fn set_project_active(
    store: &DurableStore,
    id: ProjectId,
    is_active: bool,
) -> StoreResult<()> {
    sqlx::query("UPDATE projects SET is_active = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(is_active)
        .bind(Utc::now())
        .execute(store.pool())
        .await?;
    Ok(())
}

pub async fn upsert_billing_config(
    store: &DurableStore,
    config: &BillingConfig,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_configs (
            organisation_id, tax_rate, currency, payment_terms_days,
            minimum_charge_enabled, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (organisation_id) DO UPDATE SET
            tax_rate = EXCLUDED.tax_rate,
            currency = EXCLUDED.currency,
            payment_terms_days = EXCLUDED.payment_terms_days,
            minimum_charge_enabled = EXCLUDED.minimum_charge_enabled,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(config.organisation_id)
    .bind(config.tax_rate)
    .bind(config.currency.as_str())
    .bind(config.payment_terms_days)
    .bind(config.minimum_charge_enabled)
    .bind(Utc::now())
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn get_billing_config(
    store: &DurableStore,
    organisation_id: OrganisationId,
) -> StoreResult<Option<BillingConfig>> {
    let row = sqlx::query("SELECT * FROM billing_configs WHERE organisation_id = $1")
        .bind(organisation_id)
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(billing_config_from_row).transpose()
}

/// Short stable code derived from the organisation id, used in invoice and
/// refund numbers.
pub fn short_org_code(id: OrganisationId) -> String {
    let simple = id.simple().to_string();
    simple[..8].to_uppercase()
}
