//! Idempotency registry
//!
//! Persists `(idempotency_key -> entity_type, entity_id)` and wraps
//! operations so retries observe the first result. Serialisation per key is a
//! transaction-scoped advisory lock on the key's hash; the unique constraint
//! on `idempotency_keys` is the backstop for two concurrent first-writers.
//! Duplicate-vs-created is a sum type, never an error used for control flow.

use futures::future::BoxFuture;
use sqlx::Row;

use meterflow_core::errors::{StoreError, StoreResult};

use crate::store::{is_unique_violation, DsTransaction, DurableStore};

/// Outcome of reserving a key inside a caller-owned transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reserved {
    /// The key is new; the caller holds the per-key lock until commit
    Created,
    /// A prior writer completed with this entity
    Existing { entity_id: String },
}

/// Outcome of a wrapped operation
#[derive(Debug)]
pub enum IdempotencyOutcome<T> {
    /// The operation ran and committed
    Created(T),
    /// A prior run owns the key; its entity id is returned unchanged
    Existing { entity_id: String },
}

impl<T> IdempotencyOutcome<T> {
    /// Treat a replay as a conflict error carrying the winner's id.
    pub fn into_created(self, entity_type: &str) -> StoreResult<T> {
        match self {
            IdempotencyOutcome::Created(value) => Ok(value),
            IdempotencyOutcome::Existing { entity_id } => Err(StoreError::IdempotencyConflict {
                entity_type: entity_type.to_string(),
                existing_id: entity_id,
            }),
        }
    }
}

/// Take the transaction-scoped lock that serialises writers of this key.
pub async fn lock_key(tx: &mut DsTransaction<'_>, key: &str) -> StoreResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Look up a completed key inside a transaction.
pub async fn find(
    tx: &mut DsTransaction<'_>,
    key: &str,
) -> StoreResult<Option<(String, String)>> {
    let row = sqlx::query(
        "SELECT entity_type, entity_id FROM idempotency_keys WHERE idempotency_key = $1",
    )
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;
    match row {
        Some(row) => Ok(Some((row.try_get("entity_type")?, row.try_get("entity_id")?))),
        None => Ok(None),
    }
}

/// Lock the key and report whether a prior writer completed it.
pub async fn reserve(tx: &mut DsTransaction<'_>, key: &str) -> StoreResult<Reserved> {
    lock_key(tx, key).await?;
    match find(tx, key).await? {
        Some((_, entity_id)) => Ok(Reserved::Existing { entity_id }),
        None => Ok(Reserved::Created),
    }
}

/// Record the key alongside the entity it produced. Idempotent: replays
/// leave the first mapping in place.
pub async fn complete(
    tx: &mut DsTransaction<'_>,
    key: &str,
    entity_type: &str,
    entity_id: &str,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO idempotency_keys (idempotency_key, entity_type, entity_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (idempotency_key) DO NOTHING
        "#,
    )
    .bind(key)
    .bind(entity_type)
    .bind(entity_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Run `f` inside a transaction that first takes the per-key lock. If the key
/// is already completed, returns the prior entity id without running `f`;
/// otherwise runs `f`, records the key next to the entity it produced, and
/// commits. `f` returns the value plus the entity id to record.
pub async fn with_idempotency<T, F>(
    store: &DurableStore,
    key: &str,
    entity_type: &str,
    f: F,
) -> StoreResult<IdempotencyOutcome<T>>
where
    F: for<'t> FnOnce(&'t mut DsTransaction<'static>) -> BoxFuture<'t, StoreResult<(T, String)>>,
{
    let mut tx = store.begin().await?;
    lock_key(&mut tx, key).await?;
    if let Some((_, entity_id)) = find(&mut tx, key).await? {
        tx.rollback().await?;
        return Ok(IdempotencyOutcome::Existing { entity_id });
    }

    let (value, entity_id) = match f(&mut tx).await {
        Ok(produced) => produced,
        Err(e) => {
            let _ = tx.rollback().await;
            return Err(e);
        }
    };

    if let Err(e) = complete(&mut tx, key, entity_type, &entity_id).await {
        let _ = tx.rollback().await;
        if let StoreError::Database(db_err) = &e {
            if is_unique_violation(db_err) {
                // Constraint backstop: a racing writer won between our lock
                // release and theirs; surface its entity id
                if let Some((_, existing)) = find_committed(store, key).await? {
                    return Ok(IdempotencyOutcome::Existing { entity_id: existing });
                }
            }
        }
        return Err(e);
    }

    tx.commit().await?;
    Ok(IdempotencyOutcome::Created(value))
}

async fn find_committed(
    store: &DurableStore,
    key: &str,
) -> StoreResult<Option<(String, String)>> {
    let row = sqlx::query(
        "SELECT entity_type, entity_id FROM idempotency_keys WHERE idempotency_key = $1",
    )
    .bind(key)
    .fetch_optional(store.pool())
    .await?;
    match row {
        Some(row) => Ok(Some((row.try_get("entity_type")?, row.try_get("entity_id")?))),
        None => Ok(None),
    }
}
