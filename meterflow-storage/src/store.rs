//! Durable store handle
//!
//! Wraps the bounded Postgres pool and exposes the repositories. Connections
//! are acquired per operation and released in all exit paths; transactions
//! are short and owned by the calling service, never by the repositories.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use meterflow_core::config::DatabaseConfig;
use meterflow_core::errors::{StoreError, StoreResult};
use meterflow_core::money::Currency;

/// A transaction over the durable store
pub type DsTransaction<'t> = Transaction<'t, Postgres>;

/// Handle to the authoritative relational store
#[derive(Clone)]
pub struct DurableStore {
    pool: PgPool,
}

impl DurableStore {
    /// Connect with the bounded pool and per-operation deadlines from config,
    /// then apply the schema.
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;
        let store = Self { pool };
        crate::schema::initialize(&store.pool).await?;
        Ok(store)
    }

    /// Wrap an existing pool; used by tests that manage their own database.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        crate::schema::initialize(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> StoreResult<DsTransaction<'static>> {
        Ok(self.pool.begin().await?)
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Whether a database error is a unique-constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Whether a database error was raised by the invoice immutability trigger.
pub fn is_immutability_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("immutable"),
        _ => false,
    }
}

pub(crate) fn parse_currency(code: &str) -> StoreResult<Currency> {
    Currency::parse(code).map_err(|e| StoreError::Decode(e.to_string()))
}

pub(crate) fn parse_enum<T>(value: &str) -> StoreResult<T>
where
    T: FromStr<Err = String>,
{
    T::from_str(value).map_err(StoreError::Decode)
}
