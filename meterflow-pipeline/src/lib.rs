//! # Meterflow pipeline
//!
//! The two-tier durable event pipeline: the ingest path validates,
//! authenticates and deduplicates events into the hot store; the migration
//! worker drains hot batches into the durable store with at-least-once
//! delivery made exactly-once by the idempotency key; the aggregator folds
//! migrated events into monthly rollups inside the migration transaction.

pub mod cleanup;
pub mod ingest;
pub mod keycache;
pub mod migration;

pub use ingest::{IngestService, MigrationHint};
pub use keycache::{generate_api_key, hash_api_key, ProjectKeyCache};
pub use migration::{MigrationReport, MigrationWorker};
