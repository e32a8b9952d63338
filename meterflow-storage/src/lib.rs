//! # Meterflow storage
//!
//! The two stores of the event pipeline and the repositories over the durable
//! schema:
//!
//! - [`hot::HotEventStore`] — write-optimised sled store holding raw events
//!   between ingest and migration, keyed by the client-chosen idempotency key.
//! - [`store::DurableStore`] — the authoritative Postgres store (events,
//!   aggregates, invoices, payments, refunds, rules, rates, alerts, audit
//!   logs, reconciliation rows, idempotency rows) behind a bounded pool.
//!
//! Key invariants (unique idempotency keys, one non-cancelled invoice per
//! organisation and period, invoice immutability after finalisation, refund
//! coupling) are enforced in the schema via constraints and triggers; the
//! repositories only speak in terms of the domain model.

pub mod aggregates;
pub mod alerts;
pub mod audit;
pub mod events;
pub mod hot;
pub mod idempotency;
pub mod invoices;
pub mod notifications;
pub mod organisations;
pub mod payments;
pub mod pricing;
pub mod rates;
pub mod reconciliation;
pub mod refunds;
pub mod schema;
pub mod store;

pub use hot::HotEventStore;
pub use idempotency::{IdempotencyOutcome, Reserved};
pub use store::DurableStore;
