//! # Meterflow billing
//!
//! The billing engine: a pure, deterministic calculator that turns monthly
//! usage aggregates plus pricing, minimum-charge, tax and currency rules
//! into a [`meterflow_core::model::CalculatedInvoice`]; the invoice
//! generator that owns fetching, validation and idempotent persistence; and
//! the currency service that resolves effective-dated exchange rates.

pub mod calculator;
pub mod currency;
pub mod generator;

pub use calculator::calculate;
pub use currency::{CurrencyService, RateSet};
pub use generator::{GeneratedOutcome, InvoiceGenerator};
