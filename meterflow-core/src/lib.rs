//! # Meterflow core
//!
//! Shared foundation for the meterflow billing platform: the exact-decimal
//! money kernel, the domain model used by every subsystem, the typed platform
//! configuration, the error taxonomy, observability helpers, and the
//! capability interfaces (email, PDF, object storage, notification channels)
//! behind which all external transports live.
//!
//! Nothing in this crate performs I/O against the hot or durable stores; it
//! only defines the vocabulary the other crates speak.

pub mod capability;
pub mod config;
pub mod errors;
pub mod model;
pub mod money;
pub mod observability;

pub use config::*;
pub use errors::*;
pub use model::*;
pub use money::{Currency, Money};
