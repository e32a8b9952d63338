//! # Meterflow scheduler
//!
//! The platform's deterministic trigger map and the jobs it drives:
//! migration catch-up, daily reconciliation, hot-store cleanup, monthly
//! invoice generation, payment retries, hourly alert evaluation, payment
//! reminders and the optional exchange-rate sync. Every run gets a
//! correlation id, per-item failures are isolated inside each job, and all
//! jobs release their durable-store connections on every exit path.

pub mod alerts;
pub mod reconciliation;
pub mod reminders;
pub mod scheduler;

pub use alerts::AlertEngine;
pub use reconciliation::ReconciliationService;
pub use reminders::ReminderService;
pub use scheduler::{previous_month, JobSet, PlatformScheduler};
