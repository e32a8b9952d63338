//! Scheduling kernel
//!
//! The deterministic trigger map (all expressions UTC):
//!
//! | job                | schedule          |
//! |--------------------|-------------------|
//! | migration          | every 5 minutes   |
//! | reconciliation     | daily 02:00       |
//! | hot-store cleanup  | daily 03:00       |
//! | invoice generation | monthly 1st 02:00 |
//! | payment retry      | every 6 hours     |
//! | alert evaluation   | hourly            |
//! | payment reminders  | daily 09:00       |
//! | exchange-rate sync | daily 01:00       |
//! | pending janitor    | hourly at :30     |
//!
//! Every run logs under a fresh correlation id; job failures are logged and
//! never tear the scheduler down.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use meterflow_billing::{CurrencyService, InvoiceGenerator};
use meterflow_core::errors::PlatformError;
use meterflow_core::model::AuthContext;
use meterflow_payments::{PaymentRetryEngine, PaymentService};
use meterflow_pipeline::{cleanup::CleanupTask, MigrationWorker};

use crate::alerts::AlertEngine;
use crate::reconciliation::ReconciliationService;
use crate::reminders::ReminderService;

/// The month an invoice run at `now` bills: the previous calendar month.
pub fn previous_month(now: DateTime<Utc>) -> (u32, i32) {
    if now.month() == 1 {
        (12, now.year() - 1)
    } else {
        (now.month() - 1, now.year())
    }
}

/// Everything the trigger map drives
pub struct JobSet {
    pub migration: Arc<MigrationWorker>,
    pub cleanup: Arc<CleanupTask>,
    pub generator: Arc<InvoiceGenerator>,
    pub retry: Arc<PaymentRetryEngine>,
    pub alerts: Arc<AlertEngine>,
    pub reconciliation: Arc<ReconciliationService>,
    pub reminders: Arc<ReminderService>,
    pub payments: Arc<PaymentService>,
    pub currency: Arc<CurrencyService>,
    pub cancel: CancellationToken,
}

pub struct PlatformScheduler {
    inner: JobScheduler,
}

macro_rules! scheduled {
    ($sched:expr, $expr:literal, $name:literal, $jobs:expr, $body:expr) => {{
        let jobs = Arc::clone(&$jobs);
        let job = Job::new_async($expr, move |_job_id, _scheduler| {
            let jobs = Arc::clone(&jobs);
            Box::pin(async move {
                let correlation_id = Uuid::new_v4();
                let span = tracing::info_span!("job", job = $name, %correlation_id);
                async {
                    if let Err(e) = $body(jobs).await {
                        error!("scheduled job failed: {e}");
                    }
                }
                .instrument(span)
                .await;
            })
        })
        .map_err(|e| PlatformError::Config(e.to_string()))?;
        $sched
            .add(job)
            .await
            .map_err(|e| PlatformError::Config(e.to_string()))?;
    }};
}

impl PlatformScheduler {
    /// Build and start the trigger map.
    pub async fn start(jobs: JobSet) -> Result<Self, PlatformError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        let jobs = Arc::new(jobs);

        scheduled!(scheduler, "0 */5 * * * *", "migration", jobs, |jobs: Arc<JobSet>| async move {
            jobs.migration
                .run_once(&jobs.cancel)
                .await
                .map(|_| ())
        });

        scheduled!(scheduler, "0 0 2 * * *", "reconciliation", jobs, |jobs: Arc<JobSet>| async move {
            let report = jobs.reconciliation.run_all(Utc::now()).await;
            if report.failed_routines > 0 {
                error!(failed = report.failed_routines, "reconciliation had failing routines");
            }
            Ok::<(), PlatformError>(())
        });

        scheduled!(scheduler, "0 0 3 * * *", "hot-cleanup", jobs, |jobs: Arc<JobSet>| async move {
            jobs.cleanup.run_once().map(|_| ()).map_err(PlatformError::from)
        });

        scheduled!(scheduler, "0 0 2 1 * *", "invoice-generation", jobs, |jobs: Arc<JobSet>| async move {
            let (month, year) = previous_month(Utc::now());
            jobs.generator
                .generate_for_month(month, year, &AuthContext::system("invoice-generation"))
                .await
                .map(|_| ())
                .map_err(PlatformError::from)
        });

        scheduled!(scheduler, "0 0 */6 * * *", "payment-retry", jobs, |jobs: Arc<JobSet>| async move {
            jobs.retry.run_once().await.map(|_| ()).map_err(PlatformError::from)
        });

        scheduled!(scheduler, "0 0 * * * *", "alert-evaluation", jobs, |jobs: Arc<JobSet>| async move {
            jobs.alerts
                .evaluate_all(Utc::now())
                .await
                .map(|_| ())
                .map_err(PlatformError::from)
        });

        scheduled!(scheduler, "0 0 9 * * *", "payment-reminders", jobs, |jobs: Arc<JobSet>| async move {
            jobs.reminders.run_once().await.map(|_| ()).map_err(PlatformError::from)
        });

        scheduled!(scheduler, "0 0 1 * * *", "exchange-rate-sync", jobs, |jobs: Arc<JobSet>| async move {
            jobs.currency.sync().await.map(|_| ()).map_err(PlatformError::from)
        });

        scheduled!(scheduler, "0 30 * * * *", "pending-janitor", jobs, |jobs: Arc<JobSet>| async move {
            jobs.payments
                .fail_stale_pending()
                .await
                .map(|_| ())
                .map_err(PlatformError::from)
        });

        scheduler
            .start()
            .await
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        info!("scheduler started with 9 jobs");
        Ok(Self { inner: scheduler })
    }

    pub async fn shutdown(&mut self) -> Result<(), PlatformError> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| PlatformError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn invoice_runs_bill_the_previous_month() {
        let february = Utc.with_ymd_and_hms(2024, 2, 1, 2, 0, 0).unwrap();
        assert_eq!(previous_month(february), (1, 2024));
        let january = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        assert_eq!(previous_month(january), (12, 2023));
        let july = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        assert_eq!(previous_month(july), (6, 2024));
    }
}
