//! Payment reminders
//!
//! Daily sweep: `sent` invoices past their due date move to `overdue`, then
//! every unpaid invoice past due gets a reminder email. Per-invoice errors
//! are isolated.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use meterflow_core::capability::{EmailMessage, EmailSender};
use meterflow_core::errors::{BillingResult, StoreResult};
use meterflow_core::model::Invoice;
use meterflow_core::observability;
use meterflow_storage::{invoices, notifications, DurableStore};

#[derive(Debug, Default)]
pub struct ReminderReport {
    pub swept_overdue: usize,
    pub reminders_sent: usize,
    pub failed: usize,
}

pub struct ReminderService {
    store: DurableStore,
    email: Arc<dyn EmailSender>,
}

impl ReminderService {
    pub fn new(store: DurableStore, email: Arc<dyn EmailSender>) -> Self {
        Self { store, email }
    }

    pub async fn run_once(&self) -> BillingResult<ReminderReport> {
        let now = Utc::now();
        let mut report = ReminderReport::default();

        let swept = invoices::sweep_overdue(&self.store, now).await?;
        report.swept_overdue = swept.len();

        for invoice in invoices::list_unpaid_due(&self.store, now).await? {
            match self.send_reminder(&invoice).await {
                Ok(()) => report.reminders_sent += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(invoice = %invoice.invoice_number, "payment reminder failed: {e}");
                }
            }
        }

        if report.swept_overdue > 0 || report.reminders_sent > 0 {
            info!(
                swept_overdue = report.swept_overdue,
                reminders_sent = report.reminders_sent,
                failed = report.failed,
                "payment reminder sweep complete"
            );
        }
        Ok(report)
    }

    async fn send_reminder(&self, invoice: &Invoice) -> StoreResult<()> {
        let message = EmailMessage {
            to: format!("billing+{}@organisation.invalid", invoice.organisation_id),
            subject: format!("Payment reminder for invoice {}", invoice.invoice_number),
            body: format!(
                "Invoice {} totalling {} {} was due on {}. Please arrange payment.",
                invoice.invoice_number,
                invoice.total,
                invoice.currency,
                invoice.due_date.date_naive()
            ),
            kind: "payment_reminder".to_string(),
        };
        let delivered = self.email.send(&message).await;
        observability::record_email(delivered.is_ok());
        let error = delivered.as_ref().err().map(|e| e.to_string());
        notifications::record_delivery(
            &self.store,
            Some(invoice.organisation_id),
            &message.to,
            &message.subject,
            &message.body,
            &message.kind,
            delivered.is_ok(),
            error.as_deref(),
        )
        .await?;
        Ok(())
    }
}
