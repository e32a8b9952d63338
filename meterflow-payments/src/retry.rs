//! Payment retry engine
//!
//! Failed payments carry `retry_count`, `max_retries`, `next_retry_at` and a
//! `retry_history`. A payment is eligible when it is failed, has budget
//! left, and its backoff has elapsed. A retry creates a fresh gateway order
//! and puts the payment back in `pending`; if that order later fails, the
//! webhook handler schedules the next attempt at `now + base * 2^count`.
//! Per-payment errors are isolated so one broken payment never stalls the
//! sweep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use meterflow_core::config::RetryConfig;
use meterflow_core::errors::{PaymentError, PaymentResult, StoreError};
use meterflow_core::model::{Payment, PaymentStatus, RetryAttempt};
use meterflow_core::observability;
use meterflow_storage::{invoices, payments, DurableStore};

use crate::gateway::PaymentGateway;

/// Exponential backoff: `base * 2^retry_count` hours, capped at a year so
/// pathological counters cannot overflow the clock.
pub fn backoff_delay(base_interval_hours: i64, retry_count: i32) -> Duration {
    const MAX_BACKOFF_HOURS: i64 = 24 * 365;
    let factor = 2i64
        .checked_pow(retry_count.max(0) as u32)
        .unwrap_or(i64::MAX);
    let hours = base_interval_hours
        .saturating_mul(factor)
        .clamp(0, MAX_BACKOFF_HOURS);
    Duration::hours(hours)
}

/// Outcome of one retry sweep
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct PaymentRetryEngine {
    store: DurableStore,
    gateway: Arc<dyn PaymentGateway>,
    config: RetryConfig,
}

impl PaymentRetryEngine {
    pub fn new(store: DurableStore, gateway: Arc<dyn PaymentGateway>, config: RetryConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Retry every eligible payment once. Runs on the six-hourly schedule.
    pub async fn run_once(&self) -> PaymentResult<RetryReport> {
        if !self.config.enabled {
            return Ok(RetryReport::default());
        }
        let now = Utc::now();
        let eligible = payments::list_retry_eligible(&self.store, now).await?;
        let mut report = RetryReport::default();
        for payment in eligible {
            report.attempted += 1;
            match self.retry_payment(&payment).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(payment_id = %payment.id, "payment retry failed: {e}");
                }
            }
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                "payment retry sweep complete"
            );
        }
        Ok(report)
    }

    /// Operator-triggered retry of a single failed payment, bypassing the
    /// backoff clock but not the budget.
    pub async fn retry_one(&self, payment_id: meterflow_core::model::PaymentId) -> PaymentResult<()> {
        let payment = payments::get(&self.store, payment_id).await?;
        if payment.status != PaymentStatus::Failed {
            return Err(PaymentError::InvalidTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Pending.to_string(),
            });
        }
        self.retry_payment(&payment).await
    }

    /// One retry: a fresh gateway order for the same invoice. Success puts
    /// the payment back in `pending` awaiting webhooks; a gateway failure
    /// records the attempt and schedules the next slot if budget remains.
    async fn retry_payment(&self, payment: &Payment) -> PaymentResult<()> {
        if payment.retry_count >= payment.max_retries {
            return Err(PaymentError::MaxRetriesExhausted {
                payment_id: payment.id.to_string(),
                max_retries: payment.max_retries,
            });
        }

        let invoice = invoices::get(&self.store, payment.invoice_id).await?;
        let amount_minor = meterflow_core::money::Money::new(payment.amount, payment.currency)
            .to_minor_units()?;
        let mut notes = HashMap::new();
        notes.insert("invoice_id".to_string(), invoice.id.to_string());
        notes.insert("invoice_number".to_string(), invoice.invoice_number.clone());
        notes.insert(
            "retry_attempt".to_string(),
            (payment.retry_count + 1).to_string(),
        );

        let now = Utc::now();
        let attempt_number = payment.retry_count + 1;
        match self
            .gateway
            .create_order(
                amount_minor,
                payment.currency.as_str(),
                &invoice.invoice_number,
                &notes,
            )
            .await
        {
            Ok(order) => {
                let attempt = RetryAttempt {
                    attempt: attempt_number,
                    at: now,
                    success: true,
                    error: None,
                    new_order_id: Some(order.order_id.clone()),
                };
                let mut tx = self.store.begin().await?;
                payments::record_retry_attempt(
                    &mut tx,
                    payment.id,
                    &attempt,
                    None,
                    Some(&order.order_id),
                    PaymentStatus::Pending,
                )
                .await?;
                tx.commit().await.map_err(StoreError::Database)?;
                observability::record_payment_retry(true);
                info!(
                    payment_id = %payment.id,
                    attempt = attempt_number,
                    order_id = %order.order_id,
                    "payment retry created new order"
                );
                Ok(())
            }
            Err(e) => {
                let next_retry_at = if attempt_number < payment.max_retries {
                    Some(now + backoff_delay(self.config.base_interval_hours, attempt_number))
                } else {
                    None
                };
                let attempt = RetryAttempt {
                    attempt: attempt_number,
                    at: now,
                    success: false,
                    error: Some(e.to_string()),
                    new_order_id: None,
                };
                let mut tx = self.store.begin().await?;
                payments::record_retry_attempt(
                    &mut tx,
                    payment.id,
                    &attempt,
                    next_retry_at,
                    None,
                    PaymentStatus::Failed,
                )
                .await?;
                tx.commit().await.map_err(StoreError::Database)?;
                observability::record_payment_retry(false);
                if next_retry_at.is_none() {
                    warn!(
                        payment_id = %payment.id,
                        "retry budget exhausted after failed order creation"
                    );
                    return Err(PaymentError::MaxRetriesExhausted {
                        payment_id: payment.id.to_string(),
                        max_retries: payment.max_retries,
                    });
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(24, 0), Duration::hours(24));
        assert_eq!(backoff_delay(24, 1), Duration::hours(48));
        assert_eq!(backoff_delay(24, 2), Duration::hours(96));
        assert_eq!(backoff_delay(6, 3), Duration::hours(48));
    }

    #[test]
    fn retry_schedule_matches_the_contract() {
        // failed at T0 with max_retries = 3, base = 24h: attempts run no
        // earlier than T0+24h, then +48h and +96h after each failure
        let t0 = Utc::now();
        let first = t0 + backoff_delay(24, 0);
        let second = first + backoff_delay(24, 1);
        let third = second + backoff_delay(24, 2);
        assert_eq!(first - t0, Duration::hours(24));
        assert_eq!(second - first, Duration::hours(48));
        assert_eq!(third - second, Duration::hours(96));
        assert_eq!(third - t0, Duration::hours(168));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let delay = backoff_delay(24, 62);
        assert!(delay > Duration::hours(24));
    }
}
