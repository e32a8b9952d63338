//! Refund service
//!
//! Full and partial refunds against captured payments. A refund row is
//! inserted `pending` under an idempotency key derived from the payment,
//! amount and the caller's request id, then the gateway refund is created;
//! settlement arrives through `refund.processed` / `refund.failed`
//! webhooks, at which point the store trigger moves the payment to
//! `refunded` or `partially_refunded` and the invoice to `refunded` once
//! the full amount has been returned.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use meterflow_core::errors::{PaymentError, PaymentResult, StoreError};
use meterflow_core::model::{
    AuditLogEntry, AuthContext, Payment, PaymentId, PaymentStatus, Refund, RefundStatus,
    RefundType,
};
use meterflow_core::money::Money;
use meterflow_core::observability;
use meterflow_storage::{audit, idempotency, organisations, payments, refunds, DurableStore,
    IdempotencyOutcome};

use crate::gateway::PaymentGateway;

pub struct RefundService {
    store: DurableStore,
    gateway: Arc<dyn PaymentGateway>,
}

impl RefundService {
    pub fn new(store: DurableStore, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Refund a captured payment. `amount = None` refunds whatever remains.
    /// The `request_id` makes client retries idempotent: the same
    /// `(payment, amount, request_id)` returns the first refund.
    pub async fn refund(
        &self,
        payment_id: PaymentId,
        amount: Option<Decimal>,
        reason: Option<String>,
        request_id: &str,
        actor: &AuthContext,
    ) -> PaymentResult<Refund> {
        let payment = payments::get(&self.store, payment_id).await?;
        require_refundable(&payment)?;

        let already_refunded = refunds::claimed_total_for_payment(&self.store, payment_id).await?;
        let remaining = payment.amount - already_refunded;
        let amount = amount.unwrap_or(remaining);

        if amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidRefundAmount(amount.to_string()));
        }
        if amount > remaining {
            return Err(PaymentError::RefundExceedsRemaining {
                requested: Money::new(amount, payment.currency).format_fixed(),
                remaining: Money::new(remaining, payment.currency).format_fixed(),
            });
        }

        let refund_type = if amount == payment.amount && already_refunded.is_zero() {
            RefundType::Full
        } else {
            RefundType::Partial
        };

        let refund_number = self.next_refund_number(&payment).await?;
        let now = Utc::now();
        let refund = Refund {
            id: Uuid::new_v4(),
            payment_id,
            invoice_id: payment.invoice_id,
            refund_number,
            amount,
            currency: payment.currency,
            status: RefundStatus::Pending,
            refund_type,
            reason,
            gateway_refund_id: None,
            initiated_by: actor.actor.clone(),
            created_at: now,
            updated_at: now,
        };

        let key = format!("refund_{payment_id}_{amount}_{request_id}");
        let outcome = idempotency::with_idempotency(&self.store, &key, "refund", |tx| {
            let refund = refund.clone();
            let actor = actor.clone();
            Box::pin(async move {
                refunds::insert(tx, &refund).await?;
                audit::append(
                    tx,
                    &AuditLogEntry {
                        id: Uuid::new_v4(),
                        entity_type: "refund".to_string(),
                        entity_id: refund.id.to_string(),
                        action: "created".to_string(),
                        actor: actor.actor.clone(),
                        before: None,
                        after: serde_json::to_value(&refund).ok(),
                        ip_address: actor.ip_address.clone(),
                        user_agent: actor.user_agent.clone(),
                        created_at: Utc::now(),
                    },
                )
                .await?;
                let id = refund.id.to_string();
                Ok((refund, id))
            })
        })
        .await?;

        let refund = match outcome {
            IdempotencyOutcome::Created(refund) => refund,
            IdempotencyOutcome::Existing { entity_id } => {
                let id: Uuid = entity_id
                    .parse()
                    .map_err(|_| StoreError::Decode(format!("refund id {entity_id}")))?;
                return Ok(refunds::get(&self.store, id).await?);
            }
        };

        observability::record_refund_created();
        self.dispatch_to_gateway(&payment, refund).await
    }

    /// Create the refund at the gateway; on failure the local row is marked
    /// failed and the error propagates.
    async fn dispatch_to_gateway(
        &self,
        payment: &Payment,
        refund: Refund,
    ) -> PaymentResult<Refund> {
        let Some(gateway_payment_id) = payment.gateway_payment_id.as_deref() else {
            return Err(PaymentError::NotRefundable {
                payment_id: payment.id.to_string(),
                status: "no gateway payment id".to_string(),
            });
        };

        let amount_minor = Money::new(refund.amount, refund.currency).to_minor_units()?;
        let mut notes = HashMap::new();
        notes.insert("refund_id".to_string(), refund.id.to_string());
        notes.insert("refund_number".to_string(), refund.refund_number.clone());

        match self
            .gateway
            .create_refund(gateway_payment_id, amount_minor, &notes)
            .await
        {
            Ok(gateway_refund) => {
                let mut tx = self.store.begin().await?;
                refunds::update_status(
                    &mut tx,
                    refund.id,
                    RefundStatus::Pending,
                    Some(&gateway_refund.refund_id),
                )
                .await?;
                tx.commit().await.map_err(StoreError::Database)?;
                info!(
                    refund = %refund.refund_number,
                    gateway_refund_id = %gateway_refund.refund_id,
                    "refund dispatched to gateway"
                );
                Ok(refunds::get(&self.store, refund.id).await?)
            }
            Err(e) => {
                warn!(refund = %refund.refund_number, "gateway refund failed: {e}");
                let mut tx = self.store.begin().await?;
                refunds::update_status(&mut tx, refund.id, RefundStatus::Failed, None).await?;
                tx.commit().await.map_err(StoreError::Database)?;
                Err(e)
            }
        }
    }

    async fn next_refund_number(&self, payment: &Payment) -> PaymentResult<String> {
        let existing = refunds::list_for_payment(&self.store, payment.id).await?;
        Ok(format!(
            "RF-{}-{}-{:02}",
            organisations::short_org_code(payment.organisation_id),
            organisations::short_org_code(payment.id),
            existing.len() as i64 + 1
        ))
    }
}

fn require_refundable(payment: &Payment) -> PaymentResult<()> {
    match payment.status {
        PaymentStatus::Captured | PaymentStatus::PartiallyRefunded => Ok(()),
        status => Err(PaymentError::NotRefundable {
            payment_id: payment.id.to_string(),
            status: status.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterflow_core::money::Currency;

    fn payment(status: PaymentStatus) -> Payment {
        let now = Utc::now();
        Payment {
            id: Uuid::new_v4(),
            organisation_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            gateway_order_id: "order_1".to_string(),
            gateway_payment_id: Some("pay_X".to_string()),
            amount: "1000.00".parse().unwrap(),
            currency: Currency::INR,
            status,
            method: Some("card".to_string()),
            paid_at: Some(now),
            reconciled_at: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            last_retry_at: None,
            retry_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn only_captured_payments_are_refundable() {
        assert!(require_refundable(&payment(PaymentStatus::Captured)).is_ok());
        assert!(require_refundable(&payment(PaymentStatus::PartiallyRefunded)).is_ok());
        assert!(require_refundable(&payment(PaymentStatus::Pending)).is_err());
        assert!(require_refundable(&payment(PaymentStatus::Failed)).is_err());
        assert!(require_refundable(&payment(PaymentStatus::Refunded)).is_err());
    }
}
