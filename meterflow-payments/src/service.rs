//! Payment state machine
//!
//! Order creation against finalised invoices and webhook-driven state
//! transitions. Every financial transition happens inside one durable
//! transaction: the per-payment advisory lock serialises concurrent webhook
//! deliveries, the payment row is locked before any transition, and the
//! invoice moves to `paid` in the same transaction that captures the
//! payment. Replays of an already-applied event commit nothing and answer
//! 200 so the gateway stops retrying.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use meterflow_billing::CurrencyService;
use meterflow_core::config::{GatewayConfig, RetryConfig};
use meterflow_core::errors::{PaymentError, PaymentResult};
use meterflow_core::model::{
    AuditLogEntry, AuthContext, Invoice, InvoiceId, InvoiceStatus, Payment, PaymentStatus,
};
use meterflow_core::money::{Currency, Money};
use meterflow_core::observability;
use meterflow_storage::{audit, idempotency, invoices, payments, DurableStore};

use crate::gateway::PaymentGateway;
use crate::retry::backoff_delay;
use crate::webhook::{self, PaymentEntity, RefundEntity, WebhookEvent};

/// What a webhook delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The transition was applied and committed
    Applied,
    /// The event was already applied; nothing changed
    Replayed,
    /// Recognised but deliberately ignored event type
    Ignored,
}

/// How to treat an incoming transition against the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    Apply,
    /// Same or earlier state; a replay or out-of-order stale delivery
    Replay,
    /// A transition the state machine forbids
    Reject,
}

fn progress_rank(status: PaymentStatus) -> i32 {
    match status {
        PaymentStatus::Pending => 0,
        PaymentStatus::Authorized => 1,
        PaymentStatus::Captured => 2,
        PaymentStatus::PartiallyRefunded => 3,
        PaymentStatus::Refunded => 4,
        // Failed sits outside the forward progression
        PaymentStatus::Failed => -1,
    }
}

/// Decide how a webhook-reported state applies to the stored one. Stale
/// deliveries (earlier in the progression than what we already hold) are
/// replays, not errors, so gateway retries converge.
pub fn plan_transition(current: PaymentStatus, target: PaymentStatus) -> TransitionPlan {
    if current == target {
        return TransitionPlan::Replay;
    }
    if current.can_transition_to(target) {
        return TransitionPlan::Apply;
    }
    let (current_rank, target_rank) = (progress_rank(current), progress_rank(target));
    if current_rank >= 0 && target_rank >= 0 && target_rank < current_rank {
        return TransitionPlan::Replay;
    }
    TransitionPlan::Reject
}

pub struct PaymentService {
    store: DurableStore,
    gateway: Arc<dyn PaymentGateway>,
    currency: Arc<CurrencyService>,
    gateway_config: GatewayConfig,
    retry_config: RetryConfig,
}

impl PaymentService {
    /// The settlement currency the gateway accepts orders in.
    pub const GATEWAY_CURRENCY: Currency = Currency::INR;

    pub fn new(
        store: DurableStore,
        gateway: Arc<dyn PaymentGateway>,
        currency: Arc<CurrencyService>,
        gateway_config: GatewayConfig,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            currency,
            gateway_config,
            retry_config,
        }
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    /// Create a gateway order for a finalised invoice. Idempotent per
    /// invoice: an existing non-failed payment is returned unchanged.
    pub async fn create_order(
        &self,
        invoice_id: InvoiceId,
        actor: &AuthContext,
    ) -> PaymentResult<Payment> {
        let invoice = invoices::get(&self.store, invoice_id).await?;
        require_payable(&invoice)?;

        if let Some(existing) = payments::find_active_for_invoice(&self.store, invoice_id).await? {
            return Ok(existing);
        }

        let invoice_total = Money::new(invoice.total, invoice.currency);
        let (settlement, notes) = self.settlement_amount(&invoice, invoice_total).await?;
        let amount_minor = settlement.to_minor_units()?;

        let order = self
            .gateway
            .create_order(
                amount_minor,
                settlement.currency().as_str(),
                &invoice.invoice_number,
                &notes,
            )
            .await?;

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            organisation_id: invoice.organisation_id,
            invoice_id,
            gateway_order_id: order.order_id,
            gateway_payment_id: None,
            amount: settlement.rounded().amount(),
            currency: settlement.currency(),
            status: PaymentStatus::Pending,
            method: None,
            paid_at: None,
            reconciled_at: None,
            retry_count: 0,
            max_retries: self.retry_config.max_retries,
            next_retry_at: None,
            last_retry_at: None,
            retry_history: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.store.begin().await?;
        payments::insert(&mut tx, &payment).await?;
        audit::append(
            &mut tx,
            &audit_entry(
                "payment",
                &payment.id.to_string(),
                "order_created",
                actor,
                None,
                serde_json::to_value(&payment).ok(),
            ),
        )
        .await?;
        tx.commit().await.map_err(meterflow_core::errors::StoreError::Database)?;

        info!(
            invoice = %invoice.invoice_number,
            order_id = %payment.gateway_order_id,
            amount = %payment.amount,
            "payment order created"
        );
        Ok(payment)
    }

    /// Convert the invoice total into the gateway's settlement currency when
    /// they differ, preserving the original amount in the order notes.
    async fn settlement_amount(
        &self,
        invoice: &Invoice,
        total: Money,
    ) -> PaymentResult<(Money, HashMap<String, String>)> {
        let mut notes = HashMap::new();
        notes.insert("invoice_id".to_string(), invoice.id.to_string());
        notes.insert("invoice_number".to_string(), invoice.invoice_number.clone());
        if total.currency() == Self::GATEWAY_CURRENCY {
            return Ok((total, notes));
        }
        let converted = self
            .currency
            .convert(total, Self::GATEWAY_CURRENCY, Utc::now())
            .await?;
        notes.insert("original_currency".to_string(), total.currency().to_string());
        notes.insert("original_amount".to_string(), total.format_fixed());
        Ok((converted, notes))
    }

    /// Verify, parse and apply one webhook delivery.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookOutcome> {
        if !webhook::verify_signature(&self.gateway_config.webhook_secret, raw_body, signature) {
            observability::record_webhook_rejected("bad_signature");
            return Err(PaymentError::BadSignature);
        }

        let event = webhook::parse_event(raw_body)?;
        match event {
            WebhookEvent::PaymentAuthorized(entity) => {
                self.apply_payment_event(entity, PaymentStatus::Authorized, "payment.authorized")
                    .await
            }
            WebhookEvent::PaymentCaptured(entity) => {
                self.apply_payment_event(entity, PaymentStatus::Captured, "payment.captured")
                    .await
            }
            WebhookEvent::PaymentFailed(entity) => {
                self.apply_payment_event(entity, PaymentStatus::Failed, "payment.failed")
                    .await
            }
            WebhookEvent::RefundProcessed(entity) => {
                self.apply_refund_event(entity, true, "refund.processed").await
            }
            WebhookEvent::RefundFailed(entity) => {
                self.apply_refund_event(entity, false, "refund.failed").await
            }
            WebhookEvent::Ignored(name) => {
                observability::record_webhook_accepted(&name);
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn apply_payment_event(
        &self,
        entity: PaymentEntity,
        target: PaymentStatus,
        event_name: &str,
    ) -> PaymentResult<WebhookOutcome> {
        let mut tx = self.store.begin().await?;
        let key = format!("gateway_payment_{}", entity.id);
        idempotency::lock_key(&mut tx, &key).await?;

        let payment = match payments::find_by_gateway_payment_id_for_update(&mut tx, &entity.id)
            .await?
        {
            Some(payment) => Some(payment),
            None => match &entity.order_id {
                Some(order_id) => {
                    payments::find_by_order_id_for_update(&mut tx, order_id).await?
                }
                None => None,
            },
        };
        let Some(payment) = payment else {
            let _ = tx.rollback().await;
            observability::record_webhook_rejected("unknown_order");
            return Err(PaymentError::UnknownOrder {
                order_id: entity
                    .order_id
                    .clone()
                    .unwrap_or_else(|| entity.id.clone()),
            });
        };

        match plan_transition(payment.status, target) {
            TransitionPlan::Replay => {
                let _ = tx.rollback().await;
                observability::record_webhook_accepted(event_name);
                return Ok(WebhookOutcome::Replayed);
            }
            TransitionPlan::Reject => {
                let _ = tx.rollback().await;
                observability::record_webhook_rejected("invalid_transition");
                return Err(PaymentError::InvalidTransition {
                    from: payment.status.to_string(),
                    to: target.to_string(),
                });
            }
            TransitionPlan::Apply => {}
        }

        let now = Utc::now();
        let paid_at = (target == PaymentStatus::Captured).then_some(now);
        payments::apply_transition(
            &mut tx,
            payment.id,
            target,
            Some(&entity.id),
            entity.method.as_deref(),
            paid_at,
        )
        .await?;

        // Invoice coupling happens in the same transaction as the capture
        if target == PaymentStatus::Captured {
            invoices::transition_status(&mut tx, payment.invoice_id, InvoiceStatus::Paid, paid_at)
                .await?;
        }

        if target == PaymentStatus::Failed {
            let next_retry_at = self.retry_schedule(payment.retry_count, now);
            payments::mark_failed(&mut tx, payment.id, next_retry_at).await?;
            if next_retry_at.is_none() && payment.retry_count >= payment.max_retries {
                warn!(
                    payment_id = %payment.id,
                    "payment failed with retry budget exhausted"
                );
            }
        }

        idempotency::complete(&mut tx, &key, "payment", &payment.id.to_string()).await?;
        audit::append(
            &mut tx,
            &audit_entry(
                "payment",
                &payment.id.to_string(),
                event_name,
                &AuthContext::system("webhook"),
                Some(serde_json::json!({ "status": payment.status.as_str() })),
                Some(serde_json::json!({ "status": target.as_str() })),
            ),
        )
        .await?;
        tx.commit().await.map_err(meterflow_core::errors::StoreError::Database)?;

        observability::record_webhook_accepted(event_name);
        info!(
            payment_id = %payment.id,
            gateway_payment_id = %entity.id,
            from = %payment.status,
            to = %target,
            "payment transition applied"
        );
        Ok(WebhookOutcome::Applied)
    }

    async fn apply_refund_event(
        &self,
        entity: RefundEntity,
        processed: bool,
        event_name: &str,
    ) -> PaymentResult<WebhookOutcome> {
        use meterflow_core::model::RefundStatus;
        use meterflow_storage::refunds;

        let refund = match refunds::find_by_gateway_refund_id(&self.store, &entity.id).await? {
            Some(refund) => refund,
            None => {
                // Fall back to the refund id we put in the gateway notes
                let from_notes = entity
                    .notes
                    .as_ref()
                    .and_then(|notes| notes.get("refund_id"))
                    .and_then(|value| value.as_str())
                    .and_then(|raw| raw.parse::<Uuid>().ok());
                match from_notes {
                    Some(id) => refunds::get(&self.store, id).await?,
                    None => {
                        observability::record_webhook_rejected("unknown_refund");
                        return Err(PaymentError::UnknownOrder {
                            order_id: entity.id.clone(),
                        });
                    }
                }
            }
        };

        let target = if processed {
            RefundStatus::Processed
        } else {
            RefundStatus::Failed
        };
        if refund.status == target {
            observability::record_webhook_accepted(event_name);
            return Ok(WebhookOutcome::Replayed);
        }

        let mut tx = self.store.begin().await?;
        let key = format!("gateway_refund_{}", entity.id);
        idempotency::lock_key(&mut tx, &key).await?;
        refunds::update_status(&mut tx, refund.id, target, Some(&entity.id)).await?;
        idempotency::complete(&mut tx, &key, "refund", &refund.id.to_string()).await?;
        audit::append(
            &mut tx,
            &audit_entry(
                "refund",
                &refund.id.to_string(),
                event_name,
                &AuthContext::system("webhook"),
                Some(serde_json::json!({ "status": refund.status.as_str() })),
                Some(serde_json::json!({ "status": target.as_str() })),
            ),
        )
        .await?;
        tx.commit().await.map_err(meterflow_core::errors::StoreError::Database)?;

        observability::record_webhook_accepted(event_name);
        Ok(WebhookOutcome::Applied)
    }

    /// Fail payments stuck in `pending` beyond the gateway TTL; they become
    /// retry candidates.
    pub async fn fail_stale_pending(&self) -> PaymentResult<usize> {
        let now = Utc::now();
        let cutoff = now - Duration::minutes(self.gateway_config.pending_ttl_minutes);
        let stale = payments::list_stale_pending(&self.store, cutoff).await?;
        let mut failed = 0usize;
        for payment in stale {
            let mut tx = self.store.begin().await?;
            let next_retry_at = self.retry_schedule(payment.retry_count, now);
            payments::mark_failed(&mut tx, payment.id, next_retry_at).await?;
            audit::append(
                &mut tx,
                &audit_entry(
                    "payment",
                    &payment.id.to_string(),
                    "pending_ttl_expired",
                    &AuthContext::system("payment-janitor"),
                    Some(serde_json::json!({ "status": payment.status.as_str() })),
                    Some(serde_json::json!({ "status": "failed" })),
                ),
            )
            .await?;
            tx.commit().await.map_err(meterflow_core::errors::StoreError::Database)?;
            failed += 1;
        }
        if failed > 0 {
            info!(failed, "stale pending payments failed by janitor");
        }
        Ok(failed)
    }

    fn retry_schedule(&self, retry_count: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.retry_config.enabled || retry_count >= self.retry_config.max_retries {
            return None;
        }
        Some(now + backoff_delay(self.retry_config.base_interval_hours, retry_count))
    }
}

fn require_payable(invoice: &Invoice) -> PaymentResult<()> {
    match invoice.status {
        InvoiceStatus::Finalized | InvoiceStatus::Sent | InvoiceStatus::Overdue => Ok(()),
        status => Err(PaymentError::InvoiceNotFinalized {
            invoice_id: invoice.id.to_string(),
            status: status.to_string(),
        }),
    }
}

fn audit_entry(
    entity_type: &str,
    entity_id: &str,
    action: &str,
    actor: &AuthContext,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
) -> AuditLogEntry {
    AuditLogEntry {
        id: Uuid::new_v4(),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        action: action.to_string(),
        actor: actor.actor.clone(),
        before,
        after,
        ip_address: actor.ip_address.clone(),
        user_agent: actor.user_agent.clone(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_and_stale_deliveries_are_idempotent() {
        use PaymentStatus::*;
        assert_eq!(plan_transition(Captured, Captured), TransitionPlan::Replay);
        assert_eq!(plan_transition(Captured, Authorized), TransitionPlan::Replay);
        assert_eq!(plan_transition(Refunded, Captured), TransitionPlan::Replay);
        assert_eq!(
            plan_transition(PartiallyRefunded, Captured),
            TransitionPlan::Replay
        );
    }

    #[test]
    fn forward_transitions_apply() {
        use PaymentStatus::*;
        assert_eq!(plan_transition(Pending, Authorized), TransitionPlan::Apply);
        assert_eq!(plan_transition(Pending, Captured), TransitionPlan::Apply);
        assert_eq!(plan_transition(Pending, Failed), TransitionPlan::Apply);
        assert_eq!(plan_transition(Authorized, Captured), TransitionPlan::Apply);
        assert_eq!(plan_transition(Captured, Refunded), TransitionPlan::Apply);
    }

    #[test]
    fn impossible_transitions_are_rejected() {
        use PaymentStatus::*;
        assert_eq!(plan_transition(Failed, Captured), TransitionPlan::Reject);
        assert_eq!(plan_transition(Failed, Authorized), TransitionPlan::Reject);
    }

    #[test]
    fn only_post_finalisation_invoices_are_payable() {
        let mut invoice = test_invoice(InvoiceStatus::Draft);
        assert!(require_payable(&invoice).is_err());
        invoice.status = InvoiceStatus::Finalized;
        assert!(require_payable(&invoice).is_ok());
        invoice.status = InvoiceStatus::Sent;
        assert!(require_payable(&invoice).is_ok());
        invoice.status = InvoiceStatus::Overdue;
        assert!(require_payable(&invoice).is_ok());
        invoice.status = InvoiceStatus::Paid;
        assert!(require_payable(&invoice).is_err());
        invoice.status = InvoiceStatus::Cancelled;
        assert!(require_payable(&invoice).is_err());
    }

    fn test_invoice(status: InvoiceStatus) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: Uuid::new_v4(),
            organisation_id: Uuid::new_v4(),
            invoice_number: "INV-TEST-202401-0001".to_string(),
            status,
            subtotal: "1000.00".parse().unwrap(),
            subtotal_after_min: "1000.00".parse().unwrap(),
            tax: "180.00".parse().unwrap(),
            discount: rust_decimal::Decimal::ZERO,
            total: "1180.00".parse().unwrap(),
            currency: Currency::INR,
            month: 1,
            year: 2024,
            due_date: now,
            issued_at: Some(now),
            paid_at: None,
            pdf_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}
