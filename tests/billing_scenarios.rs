//! End-to-end billing scenarios over the pure engine surfaces
//!
//! These exercise the calculator, retry schedule, webhook signatures and
//! alert arithmetic without any live store, mirroring the platform's
//! documented acceptance scenarios.

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use meterflow_billing::{calculate, RateSet};
use meterflow_core::model::{
    BillingConfig, InvoiceStatus, MinimumChargeRule, PaymentStatus, PricingRule, UsageAggregate,
};
use meterflow_core::money::{Currency, Money};
use meterflow_payments::retry::backoff_delay;
use meterflow_payments::service::{plan_transition, TransitionPlan};
use meterflow_payments::webhook::{parse_event, sign, verify_signature, WebhookEvent};
use meterflow_scheduler::alerts::spike_percent;

fn epoch() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

/// Monthly invoice with minimum charge: 1000 api_calls at 0.001 INR,
/// minimum 1000 INR, 18% tax expects subtotal 1.00, adjustment 999.00,
/// tax 180.00 and total 1180.00.
#[test]
fn monthly_invoice_with_minimum_charge() {
    let organisation_id = Uuid::new_v4();
    let aggregates = vec![UsageAggregate {
        id: Uuid::new_v4(),
        organisation_id,
        project_id: Uuid::new_v4(),
        metric_name: "api_calls".to_string(),
        unit: "count".to_string(),
        month: 1,
        year: 2024,
        total_value: Decimal::from(1000),
        event_count: 1000,
        updated_at: Utc::now(),
    }];
    let rules = vec![PricingRule {
        id: Uuid::new_v4(),
        organisation_id: None,
        metric_name: "api_calls".to_string(),
        unit: "count".to_string(),
        price_per_unit: "0.001".parse().unwrap(),
        currency: Currency::INR,
        effective_from: epoch(),
        effective_to: None,
        created_at: epoch(),
    }];
    let minimums = vec![MinimumChargeRule {
        id: Uuid::new_v4(),
        organisation_id: None,
        minimum_amount: Decimal::from(1000),
        currency: Currency::INR,
        effective_from: epoch(),
        effective_to: None,
        created_at: epoch(),
    }];
    let config = BillingConfig {
        organisation_id,
        tax_rate: "0.18".parse().unwrap(),
        currency: Currency::INR,
        payment_terms_days: 30,
        minimum_charge_enabled: true,
        updated_at: Utc::now(),
    };

    let invoice = calculate(&aggregates, &rules, &minimums, &config, &RateSet::default(), 1, 2024)
        .unwrap();

    assert_eq!(invoice.subtotal, "1.00".parse::<Decimal>().unwrap());
    assert_eq!(invoice.subtotal_after_min, Decimal::from(1000));
    assert_eq!(invoice.tax, Decimal::from(180));
    assert_eq!(invoice.total, Decimal::from(1180));
    assert_eq!(invoice.line_items.len(), 2);
    assert_eq!(
        invoice.line_items[1].total,
        "999.00".parse::<Decimal>().unwrap()
    );
    // Invoice arithmetic holds: line totals sum to the tax base
    let line_sum: Decimal = invoice.line_items.iter().map(|l| l.total).sum();
    assert_eq!(line_sum, invoice.subtotal_after_min);
    assert_eq!(invoice.total, invoice.subtotal_after_min + invoice.tax - invoice.discount);
}

/// Retry schedule: max_retries 3, base 24h gives attempts no earlier than
/// T0+24h, then 48h and 96h after each subsequent failure.
#[test]
fn retry_backoff_schedule() {
    let t0 = Utc::now();
    let slots = [
        t0 + backoff_delay(24, 0),
        t0 + backoff_delay(24, 0) + backoff_delay(24, 1),
        t0 + backoff_delay(24, 0) + backoff_delay(24, 1) + backoff_delay(24, 2),
    ];
    assert_eq!(slots[0] - t0, Duration::hours(24));
    assert_eq!(slots[1] - t0, Duration::hours(72));
    assert_eq!(slots[2] - t0, Duration::hours(168));
}

/// Webhook authentication: a bad signature never parses into a transition,
/// and valid replays converge on the same terminal state.
#[test]
fn webhook_signature_and_replay() {
    let secret = "whsec_scenarios";
    let body = serde_json::json!({
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": "pay_X",
                    "order_id": "order_1",
                    "status": "captured",
                    "amount": 118000
                }
            }
        }
    })
    .to_string();

    let signature = sign(secret, body.as_bytes());
    assert!(verify_signature(secret, body.as_bytes(), &signature));
    assert!(!verify_signature(secret, body.as_bytes(), &sign("wrong", body.as_bytes())));

    let WebhookEvent::PaymentCaptured(entity) = parse_event(body.as_bytes()).unwrap() else {
        panic!("expected captured event");
    };
    assert_eq!(entity.amount, 118000);
    assert_eq!(
        Money::from_minor_units(entity.amount, Currency::INR).format_fixed(),
        "1180.00"
    );

    // First delivery applies, the replay is a no-op, and stale deliveries
    // of earlier states stay no-ops
    assert_eq!(
        plan_transition(PaymentStatus::Pending, PaymentStatus::Captured),
        TransitionPlan::Apply
    );
    assert_eq!(
        plan_transition(PaymentStatus::Captured, PaymentStatus::Captured),
        TransitionPlan::Replay
    );
    assert_eq!(
        plan_transition(PaymentStatus::Captured, PaymentStatus::Authorized),
        TransitionPlan::Replay
    );
}

/// Partial then full refund walks the payment through partially_refunded to
/// refunded, and only then may the invoice become refunded.
#[test]
fn refund_progression_states() {
    assert!(PaymentStatus::Captured.can_transition_to(PaymentStatus::PartiallyRefunded));
    assert!(PaymentStatus::PartiallyRefunded.can_transition_to(PaymentStatus::Refunded));
    assert!(!PaymentStatus::Refunded.can_transition_to(PaymentStatus::PartiallyRefunded));
    assert!(InvoiceStatus::Paid.can_transition_to(InvoiceStatus::Refunded));
    assert!(!InvoiceStatus::Refunded.can_transition_to(InvoiceStatus::Paid));
}

/// Spike percentage is undefined at a zero reference and exact otherwise.
#[test]
fn alert_spike_arithmetic() {
    assert_eq!(spike_percent(Decimal::from(100), Decimal::ZERO), None);
    assert_eq!(
        spike_percent(Decimal::from(300), Decimal::from(100)),
        Some(Decimal::from(200))
    );
}
