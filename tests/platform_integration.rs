//! Full-pipeline integration test against a live Postgres instance.
//!
//! Ignored by default; run with a scratch database:
//!
//! ```text
//! METERFLOW_TEST_DATABASE_URL=postgresql://localhost/meterflow_test \
//!     cargo test -- --ignored platform_round_trip
//! ```
//!
//! Walks the documented scenarios end to end: duplicate ingest, migration
//! into the durable store, monthly invoice generation with the minimum
//! charge, concurrent generation yielding one winner, the captured webhook
//! coupling payment and invoice, webhook replays, and a partial-then-full
//! refund settling the invoice as refunded.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use meterflow_billing::{CurrencyService, GeneratedOutcome, InvoiceGenerator};
use meterflow_core::capability::{
    EmailSender, LoggingEmailSender, MemoryObjectStore, ObjectStore, PassthroughPdfRenderer,
    PdfRenderer,
};
use meterflow_core::config::{
    BillingDefaults, DatabaseConfig, GatewayConfig, IngestConfig, MigrationConfig, PdfConfig,
    RetryConfig,
};
use meterflow_core::model::{
    AuthContext, BillingConfig, IngestEvent, IngestOutcome, InvoiceStatus, MinimumChargeRule,
    Organisation, PaymentStatus, PricingRule, Project, RefundStatus,
};
use meterflow_core::money::Currency;
use meterflow_payments::service::WebhookOutcome;
use meterflow_payments::webhook::sign;
use meterflow_payments::{MockGateway, PaymentGateway, PaymentService, RefundService};
use meterflow_pipeline::{hash_api_key, IngestService, MigrationWorker, ProjectKeyCache};
use meterflow_storage::{events, invoices, organisations, payments, pricing, refunds};
use meterflow_storage::{DurableStore, HotEventStore};
use tokio_util::sync::CancellationToken;

const WEBHOOK_SECRET: &str = "whsec_integration";

struct TestPlatform {
    _hot_dir: tempfile::TempDir,
    hot: Arc<HotEventStore>,
    store: DurableStore,
    ingest: Arc<IngestService>,
    migration: MigrationWorker,
    generator: InvoiceGenerator,
    payments: PaymentService,
    refunds: RefundService,
    organisation: Organisation,
    _project: Project,
    api_key: String,
}

async fn setup() -> TestPlatform {
    let url = std::env::var("METERFLOW_TEST_DATABASE_URL")
        .expect("METERFLOW_TEST_DATABASE_URL must point at a scratch database");
    let store = DurableStore::connect(&DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    })
    .await
    .expect("durable store");

    let hot_dir = tempfile::tempdir().unwrap();
    let hot = Arc::new(HotEventStore::open_at(hot_dir.path()).unwrap());

    let now = Utc::now();
    let organisation = Organisation {
        id: Uuid::new_v4(),
        name: format!("Integration Org {}", Uuid::new_v4().simple()),
        currency: Currency::INR,
        gateway_customer_id: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    organisations::insert_organisation(&store, &organisation)
        .await
        .unwrap();
    organisations::upsert_billing_config(
        &store,
        &BillingConfig {
            organisation_id: organisation.id,
            tax_rate: "0.18".parse().unwrap(),
            currency: Currency::INR,
            payment_terms_days: 30,
            minimum_charge_enabled: true,
            updated_at: now,
        },
    )
    .await
    .unwrap();

    let api_key = meterflow_pipeline::generate_api_key();
    let project = Project {
        id: Uuid::new_v4(),
        organisation_id: organisation.id,
        name: "primary".to_string(),
        api_key_hash: hash_api_key(&api_key),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    organisations::insert_project(&store, &project).await.unwrap();

    // Organisation-scoped rules keep parallel test runs independent
    pricing::insert_pricing_rule(
        &store,
        &PricingRule {
            id: Uuid::new_v4(),
            organisation_id: Some(organisation.id),
            metric_name: "api_calls".to_string(),
            unit: "count".to_string(),
            price_per_unit: "0.001".parse().unwrap(),
            currency: Currency::INR,
            effective_from: now - chrono::Duration::days(400),
            effective_to: None,
            created_at: now,
        },
    )
    .await
    .unwrap();
    pricing::insert_minimum_rule(
        &store,
        &MinimumChargeRule {
            id: Uuid::new_v4(),
            organisation_id: Some(organisation.id),
            minimum_amount: Decimal::from(1000),
            currency: Currency::INR,
            effective_from: now - chrono::Duration::days(400),
            effective_to: None,
            created_at: now,
        },
    )
    .await
    .unwrap();

    let keys = Arc::new(ProjectKeyCache::new(store.clone()));
    let (hint_tx, _hint_rx) = tokio::sync::mpsc::channel(64);
    let ingest = Arc::new(IngestService::new(
        Arc::clone(&hot),
        keys,
        IngestConfig::default(),
        hint_tx,
    ));
    let migration = MigrationWorker::new(Arc::clone(&hot), store.clone(), MigrationConfig::default());

    let currency = Arc::new(CurrencyService::new(
        store.clone(),
        meterflow_core::config::ExchangeRateConfig::default(),
    ));
    let email: Arc<dyn EmailSender> = Arc::new(LoggingEmailSender);
    let pdf: Arc<dyn PdfRenderer> = Arc::new(PassthroughPdfRenderer);
    let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::default());
    let generator = InvoiceGenerator::new(
        store.clone(),
        Arc::clone(&currency),
        email,
        pdf,
        objects,
        BillingDefaults::default(),
        PdfConfig::default(),
    );

    let gateway: Arc<dyn PaymentGateway> = Arc::new(MockGateway::new());
    let gateway_config = GatewayConfig {
        webhook_secret: WEBHOOK_SECRET.to_string(),
        ..GatewayConfig::default()
    };
    let payments = PaymentService::new(
        store.clone(),
        Arc::clone(&gateway),
        Arc::clone(&currency),
        gateway_config,
        RetryConfig::default(),
    );
    let refunds = RefundService::new(store.clone(), Arc::clone(&gateway));

    TestPlatform {
        _hot_dir: hot_dir,
        hot,
        store,
        ingest,
        migration,
        generator,
        payments,
        refunds,
        organisation,
        _project: project,
        api_key,
    }
}

fn payment_webhook(event: &str, gateway_payment_id: &str, order_id: &str, amount: i64) -> Vec<u8> {
    serde_json::json!({
        "event": event,
        "payload": {
            "payment": {
                "entity": {
                    "id": gateway_payment_id,
                    "order_id": order_id,
                    "status": event.trim_start_matches("payment."),
                    "amount": amount,
                    "method": "card"
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

fn refund_webhook(event: &str, gateway_refund_id: &str, gateway_payment_id: &str, amount: i64) -> Vec<u8> {
    serde_json::json!({
        "event": event,
        "payload": {
            "refund": {
                "entity": {
                    "id": gateway_refund_id,
                    "payment_id": gateway_payment_id,
                    "amount": amount,
                    "status": event.trim_start_matches("refund.")
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
#[ignore = "requires METERFLOW_TEST_DATABASE_URL"]
async fn platform_round_trip() {
    let platform = setup().await;
    let actor = AuthContext::system("integration-test");
    let now = Utc::now();
    let (month, year) = (now.month(), now.year());

    // --- duplicate ingest -------------------------------------------------
    let event_key = format!("e_{}", Uuid::new_v4().simple());
    let make_event = || IngestEvent {
        event_id: event_key.clone(),
        metric_name: "api_calls".to_string(),
        metric_value: Decimal::from(1000),
        unit: "count".to_string(),
        timestamp: None,
        metadata: Some(HashMap::new()),
    };
    let first = platform.ingest.ingest(&platform.api_key, make_event()).await.unwrap();
    assert_eq!(first, IngestOutcome::Accepted);
    let second = platform.ingest.ingest(&platform.api_key, make_event()).await.unwrap();
    assert_eq!(second, IngestOutcome::Duplicate);

    // --- migration lands the event exactly once ---------------------------
    let cancel = CancellationToken::new();
    let report = platform.migration.run_once(&cancel).await.unwrap();
    assert_eq!(report.migrated, 1);
    assert_eq!(
        events::count_with_key(&platform.store, &event_key).await.unwrap(),
        1
    );
    // A rerun has nothing left to move and never duplicates
    let rerun = platform.migration.run_once(&cancel).await.unwrap();
    assert_eq!(rerun.migrated, 0);
    assert_eq!(
        events::count_with_key(&platform.store, &event_key).await.unwrap(),
        1
    );
    assert_eq!(platform.hot.pending_len(), 0);

    // --- concurrent invoice generation yields one winner ------------------
    let (left, right) = tokio::join!(
        platform
            .generator
            .generate_for_org(platform.organisation.id, month, year, &actor),
        platform
            .generator
            .generate_for_org(platform.organisation.id, month, year, &actor),
    );
    let outcomes = [left.unwrap(), right.unwrap()];
    let created: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, GeneratedOutcome::Created(_)))
        .collect();
    assert_eq!(created.len(), 1, "exactly one generator may win");
    let invoice_id = match &outcomes[0] {
        GeneratedOutcome::Created(invoice) | GeneratedOutcome::Existing(invoice) => invoice.id,
        GeneratedOutcome::NoUsage => panic!("usage was migrated"),
    };
    // The loser may have observed the winner's row pre-finalisation;
    // re-read the committed state
    let invoice = invoices::get(&platform.store, invoice_id).await.unwrap();

    // Minimum charge applied: 1000 calls * 0.001 INR topped up to 1000 + tax
    assert_eq!(invoice.subtotal, "1.00".parse::<Decimal>().unwrap());
    assert_eq!(invoice.subtotal_after_min, Decimal::from(1000));
    assert_eq!(invoice.tax, Decimal::from(180));
    assert_eq!(invoice.total, Decimal::from(1180));
    assert_eq!(invoice.status, InvoiceStatus::Finalized);

    // A later run returns the same invoice
    match platform
        .generator
        .generate_for_org(platform.organisation.id, month, year, &actor)
        .await
        .unwrap()
    {
        GeneratedOutcome::Existing(existing) => assert_eq!(existing.id, invoice.id),
        other => panic!("expected existing invoice, got {other:?}"),
    }

    // --- captured webhook couples payment and invoice ---------------------
    let payment = platform.payments.create_order(invoice.id, &actor).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    // Order creation is idempotent per invoice
    let same = platform.payments.create_order(invoice.id, &actor).await.unwrap();
    assert_eq!(same.id, payment.id);

    let gateway_payment_id = format!("pay_{}", Uuid::new_v4().simple());
    let captured = payment_webhook(
        "payment.captured",
        &gateway_payment_id,
        &payment.gateway_order_id,
        118_000,
    );
    let outcome = platform
        .payments
        .handle_webhook(&captured, &sign(WEBHOOK_SECRET, &captured))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let paid_invoice = invoices::get(&platform.store, invoice.id).await.unwrap();
    assert_eq!(paid_invoice.status, InvoiceStatus::Paid);
    let captured_payment = payments::get(&platform.store, payment.id).await.unwrap();
    assert_eq!(captured_payment.status, PaymentStatus::Captured);
    assert!(captured_payment.paid_at.is_some());

    // Replaying the same delivery changes nothing
    let replay = platform
        .payments
        .handle_webhook(&captured, &sign(WEBHOOK_SECRET, &captured))
        .await
        .unwrap();
    assert_eq!(replay, WebhookOutcome::Replayed);

    // A bad signature is rejected outright
    assert!(platform
        .payments
        .handle_webhook(&captured, "deadbeef")
        .await
        .is_err());

    // --- partial then full refund -----------------------------------------
    let partial = platform
        .refunds
        .refund(
            payment.id,
            Some("472.00".parse().unwrap()),
            Some("customer request".to_string()),
            "req-partial",
            &actor,
        )
        .await
        .unwrap();
    let partial_gateway_id = partial.gateway_refund_id.clone().unwrap();
    let body = refund_webhook("refund.processed", &partial_gateway_id, &gateway_payment_id, 47_200);
    platform
        .payments
        .handle_webhook(&body, &sign(WEBHOOK_SECRET, &body))
        .await
        .unwrap();

    let after_partial = payments::get(&platform.store, payment.id).await.unwrap();
    assert_eq!(after_partial.status, PaymentStatus::PartiallyRefunded);
    assert_eq!(
        invoices::get(&platform.store, invoice.id).await.unwrap().status,
        InvoiceStatus::Paid,
        "invoice only becomes refunded once fully returned"
    );

    let remainder = platform
        .refunds
        .refund(payment.id, None, None, "req-remainder", &actor)
        .await
        .unwrap();
    assert_eq!(remainder.amount, "708.00".parse::<Decimal>().unwrap());
    let remainder_gateway_id = remainder.gateway_refund_id.clone().unwrap();
    let body = refund_webhook(
        "refund.processed",
        &remainder_gateway_id,
        &gateway_payment_id,
        70_800,
    );
    platform
        .payments
        .handle_webhook(&body, &sign(WEBHOOK_SECRET, &body))
        .await
        .unwrap();

    let settled = payments::get(&platform.store, payment.id).await.unwrap();
    assert_eq!(settled.status, PaymentStatus::Refunded);
    assert_eq!(
        invoices::get(&platform.store, invoice.id).await.unwrap().status,
        InvoiceStatus::Refunded
    );
    let all_refunds = refunds::list_for_payment(&platform.store, payment.id).await.unwrap();
    assert_eq!(all_refunds.len(), 2);
    assert!(all_refunds.iter().all(|r| r.status == RefundStatus::Processed));
}

#[tokio::test]
#[ignore = "requires METERFLOW_TEST_DATABASE_URL"]
async fn finalized_invoices_reject_financial_mutation() {
    let platform = setup().await;
    let actor = AuthContext::system("integration-test");
    let now = Utc::now();

    let event = IngestEvent {
        event_id: format!("imm_{}", Uuid::new_v4().simple()),
        metric_name: "api_calls".to_string(),
        metric_value: Decimal::from(500),
        unit: "count".to_string(),
        timestamp: None,
        metadata: None,
    };
    platform.ingest.ingest(&platform.api_key, event).await.unwrap();
    platform
        .migration
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    let GeneratedOutcome::Created(invoice) = platform
        .generator
        .generate_for_org(platform.organisation.id, now.month(), now.year(), &actor)
        .await
        .unwrap()
    else {
        panic!("expected a fresh invoice");
    };

    // The immutability trigger rejects any financial mutation post-draft
    let result = sqlx::query("UPDATE invoices SET total = total + 1 WHERE id = $1")
        .bind(invoice.id)
        .execute(platform.store.pool())
        .await;
    assert!(result.is_err(), "finalized financial fields must be locked");
}
