//! Invoice generator
//!
//! Orchestrates the pure calculator: fetches aggregates, rules, config and a
//! rate snapshot, calculates, re-validates the arithmetic, persists invoice
//! plus line items plus audit log in one transaction under the idempotency
//! key `invoice_{org}_{year}_{month}`, finalises, and schedules the PDF and
//! email side-effects. Per-organisation failures in the monthly sweep are
//! isolated so one bad tenant never blocks the rest.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use meterflow_core::capability::{EmailMessage, EmailSender, ObjectStore, PdfRenderer};
use meterflow_core::config::{BillingDefaults, PdfConfig};
use meterflow_core::errors::{BillingError, BillingResult, StoreError};
use meterflow_core::model::{
    AuditLogEntry, AuthContext, BillingConfig, CalculatedInvoice, Invoice, InvoiceId,
    InvoiceLineItem, InvoiceStatus, OrganisationId,
};
use meterflow_core::money::Currency;
use meterflow_core::observability;
use meterflow_storage::{
    aggregates, audit, idempotency, invoices, notifications, organisations, pricing,
    DurableStore, IdempotencyOutcome,
};

use crate::calculator;
use crate::currency::CurrencyService;

/// Result of one organisation's generation attempt
#[derive(Debug)]
pub enum GeneratedOutcome {
    /// A new invoice was created and finalised
    Created(Invoice),
    /// A prior run already owns the period; its invoice is returned
    Existing(Invoice),
    /// The organisation had no usage in the period
    NoUsage,
}

/// Summary of a monthly sweep across organisations
#[derive(Debug, Default)]
pub struct SweepReport {
    pub created: usize,
    pub existing: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct InvoiceGenerator {
    store: DurableStore,
    currency: Arc<CurrencyService>,
    email: Arc<dyn EmailSender>,
    pdf: Arc<dyn PdfRenderer>,
    objects: Arc<dyn ObjectStore>,
    defaults: BillingDefaults,
    pdf_config: PdfConfig,
}

impl InvoiceGenerator {
    pub fn new(
        store: DurableStore,
        currency: Arc<CurrencyService>,
        email: Arc<dyn EmailSender>,
        pdf: Arc<dyn PdfRenderer>,
        objects: Arc<dyn ObjectStore>,
        defaults: BillingDefaults,
        pdf_config: PdfConfig,
    ) -> Self {
        Self {
            store,
            currency,
            email,
            pdf,
            objects,
            defaults,
            pdf_config,
        }
    }

    /// Generate invoices for every organisation with usage in the period.
    /// Per-organisation errors are logged and counted, not propagated.
    pub async fn generate_for_month(
        &self,
        month: u32,
        year: i32,
        actor: &AuthContext,
    ) -> BillingResult<SweepReport> {
        let organisation_ids = aggregates::organisations_with_usage(&self.store, month, year).await?;
        let mut report = SweepReport::default();
        for organisation_id in organisation_ids {
            match self.generate_for_org(organisation_id, month, year, actor).await {
                Ok(GeneratedOutcome::Created(invoice)) => {
                    info!(%organisation_id, invoice = %invoice.invoice_number, "invoice generated");
                    report.created += 1;
                }
                Ok(GeneratedOutcome::Existing(_)) => report.existing += 1,
                Ok(GeneratedOutcome::NoUsage) => report.skipped += 1,
                Err(e) => {
                    observability::record_invoice_failed();
                    error!(%organisation_id, month, year, "invoice generation failed: {e}");
                    report.failed += 1;
                }
            }
        }
        info!(
            month,
            year,
            created = report.created,
            existing = report.existing,
            skipped = report.skipped,
            failed = report.failed,
            "monthly invoice sweep complete"
        );
        Ok(report)
    }

    /// Generate one organisation's invoice for a period. Concurrent calls
    /// for the same `(org, month, year)` yield one winner; the others
    /// receive the winner's invoice via the idempotency registry.
    pub async fn generate_for_org(
        &self,
        organisation_id: OrganisationId,
        month: u32,
        year: i32,
        actor: &AuthContext,
    ) -> BillingResult<GeneratedOutcome> {
        let period_aggregates =
            aggregates::list_for_org_period(&self.store, organisation_id, month, year).await?;
        if period_aggregates.is_empty() {
            return Ok(GeneratedOutcome::NoUsage);
        }

        let billing_config = self.billing_config_for(organisation_id).await?;
        let (_, period_end) = calculator::billing_period(month, year)?;
        let billing_date = period_end - chrono::Duration::seconds(1);
        let pricing_rules =
            pricing::effective_pricing_rules(&self.store, organisation_id, billing_date).await?;
        let minimum_rules =
            pricing::effective_minimum_rules(&self.store, organisation_id, billing_date).await?;
        let rate_set = self.currency.snapshot().await?;

        let calculated = calculator::calculate(
            &period_aggregates,
            &pricing_rules,
            &minimum_rules,
            &billing_config,
            &rate_set,
            month,
            year,
        )?;

        if !calculated.unpriced_metrics.is_empty() {
            let names: Vec<&str> = calculated
                .unpriced_metrics
                .iter()
                .map(|m| m.metric_name.as_str())
                .collect();
            return Err(BillingError::UnpricedMetric {
                metric: names.join(", "),
                unit: String::new(),
                at: billing_date.to_rfc3339(),
            });
        }

        validate_calculation(&calculated)?;

        let invoice_number = self.next_invoice_number(organisation_id, month, year).await?;
        let key = format!("invoice_{organisation_id}_{year}_{month}");
        let invoice = build_invoice(&calculated, invoice_number);
        let lines = build_line_items(&invoice.id, &calculated);
        let audit_entry = audit_row(&invoice, actor);

        let outcome = idempotency::with_idempotency(&self.store, &key, "invoice", |tx| {
            let invoice = invoice.clone();
            let lines = lines.clone();
            let audit_entry = audit_entry.clone();
            Box::pin(async move {
                invoices::insert_with_lines(tx, &invoice, &lines).await?;
                audit::append(tx, &audit_entry).await?;
                let id = invoice.id.to_string();
                Ok((invoice, id))
            })
        })
        .await;

        let invoice = match outcome {
            Ok(IdempotencyOutcome::Created(invoice)) => invoice,
            Ok(IdempotencyOutcome::Existing { entity_id }) => {
                let existing_id: InvoiceId = entity_id
                    .parse()
                    .map_err(|_| StoreError::Decode(format!("invoice id {entity_id}")))?;
                let existing = invoices::get(&self.store, existing_id).await?;
                return Ok(GeneratedOutcome::Existing(existing));
            }
            // The period constraint fired before the registry row: another
            // generator committed between our snapshot and insert
            Err(StoreError::Database(e)) if meterflow_storage::store::is_unique_violation(&e) => {
                if let Some(existing) =
                    invoices::find_for_period(&self.store, organisation_id, month, year).await?
                {
                    return Ok(GeneratedOutcome::Existing(existing));
                }
                return Err(BillingError::Store(StoreError::Database(e)));
            }
            Err(e) => return Err(BillingError::Store(e)),
        };

        let finalized = self.finalize(invoice.id).await?;
        observability::record_invoice_generated();

        self.schedule_side_effects(&finalized).await;
        Ok(GeneratedOutcome::Created(finalized))
    }

    /// Finalisation locks the financial fields; the store trigger enforces
    /// it from here on.
    async fn finalize(&self, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        let mut tx = self.store.begin().await?;
        let finalized =
            invoices::transition_status(&mut tx, invoice_id, InvoiceStatus::Finalized, None)
                .await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(finalized)
    }

    async fn billing_config_for(
        &self,
        organisation_id: OrganisationId,
    ) -> BillingResult<BillingConfig> {
        if let Some(config) = organisations::get_billing_config(&self.store, organisation_id).await? {
            return Ok(config);
        }
        // Fall back to platform defaults for organisations never configured
        let currency = Currency::parse(&self.defaults.currency)
            .map_err(|e| BillingError::Store(StoreError::Decode(e.to_string())))?;
        let tax_rate: Decimal = self
            .defaults
            .tax_rate
            .parse()
            .map_err(|_| BillingError::Store(StoreError::Decode("default tax rate".into())))?;
        Ok(BillingConfig {
            organisation_id,
            tax_rate,
            currency,
            payment_terms_days: self.defaults.payment_terms_days,
            minimum_charge_enabled: self.defaults.minimum_charge_enabled,
            updated_at: Utc::now(),
        })
    }

    async fn next_invoice_number(
        &self,
        organisation_id: OrganisationId,
        month: u32,
        year: i32,
    ) -> BillingResult<String> {
        let sequence = invoices::count_for_org(&self.store, organisation_id).await? + 1;
        Ok(format!(
            "INV-{}-{year}{month:02}-{sequence:04}",
            organisations::short_org_code(organisation_id)
        ))
    }

    /// PDF rendering, storage and the issued email. Failures here never
    /// unwind the committed invoice; they are logged and retried by hand.
    async fn schedule_side_effects(&self, invoice: &Invoice) {
        if self.pdf_config.enabled {
            match self.render_and_store_pdf(invoice).await {
                Ok(url) => {
                    if let Err(e) = invoices::set_pdf_url(&self.store, invoice.id, &url).await {
                        warn!(invoice = %invoice.invoice_number, "failed to record pdf url: {e}");
                    }
                }
                Err(e) => warn!(invoice = %invoice.invoice_number, "pdf rendering failed: {e}"),
            }
        }

        let message = EmailMessage {
            to: format!("billing+{}@organisation.invalid", invoice.organisation_id),
            subject: format!("Invoice {} issued", invoice.invoice_number),
            body: format!(
                "Invoice {} for {}-{:02} totalling {} {} is due on {}.",
                invoice.invoice_number,
                invoice.year,
                invoice.month,
                invoice.total,
                invoice.currency,
                invoice.due_date.date_naive()
            ),
            kind: "invoice_issued".to_string(),
        };
        let delivered = self.email.send(&message).await;
        observability::record_email(delivered.is_ok());
        let error = delivered.as_ref().err().map(|e| e.to_string());
        if let Err(e) = notifications::record_delivery(
            &self.store,
            Some(invoice.organisation_id),
            &message.to,
            &message.subject,
            &message.body,
            &message.kind,
            delivered.is_ok(),
            error.as_deref(),
        )
        .await
        {
            warn!("failed to record invoice email: {e}");
        }
    }

    async fn render_and_store_pdf(&self, invoice: &Invoice) -> BillingResult<String> {
        let lines = invoices::lines_for(&self.store, invoice.id).await?;
        let html = render_invoice_html(invoice, &lines);
        let bytes = self
            .pdf
            .render_html(&html)
            .await
            .map_err(|e| BillingError::Store(StoreError::Decode(e.to_string())))?;
        let object_key = format!(
            "{}/{}/{}.pdf",
            self.pdf_config.bucket, invoice.organisation_id, invoice.invoice_number
        );
        self.objects
            .put(&object_key, bytes, "application/pdf")
            .await
            .map_err(|e| BillingError::Store(StoreError::Decode(e.to_string())))
    }
}

/// Recompute the invoice arithmetic from its parts and reject any mismatch
/// beyond one minor unit per line. A failure here aborts the invoice before
/// anything is written.
pub fn validate_calculation(calculated: &CalculatedInvoice) -> BillingResult<()> {
    let line_sum: Decimal = calculated.line_items.iter().map(|l| l.total).sum();
    let scale = calculated.currency.minor_unit_scale();
    let minor_unit = Decimal::new(1, scale);
    let epsilon = minor_unit * Decimal::from(calculated.line_items.len().max(1) as i64);

    if (line_sum - calculated.subtotal_after_min).abs() > epsilon {
        return Err(BillingError::CalculationMismatch {
            field: "subtotal",
            calculated: calculated.subtotal_after_min.to_string(),
            recomputed: line_sum.to_string(),
        });
    }

    let recomputed_total = calculated.subtotal_after_min + calculated.tax - calculated.discount;
    if (recomputed_total - calculated.total).abs() > epsilon {
        return Err(BillingError::CalculationMismatch {
            field: "total",
            calculated: calculated.total.to_string(),
            recomputed: recomputed_total.to_string(),
        });
    }

    for line in &calculated.line_items {
        let expected = line.quantity * line.unit_price;
        if (expected - line.total).abs() > minor_unit {
            return Err(BillingError::CalculationMismatch {
                field: "line_total",
                calculated: line.total.to_string(),
                recomputed: expected.to_string(),
            });
        }
    }
    Ok(())
}

fn build_invoice(calculated: &CalculatedInvoice, invoice_number: String) -> Invoice {
    let now = Utc::now();
    Invoice {
        id: Uuid::new_v4(),
        organisation_id: calculated.organisation_id,
        invoice_number,
        status: InvoiceStatus::Draft,
        subtotal: calculated.subtotal,
        subtotal_after_min: calculated.subtotal_after_min,
        tax: calculated.tax,
        discount: calculated.discount,
        total: calculated.total,
        currency: calculated.currency,
        month: calculated.month,
        year: calculated.year,
        due_date: calculated.due_date,
        issued_at: None,
        paid_at: None,
        pdf_url: None,
        created_at: now,
        updated_at: now,
    }
}

fn build_line_items(invoice_id: &InvoiceId, calculated: &CalculatedInvoice) -> Vec<InvoiceLineItem> {
    calculated
        .line_items
        .iter()
        .map(|line| InvoiceLineItem {
            id: Uuid::new_v4(),
            invoice_id: *invoice_id,
            line_number: line.line_number,
            description: line.description.clone(),
            metric_name: line.metric_name.clone(),
            unit: line.unit.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            total: line.total,
            metadata: line.metadata.clone(),
        })
        .collect()
}

fn audit_row(invoice: &Invoice, actor: &AuthContext) -> AuditLogEntry {
    AuditLogEntry {
        id: Uuid::new_v4(),
        entity_type: "invoice".to_string(),
        entity_id: invoice.id.to_string(),
        action: "generated".to_string(),
        actor: actor.actor.clone(),
        before: None,
        after: serde_json::to_value(invoice).ok(),
        ip_address: actor.ip_address.clone(),
        user_agent: actor.user_agent.clone(),
        created_at: Utc::now(),
    }
}

fn render_invoice_html(invoice: &Invoice, lines: &[InvoiceLineItem]) -> String {
    let mut rows = String::new();
    for line in lines {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            line.description, line.quantity, line.unit_price, line.total
        ));
    }
    format!(
        r#"<html><body>
<h1>Invoice {number}</h1>
<p>Period: {year}-{month:02}</p>
<table>{rows}</table>
<p>Subtotal: {subtotal} {currency}</p>
<p>Tax: {tax} {currency}</p>
<p>Total: {total} {currency}</p>
<p>Due: {due}</p>
</body></html>"#,
        number = invoice.invoice_number,
        year = invoice.year,
        month = invoice.month,
        rows = rows,
        subtotal = invoice.subtotal,
        tax = invoice.tax,
        total = invoice.total,
        currency = invoice.currency,
        due = invoice.due_date.date_naive(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use meterflow_core::money::Currency;

    fn calculated() -> CalculatedInvoice {
        CalculatedInvoice {
            organisation_id: Uuid::new_v4(),
            currency: Currency::INR,
            month: 1,
            year: 2024,
            line_items: vec![
                CalculatedLineItem {
                    line_number: 1,
                    description: "api_calls (count)".to_string(),
                    metric_name: Some("api_calls".to_string()),
                    unit: Some("count".to_string()),
                    quantity: "1000".parse().unwrap(),
                    unit_price: "0.001".parse().unwrap(),
                    total: "1.00".parse().unwrap(),
                    metadata: None,
                },
                CalculatedLineItem {
                    line_number: 2,
                    description: "Minimum charge adjustment".to_string(),
                    metric_name: None,
                    unit: None,
                    quantity: Decimal::ONE,
                    unit_price: "999.00".parse().unwrap(),
                    total: "999.00".parse().unwrap(),
                    metadata: None,
                },
            ],
            subtotal: "1.00".parse().unwrap(),
            subtotal_after_min: "1000.00".parse().unwrap(),
            tax: "180.00".parse().unwrap(),
            discount: Decimal::ZERO,
            total: "1180.00".parse().unwrap(),
            period_start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            period_end: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            due_date: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
            unpriced_metrics: vec![],
        }
    }

    use meterflow_core::model::CalculatedLineItem;

    #[test]
    fn validation_gate_accepts_consistent_invoices() {
        assert!(validate_calculation(&calculated()).is_ok());
    }

    #[test]
    fn validation_gate_rejects_tampered_totals() {
        let mut bad = calculated();
        bad.total = "1300.00".parse().unwrap();
        match validate_calculation(&bad) {
            Err(BillingError::CalculationMismatch { field, .. }) => assert_eq!(field, "total"),
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn validation_gate_rejects_line_sums_off_by_more_than_epsilon() {
        let mut bad = calculated();
        bad.line_items[1].total = "900.00".parse().unwrap();
        match validate_calculation(&bad) {
            Err(BillingError::CalculationMismatch { .. }) => {}
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn invoice_rows_inherit_the_calculated_fields() {
        let calc = calculated();
        let invoice = build_invoice(&calc, "INV-TEST-202401-0001".to_string());
        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.total, calc.total);
        assert_eq!(invoice.month, 1);
        let lines = build_line_items(&invoice.id, &calc);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.invoice_id == invoice.id));
        assert_eq!(lines[1].description, "Minimum charge adjustment");
    }
}
