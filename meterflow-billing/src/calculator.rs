//! Pure billing calculator
//!
//! `calculate` folds monthly aggregates, effective pricing rules, the
//! minimum-charge rule and the organisation's billing config into a
//! `CalculatedInvoice`. No I/O, no handles: exchange rates arrive as a
//! pre-fetched [`RateSet`] snapshot, so identical inputs produce identical
//! output byte for byte. All monetary arithmetic goes through the money
//! kernel; tax rounds half-even at the billing currency's scale.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use meterflow_core::errors::{BillingError, BillingResult};
use meterflow_core::model::{
    BillingConfig, CalculatedInvoice, CalculatedLineItem, MinimumChargeRule, PricingRule,
    UnpricedMetric, UsageAggregate,
};
use meterflow_core::money::Money;

use crate::currency::RateSet;

/// First and one-past-last instant of a `(month, year)` period in UTC.
pub fn billing_period(month: u32, year: i32) -> BillingResult<(DateTime<Utc>, DateTime<Utc>)> {
    if !(1..=12).contains(&month) {
        return Err(BillingError::InvalidPeriod { month });
    }
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or(BillingError::InvalidPeriod { month })?;
    let (next_month, next_year) = if month == 12 { (1, year + 1) } else { (month + 1, year) };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .ok_or(BillingError::InvalidPeriod { month })?;
    Ok((start, end))
}

/// The pricing rule effective at `at` for a metric: organisation-specific
/// rules beat global ones, and within equal precedence the latest
/// `effective_from` wins.
fn select_pricing_rule<'r>(
    rules: &'r [PricingRule],
    metric_name: &str,
    unit: &str,
    at: DateTime<Utc>,
) -> Option<&'r PricingRule> {
    let candidates = rules.iter().filter(|r| {
        r.metric_name == metric_name
            && r.unit == unit
            && r.effective_from <= at
            && r.effective_to.map_or(true, |to| to > at)
    });
    candidates.max_by_key(|r| (r.organisation_id.is_some(), r.effective_from))
}

fn select_minimum_rule(
    rules: &[MinimumChargeRule],
    at: DateTime<Utc>,
) -> Option<&MinimumChargeRule> {
    rules
        .iter()
        .filter(|r| r.effective_from <= at && r.effective_to.map_or(true, |to| to > at))
        .max_by_key(|r| (r.organisation_id.is_some(), r.effective_from))
}

/// Calculate one organisation's invoice for a period. Aggregates without an
/// effective pricing rule are skipped and recorded in `unpriced_metrics`.
pub fn calculate(
    aggregates: &[UsageAggregate],
    pricing_rules: &[PricingRule],
    minimum_rules: &[MinimumChargeRule],
    billing_config: &BillingConfig,
    rate_set: &RateSet,
    month: u32,
    year: i32,
) -> BillingResult<CalculatedInvoice> {
    let (period_start, period_end) = billing_period(month, year)?;
    // Rules are resolved as of the last instant of the period
    let billing_date = period_end - chrono::Duration::seconds(1);
    let currency = billing_config.currency;

    // Deterministic line ordering regardless of fetch order
    let mut ordered: Vec<&UsageAggregate> = aggregates.iter().collect();
    ordered.sort_by(|a, b| {
        (a.project_id, &a.metric_name, &a.unit).cmp(&(b.project_id, &b.metric_name, &b.unit))
    });

    let mut line_items = Vec::new();
    let mut unpriced_metrics = Vec::new();
    let mut subtotal = Money::zero(currency);
    let mut line_number = 1;

    for aggregate in ordered {
        let Some(rule) =
            select_pricing_rule(pricing_rules, &aggregate.metric_name, &aggregate.unit, billing_date)
        else {
            unpriced_metrics.push(UnpricedMetric {
                metric_name: aggregate.metric_name.clone(),
                unit: aggregate.unit.clone(),
                total_value: aggregate.total_value,
            });
            continue;
        };

        let quantity = aggregate.total_value;
        let native_total = Money::new(rule.price_per_unit, rule.currency).checked_mul(quantity)?;

        let (unit_price, total, metadata) = if rule.currency == currency {
            (rule.price_per_unit, native_total.rounded(), None)
        } else {
            let rate = rate_set.rate(rule.currency, currency, billing_date)?;
            let converted_unit_price = rule
                .price_per_unit
                .checked_mul(rate)
                .ok_or_else(|| BillingError::CalculationMismatch {
                    field: "unit_price",
                    calculated: rule.price_per_unit.to_string(),
                    recomputed: rate.to_string(),
                })?;
            let converted_total = rate_set.convert(native_total, currency, billing_date)?;
            let metadata = serde_json::json!({
                "original_currency": rule.currency.as_str(),
                "original_unit_price": rule.price_per_unit.to_string(),
                "original_total": native_total.format_fixed(),
                "exchange_rate": rate.to_string(),
            });
            (converted_unit_price, converted_total.rounded(), Some(metadata))
        };

        subtotal = subtotal.checked_add(&total)?;
        line_items.push(CalculatedLineItem {
            line_number,
            description: format!("{} ({})", aggregate.metric_name, aggregate.unit),
            metric_name: Some(aggregate.metric_name.clone()),
            unit: Some(aggregate.unit.clone()),
            quantity,
            unit_price,
            total: total.amount(),
            metadata,
        });
        line_number += 1;
    }

    // Minimum charge tops the subtotal up to the configured floor
    let mut subtotal_after_min = subtotal;
    if billing_config.minimum_charge_enabled {
        if let Some(minimum) = select_minimum_rule(minimum_rules, billing_date) {
            let floor = rate_set.convert(
                Money::new(minimum.minimum_amount, minimum.currency),
                currency,
                billing_date,
            )?;
            if subtotal.try_cmp(&floor)? == std::cmp::Ordering::Less {
                let adjustment = floor.checked_sub(&subtotal)?.rounded();
                line_items.push(CalculatedLineItem {
                    line_number,
                    description: "Minimum charge adjustment".to_string(),
                    metric_name: None,
                    unit: None,
                    quantity: Decimal::ONE,
                    unit_price: adjustment.amount(),
                    total: adjustment.amount(),
                    metadata: Some(serde_json::json!({
                        "minimum_amount": floor.format_fixed(),
                        "usage_subtotal": subtotal.format_fixed(),
                    })),
                });
                subtotal_after_min = subtotal.checked_add(&adjustment)?;
            }
        }
    }

    let tax = subtotal_after_min
        .checked_mul(billing_config.tax_rate)?
        .rounded();
    let discount = Money::zero(currency);
    let total = subtotal_after_min.checked_add(&tax)?.checked_sub(&discount)?;

    let due_date = period_end + chrono::Duration::days(billing_config.payment_terms_days as i64);

    Ok(CalculatedInvoice {
        organisation_id: billing_config.organisation_id,
        currency,
        month,
        year,
        line_items,
        subtotal: subtotal.rounded().amount(),
        subtotal_after_min: subtotal_after_min.rounded().amount(),
        tax: tax.amount(),
        discount: discount.amount(),
        total: total.rounded().amount(),
        period_start,
        period_end,
        due_date,
        unpriced_metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use meterflow_core::money::Currency;
    use uuid::Uuid;

    fn aggregate(metric: &str, unit: &str, total: &str) -> UsageAggregate {
        UsageAggregate {
            id: Uuid::new_v4(),
            organisation_id: Uuid::nil(),
            project_id: Uuid::nil(),
            metric_name: metric.to_string(),
            unit: unit.to_string(),
            month: 1,
            year: 2024,
            total_value: total.parse().unwrap(),
            event_count: 1,
            updated_at: Utc::now(),
        }
    }

    fn rule(
        org: Option<Uuid>,
        metric: &str,
        unit: &str,
        price: &str,
        currency: Currency,
        from: DateTime<Utc>,
    ) -> PricingRule {
        PricingRule {
            id: Uuid::new_v4(),
            organisation_id: org,
            metric_name: metric.to_string(),
            unit: unit.to_string(),
            price_per_unit: price.parse().unwrap(),
            currency,
            effective_from: from,
            effective_to: None,
            created_at: from,
        }
    }

    fn config(tax_rate: &str) -> BillingConfig {
        BillingConfig {
            organisation_id: Uuid::nil(),
            tax_rate: tax_rate.parse().unwrap(),
            currency: Currency::INR,
            payment_terms_days: 30,
            minimum_charge_enabled: true,
            updated_at: Utc::now(),
        }
    }

    fn minimum(amount: &str, from: DateTime<Utc>) -> MinimumChargeRule {
        MinimumChargeRule {
            id: Uuid::new_v4(),
            organisation_id: None,
            minimum_amount: amount.parse().unwrap(),
            currency: Currency::INR,
            effective_from: from,
            effective_to: None,
            created_at: from,
        }
    }

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn monthly_invoice_with_minimum_charge() {
        // 1000 api_calls at 0.001 INR, minimum 1000 INR, 18% tax
        let aggregates = vec![aggregate("api_calls", "count", "1000")];
        let rules = vec![rule(None, "api_calls", "count", "0.001", Currency::INR, epoch())];
        let minimums = vec![minimum("1000", epoch())];
        let invoice = calculate(
            &aggregates,
            &rules,
            &minimums,
            &config("0.18"),
            &RateSet::default(),
            1,
            2024,
        )
        .unwrap();

        assert_eq!(invoice.subtotal, "1.00".parse::<Decimal>().unwrap());
        assert_eq!(invoice.subtotal_after_min, "1000.00".parse::<Decimal>().unwrap());
        assert_eq!(invoice.tax, "180.00".parse::<Decimal>().unwrap());
        assert_eq!(invoice.total, "1180.00".parse::<Decimal>().unwrap());
        assert_eq!(invoice.line_items.len(), 2);
        let adjustment = &invoice.line_items[1];
        assert_eq!(adjustment.description, "Minimum charge adjustment");
        assert_eq!(adjustment.total, "999.00".parse::<Decimal>().unwrap());
    }

    #[test]
    fn no_minimum_line_when_subtotal_clears_the_floor() {
        let aggregates = vec![aggregate("api_calls", "count", "2000000")];
        let rules = vec![rule(None, "api_calls", "count", "0.001", Currency::INR, epoch())];
        let minimums = vec![minimum("1000", epoch())];
        let invoice = calculate(
            &aggregates,
            &rules,
            &minimums,
            &config("0.18"),
            &RateSet::default(),
            1,
            2024,
        )
        .unwrap();
        assert_eq!(invoice.line_items.len(), 1);
        assert_eq!(invoice.subtotal, invoice.subtotal_after_min);
        assert_eq!(invoice.subtotal, "2000.00".parse::<Decimal>().unwrap());
    }

    #[test]
    fn minimum_charge_respects_the_config_switch() {
        let aggregates = vec![aggregate("api_calls", "count", "1")];
        let rules = vec![rule(None, "api_calls", "count", "0.001", Currency::INR, epoch())];
        let minimums = vec![minimum("1000", epoch())];
        let mut cfg = config("0.18");
        cfg.minimum_charge_enabled = false;
        let invoice = calculate(
            &aggregates,
            &rules,
            &minimums,
            &cfg,
            &RateSet::default(),
            1,
            2024,
        )
        .unwrap();
        assert_eq!(invoice.line_items.len(), 1);
        assert_eq!(invoice.subtotal, invoice.subtotal_after_min);
    }

    #[test]
    fn organisation_rules_override_global_ones() {
        let org = Uuid::new_v4();
        let mut cfg = config("0");
        cfg.organisation_id = org;
        let aggregates = vec![aggregate("api_calls", "count", "100")];
        let rules = vec![
            rule(None, "api_calls", "count", "0.10", Currency::INR, epoch()),
            rule(Some(org), "api_calls", "count", "0.05", Currency::INR, epoch()),
        ];
        let invoice = calculate(
            &aggregates,
            &rules,
            &[],
            &cfg,
            &RateSet::default(),
            1,
            2024,
        )
        .unwrap();
        assert_eq!(invoice.subtotal, "5.00".parse::<Decimal>().unwrap());
    }

    #[test]
    fn latest_effective_rule_wins_within_precedence() {
        let aggregates = vec![aggregate("api_calls", "count", "100")];
        let rules = vec![
            rule(None, "api_calls", "count", "0.10", Currency::INR, epoch()),
            rule(
                None,
                "api_calls",
                "count",
                "0.20",
                Currency::INR,
                epoch() + Duration::days(365),
            ),
        ];
        let invoice = calculate(
            &aggregates,
            &rules,
            &[],
            &config("0"),
            &RateSet::default(),
            1,
            2024,
        )
        .unwrap();
        assert_eq!(invoice.subtotal, "20.00".parse::<Decimal>().unwrap());
    }

    #[test]
    fn rules_effective_after_the_period_do_not_apply() {
        let aggregates = vec![aggregate("api_calls", "count", "100")];
        let rules = vec![rule(
            None,
            "api_calls",
            "count",
            "0.10",
            Currency::INR,
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )];
        let invoice = calculate(
            &aggregates,
            &rules,
            &[],
            &config("0"),
            &RateSet::default(),
            1,
            2024,
        )
        .unwrap();
        assert!(invoice.line_items.is_empty());
        assert_eq!(invoice.unpriced_metrics.len(), 1);
    }

    #[test]
    fn unpriced_metrics_are_recorded_not_dropped() {
        let aggregates = vec![
            aggregate("api_calls", "count", "100"),
            aggregate("gpu_seconds", "seconds", "50"),
        ];
        let rules = vec![rule(None, "api_calls", "count", "0.10", Currency::INR, epoch())];
        let invoice = calculate(
            &aggregates,
            &rules,
            &[],
            &config("0"),
            &RateSet::default(),
            1,
            2024,
        )
        .unwrap();
        assert_eq!(invoice.line_items.len(), 1);
        assert_eq!(invoice.unpriced_metrics.len(), 1);
        assert_eq!(invoice.unpriced_metrics[0].metric_name, "gpu_seconds");
    }

    #[test]
    fn cross_currency_lines_convert_and_keep_originals() {
        let aggregates = vec![aggregate("api_calls", "count", "1000")];
        let rules = vec![rule(None, "api_calls", "count", "0.01", Currency::USD, epoch())];
        let rates = RateSet::new(vec![ExchangeRateFixture::usd_inr("80", epoch())]);
        let invoice = calculate(
            &aggregates,
            &rules,
            &[],
            &config("0"),
            &rates,
            1,
            2024,
        )
        .unwrap();
        // 1000 * 0.01 USD = 10 USD = 800 INR
        assert_eq!(invoice.subtotal, "800.00".parse::<Decimal>().unwrap());
        let line = &invoice.line_items[0];
        let metadata = line.metadata.as_ref().unwrap();
        assert_eq!(metadata["original_currency"], "USD");
        assert_eq!(metadata["original_total"], "10.00");
    }

    #[test]
    fn missing_rate_fails_the_calculation() {
        let aggregates = vec![aggregate("api_calls", "count", "1000")];
        let rules = vec![rule(None, "api_calls", "count", "0.01", Currency::USD, epoch())];
        let result = calculate(
            &aggregates,
            &rules,
            &[],
            &config("0"),
            &RateSet::default(),
            1,
            2024,
        );
        assert!(matches!(
            result,
            Err(BillingError::Currency(
                meterflow_core::errors::CurrencyError::MissingRate { .. }
            ))
        ));
    }

    #[test]
    fn identical_inputs_give_identical_outputs() {
        let aggregates = vec![
            aggregate("api_calls", "count", "1234.5"),
            aggregate("storage_gb", "gb", "17.25"),
        ];
        let rules = vec![
            rule(None, "api_calls", "count", "0.001", Currency::INR, epoch()),
            rule(None, "storage_gb", "gb", "4.75", Currency::INR, epoch()),
        ];
        let minimums = vec![minimum("500", epoch())];
        let cfg = config("0.18");
        let a = calculate(&aggregates, &rules, &minimums, &cfg, &RateSet::default(), 3, 2024)
            .unwrap();
        let b = calculate(&aggregates, &rules, &minimums, &cfg, &RateSet::default(), 3, 2024)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn due_date_follows_payment_terms() {
        let invoice = calculate(
            &[],
            &[],
            &[],
            &config("0"),
            &RateSet::default(),
            1,
            2024,
        )
        .unwrap();
        assert_eq!(
            invoice.period_start,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            invoice.period_end,
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            invoice.due_date,
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn invalid_month_is_rejected() {
        assert!(matches!(
            billing_period(13, 2024),
            Err(BillingError::InvalidPeriod { month: 13 })
        ));
        assert!(matches!(
            billing_period(0, 2024),
            Err(BillingError::InvalidPeriod { month: 0 })
        ));
    }

    #[test]
    fn december_rolls_into_the_next_year() {
        let (start, end) = billing_period(12, 2024).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn line_totals_sum_to_the_subtotal() {
        let aggregates = vec![
            aggregate("api_calls", "count", "333"),
            aggregate("storage_gb", "gb", "7.77"),
            aggregate("egress_gb", "gb", "0.123"),
        ];
        let rules = vec![
            rule(None, "api_calls", "count", "0.003", Currency::INR, epoch()),
            rule(None, "storage_gb", "gb", "4.99", Currency::INR, epoch()),
            rule(None, "egress_gb", "gb", "11.37", Currency::INR, epoch()),
        ];
        let invoice = calculate(
            &aggregates,
            &rules,
            &[],
            &config("0.18"),
            &RateSet::default(),
            6,
            2024,
        )
        .unwrap();
        let summed: Decimal = invoice.line_items.iter().map(|l| l.total).sum();
        assert_eq!(summed, invoice.subtotal);
    }

    struct ExchangeRateFixture;

    impl ExchangeRateFixture {
        fn usd_inr(rate: &str, from: DateTime<Utc>) -> meterflow_core::model::ExchangeRate {
            meterflow_core::model::ExchangeRate {
                id: Uuid::new_v4(),
                base_currency: Currency::USD,
                target_currency: Currency::INR,
                rate: rate.parse().unwrap(),
                effective_from: from,
                effective_to: None,
                source: "manual".to_string(),
                created_at: from,
            }
        }
    }
}
