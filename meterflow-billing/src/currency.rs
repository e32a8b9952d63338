//! Currency service
//!
//! Effective-dated exchange rate lookup and conversion. Cross-currency
//! arithmetic on `Money` is forbidden; everything goes through here and
//! comes back tagged with the target currency. The optional daily sync pulls
//! from an external source and degrades gracefully: on failure the existing
//! rows keep being used.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use meterflow_core::config::ExchangeRateConfig;
use meterflow_core::errors::{CurrencyError, CurrencyResult};
use meterflow_core::model::ExchangeRate;
use meterflow_core::money::{Currency, Money};
use meterflow_storage::{rates, DurableStore};

/// A snapshot of exchange rates for pure consumers (the billing calculator).
/// Lookups follow the same effective-window rules as the store.
#[derive(Debug, Clone, Default)]
pub struct RateSet {
    rates: Vec<ExchangeRate>,
}

impl RateSet {
    pub fn new(rates: Vec<ExchangeRate>) -> Self {
        Self { rates }
    }

    pub fn rate(
        &self,
        base: Currency,
        target: Currency,
        at: DateTime<Utc>,
    ) -> CurrencyResult<Decimal> {
        if base == target {
            return Ok(Decimal::ONE);
        }
        self.rates
            .iter()
            .filter(|r| {
                r.base_currency == base
                    && r.target_currency == target
                    && r.effective_from <= at
                    && r.effective_to.map_or(true, |to| to > at)
            })
            .max_by_key(|r| r.effective_from)
            .map(|r| r.rate)
            .ok_or_else(|| CurrencyError::MissingRate {
                base: base.to_string(),
                target: target.to_string(),
                at: at.to_rfc3339(),
            })
    }

    /// Convert into the target currency; the result carries the target tag.
    pub fn convert(
        &self,
        money: Money,
        target: Currency,
        at: DateTime<Utc>,
    ) -> CurrencyResult<Money> {
        if money.currency() == target {
            return Ok(money);
        }
        let rate = self.rate(money.currency(), target, at)?;
        let converted = money
            .amount()
            .checked_mul(rate)
            .ok_or_else(|| CurrencyError::InvalidRate {
                base: money.currency().to_string(),
                target: target.to_string(),
                rate: rate.to_string(),
            })?;
        Ok(Money::new(converted, target))
    }
}

/// Wire shape of the external rate source
#[derive(Debug, Deserialize)]
struct RateSourceResponse {
    base: String,
    rates: HashMap<String, Decimal>,
}

/// Store-backed currency service
pub struct CurrencyService {
    store: DurableStore,
    config: ExchangeRateConfig,
    http: reqwest::Client,
}

impl CurrencyService {
    pub fn new(store: DurableStore, config: ExchangeRateConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { store, config, http }
    }

    /// The rate effective at `at`; identity for same-currency pairs.
    pub async fn rate(
        &self,
        base: Currency,
        target: Currency,
        at: DateTime<Utc>,
    ) -> CurrencyResult<Decimal> {
        if base == target {
            return Ok(Decimal::ONE);
        }
        match rates::find_effective(&self.store, base, target, at).await? {
            Some(rate) => Ok(rate.rate),
            None => Err(CurrencyError::MissingRate {
                base: base.to_string(),
                target: target.to_string(),
                at: at.to_rfc3339(),
            }),
        }
    }

    pub async fn convert(
        &self,
        money: Money,
        target: Currency,
        at: DateTime<Utc>,
    ) -> CurrencyResult<Money> {
        if money.currency() == target {
            return Ok(money);
        }
        let rate = self.rate(money.currency(), target, at).await?;
        let converted = money
            .amount()
            .checked_mul(rate)
            .ok_or_else(|| CurrencyError::InvalidRate {
                base: money.currency().to_string(),
                target: target.to_string(),
                rate: rate.to_string(),
            })?;
        Ok(Money::new(converted, target))
    }

    /// Every rate row; the generator snapshots these into a [`RateSet`] so
    /// the calculator stays free of I/O.
    pub async fn snapshot(&self) -> CurrencyResult<RateSet> {
        let rows = rates::list(&self.store, None).await?;
        Ok(RateSet::new(rows))
    }

    /// Admin upsert: closes the superseded open window and inserts the row.
    pub async fn upsert(&self, rate: &ExchangeRate) -> CurrencyResult<()> {
        if rate.rate <= Decimal::ZERO {
            return Err(CurrencyError::InvalidRate {
                base: rate.base_currency.to_string(),
                target: rate.target_currency.to_string(),
                rate: rate.rate.to_string(),
            });
        }
        rates::upsert(&self.store, rate).await?;
        Ok(())
    }

    pub async fn list(&self, base: Option<Currency>) -> CurrencyResult<Vec<ExchangeRate>> {
        Ok(rates::list(&self.store, base).await?)
    }

    /// Best-effort pull from the external source. Failures are logged and
    /// swallowed so stale-but-present rates keep serving.
    pub async fn sync(&self) -> CurrencyResult<usize> {
        if !self.config.sync_enabled {
            return Ok(0);
        }
        let Some(source_url) = &self.config.source_url else {
            return Ok(0);
        };
        let base = Currency::parse(&self.config.base_currency)
            .map_err(|e| CurrencyError::SyncFailed(e.to_string()))?;

        let response = match self
            .http
            .get(source_url)
            .query(&[("base", base.as_str())])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("exchange rate sync unreachable: {e}");
                return Ok(0);
            }
        };
        let parsed: RateSourceResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("exchange rate sync returned malformed payload: {e}");
                return Ok(0);
            }
        };
        if parsed.base != base.as_str() {
            warn!(
                "exchange rate sync answered for base {} instead of {}",
                parsed.base, base
            );
            return Ok(0);
        }

        let now = Utc::now();
        let mut applied = 0usize;
        for (code, value) in parsed.rates {
            let Ok(target) = Currency::parse(&code) else {
                continue;
            };
            if value <= Decimal::ZERO || target == base {
                continue;
            }
            let row = ExchangeRate {
                id: Uuid::new_v4(),
                base_currency: base,
                target_currency: target,
                rate: value,
                effective_from: now,
                effective_to: None,
                source: "sync".to_string(),
                created_at: now,
            };
            if let Err(e) = rates::upsert(&self.store, &row).await {
                warn!("exchange rate sync failed to store {base}->{target}: {e}");
                continue;
            }
            applied += 1;
        }
        info!(applied, "exchange rate sync complete");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn rate_row(
        base: Currency,
        target: Currency,
        rate: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> ExchangeRate {
        ExchangeRate {
            id: Uuid::new_v4(),
            base_currency: base,
            target_currency: target,
            rate: rate.parse().unwrap(),
            effective_from: from,
            effective_to: to,
            source: "manual".to_string(),
            created_at: from,
        }
    }

    #[test]
    fn identity_rate_needs_no_rows() {
        let set = RateSet::default();
        let rate = set.rate(Currency::INR, Currency::INR, Utc::now()).unwrap();
        assert_eq!(rate, Decimal::ONE);
    }

    #[test]
    fn picks_the_latest_effective_window() {
        let now = Utc::now();
        let set = RateSet::new(vec![
            rate_row(
                Currency::USD,
                Currency::INR,
                "82.0",
                now - Duration::days(30),
                Some(now - Duration::days(10)),
            ),
            rate_row(Currency::USD, Currency::INR, "83.5", now - Duration::days(10), None),
        ]);
        assert_eq!(
            set.rate(Currency::USD, Currency::INR, now).unwrap(),
            "83.5".parse::<Decimal>().unwrap()
        );
        assert_eq!(
            set.rate(Currency::USD, Currency::INR, now - Duration::days(20))
                .unwrap(),
            "82.0".parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn missing_rate_is_a_dedicated_error() {
        let set = RateSet::default();
        match set.rate(Currency::USD, Currency::INR, Utc::now()) {
            Err(CurrencyError::MissingRate { base, target, .. }) => {
                assert_eq!(base, "USD");
                assert_eq!(target, "INR");
            }
            other => panic!("expected missing rate, got {other:?}"),
        }
    }

    #[test]
    fn convert_tags_the_target_currency() {
        let now = Utc::now();
        let set = RateSet::new(vec![rate_row(
            Currency::USD,
            Currency::INR,
            "80",
            now - Duration::days(1),
            None,
        )]);
        let usd = Money::parse("12.50", Currency::USD).unwrap();
        let inr = set.convert(usd, Currency::INR, now).unwrap();
        assert_eq!(inr.currency(), Currency::INR);
        assert_eq!(inr.format_fixed(), "1000.00");
    }
}
