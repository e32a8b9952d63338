//! Alert engine
//!
//! Evaluates threshold, spike, cost and unusual-pattern rules on schedule.
//! Each rule aggregates usage over its comparison period ending at
//! evaluation time; triggers insert a history row, notify the configured
//! channels, and stamp the cooldown clock so two triggers can never land
//! within the cooldown window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use meterflow_core::capability::{AlertNotification, ChannelRegistry};
use meterflow_core::config::AlertsConfig;
use meterflow_core::errors::{AlertError, AlertResult};
use meterflow_core::model::{AlertEvent, AlertRule, AlertRuleType, AlertStatus};
use meterflow_core::observability;
use meterflow_storage::{alerts, events, pricing, DurableStore};

/// Spike percentage `(current - reference) / reference * 100`; undefined
/// when the reference is zero.
pub fn spike_percent(current: Decimal, reference: Decimal) -> Option<Decimal> {
    if reference.is_zero() {
        return None;
    }
    (current - reference)
        .checked_div(reference)
        .and_then(|ratio| ratio.checked_mul(Decimal::from(100)))
}

/// Whether the rule is still cooling down at `now`.
pub fn in_cooldown(rule: &AlertRule, default_cooldown_minutes: i64, now: DateTime<Utc>) -> bool {
    let Some(last) = rule.last_alert_at else {
        return false;
    };
    let cooldown = if rule.cooldown_minutes > 0 {
        rule.cooldown_minutes
    } else {
        default_cooldown_minutes
    };
    last + Duration::minutes(cooldown) > now
}

pub struct AlertEngine {
    store: DurableStore,
    channels: Arc<ChannelRegistry>,
    config: AlertsConfig,
}

impl AlertEngine {
    pub fn new(store: DurableStore, channels: Arc<ChannelRegistry>, config: AlertsConfig) -> Self {
        Self {
            store,
            channels,
            config,
        }
    }

    /// Evaluate every active rule; per-rule errors are isolated.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> AlertResult<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let rules = alerts::list_rules(&self.store, true).await?;
        let mut triggered = 0usize;
        for rule in rules {
            match self.evaluate_rule(&rule, now).await {
                Ok(Some(_)) => triggered += 1,
                Ok(None) => {}
                Err(e) => error!(rule = %rule.name, "alert evaluation failed: {e}"),
            }
        }
        Ok(triggered)
    }

    /// Evaluate one rule at `now`; returns the history row when it fired.
    pub async fn evaluate_rule(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> AlertResult<Option<AlertEvent>> {
        if !rule.is_active || in_cooldown(rule, self.config.default_cooldown_minutes, now) {
            return Ok(None);
        }

        let period_start = now - rule.comparison_period.duration();
        let evaluation = match rule.rule_type {
            AlertRuleType::UsageThreshold => self.evaluate_threshold(rule, period_start, now).await?,
            AlertRuleType::UsageSpike => self.evaluate_spike(rule, period_start, now).await?,
            AlertRuleType::CostThreshold => self.evaluate_cost(rule, period_start, now).await?,
            AlertRuleType::UnusualPattern => self.evaluate_pattern(rule, period_start, now).await?,
        };

        let Some((actual, message)) = evaluation else {
            return Ok(None);
        };

        let event = AlertEvent {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            organisation_id: rule.organisation_id,
            status: AlertStatus::Pending,
            actual_value: actual,
            threshold_value: rule.threshold,
            period_start,
            period_end: now,
            message,
            triggered_at: now,
        };
        alerts::insert_event(&self.store, &event).await?;
        alerts::touch_last_alert(&self.store, rule.id, now).await?;
        observability::record_alert_triggered(rule.rule_type.as_str());
        info!(rule = %rule.name, actual = %actual, "alert triggered");

        let delivered = self.notify(rule, &event).await;
        let status = if delivered {
            AlertStatus::Sent
        } else {
            AlertStatus::Failed
        };
        alerts::update_event_status(&self.store, event.id, status).await?;
        Ok(Some(AlertEvent { status, ..event }))
    }

    async fn evaluate_threshold(
        &self,
        rule: &AlertRule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AlertResult<Option<(Decimal, String)>> {
        let (metric, unit) = required_metric(rule)?;
        let threshold = required_threshold(rule)?;
        let operator = rule.operator.ok_or_else(|| invalid(rule, "missing operator"))?;
        let (total, _) =
            events::sum_for_window(&self.store, rule.organisation_id, metric, unit, from, to)
                .await?;
        if operator.compare(total, threshold) {
            let message = format!(
                "{metric} usage {total} {} threshold {threshold} over the last {}",
                operator.as_str(),
                rule.comparison_period.as_str()
            );
            return Ok(Some((total, message)));
        }
        Ok(None)
    }

    async fn evaluate_spike(
        &self,
        rule: &AlertRule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AlertResult<Option<(Decimal, String)>> {
        let (metric, unit) = required_metric(rule)?;
        let required_spike = rule
            .spike_percent
            .ok_or_else(|| invalid(rule, "missing spike_percent"))?;
        let reference_duration = rule
            .reference_period
            .unwrap_or(rule.comparison_period)
            .duration();

        let (current, _) =
            events::sum_for_window(&self.store, rule.organisation_id, metric, unit, from, to)
                .await?;
        let (reference, _) = events::sum_for_window(
            &self.store,
            rule.organisation_id,
            metric,
            unit,
            from - reference_duration,
            from,
        )
        .await?;

        match spike_percent(current, reference) {
            Some(spike) if spike >= required_spike => {
                let message = format!(
                    "{metric} spiked {spike:.2}% over the reference period (current {current}, reference {reference})"
                );
                Ok(Some((spike, message)))
            }
            // Zero reference makes the spike undefined; never trigger
            _ => Ok(None),
        }
    }

    async fn evaluate_cost(
        &self,
        rule: &AlertRule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AlertResult<Option<(Decimal, String)>> {
        let (metric, unit) = required_metric(rule)?;
        let threshold = required_threshold(rule)?;
        let operator = rule.operator.ok_or_else(|| invalid(rule, "missing operator"))?;

        let (total, _) =
            events::sum_for_window(&self.store, rule.organisation_id, metric, unit, from, to)
                .await?;
        let scope = rule.organisation_id.unwrap_or_else(Uuid::nil);
        let rules = pricing::effective_pricing_rules(&self.store, scope, to).await?;
        let Some(price) = rules
            .iter()
            .filter(|r| r.metric_name == metric && r.unit == unit)
            .max_by_key(|r| (r.organisation_id.is_some(), r.effective_from))
        else {
            // Unpriced metrics cannot breach a cost threshold
            return Ok(None);
        };
        let cost = total
            .checked_mul(price.price_per_unit)
            .unwrap_or(Decimal::ZERO);
        if operator.compare(cost, threshold) {
            let message = format!(
                "{metric} cost {cost} {} {} threshold {threshold} over the last {}",
                price.currency,
                operator.as_str(),
                rule.comparison_period.as_str()
            );
            return Ok(Some((cost, message)));
        }
        Ok(None)
    }

    /// Drop-to-zero detector: usage stopped while the rule expects at least
    /// `threshold`.
    async fn evaluate_pattern(
        &self,
        rule: &AlertRule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AlertResult<Option<(Decimal, String)>> {
        let (metric, unit) = required_metric(rule)?;
        let threshold = required_threshold(rule)?;
        if threshold <= Decimal::ZERO {
            return Ok(None);
        }
        let (total, _) =
            events::sum_for_window(&self.store, rule.organisation_id, metric, unit, from, to)
                .await?;
        if total.is_zero() {
            let message = format!(
                "{metric} dropped to zero over the last {} (expected at least {threshold})",
                rule.comparison_period.as_str()
            );
            return Ok(Some((Decimal::ZERO, message)));
        }
        Ok(None)
    }

    async fn notify(&self, rule: &AlertRule, event: &AlertEvent) -> bool {
        let notification = AlertNotification {
            rule_name: rule.name.clone(),
            rule_type: rule.rule_type.as_str().to_string(),
            message: event.message.clone(),
            actual_value: event.actual_value.to_string(),
            threshold_value: event.threshold_value.map(|t| t.to_string()),
            organisation_id: rule.organisation_id,
        };
        let mut any_delivered = false;
        for channel_name in &rule.channels {
            let Some(channel) = self.channels.get(channel_name) else {
                warn!(rule = %rule.name, channel = %channel_name, "unknown alert channel");
                continue;
            };
            match channel.notify(&notification).await {
                Ok(()) => any_delivered = true,
                Err(e) => warn!(
                    rule = %rule.name,
                    channel = %channel_name,
                    "alert delivery failed: {e}"
                ),
            }
        }
        any_delivered
    }
}

fn required_metric<'r>(rule: &'r AlertRule) -> AlertResult<(&'r str, &'r str)> {
    let metric = rule
        .metric_name
        .as_deref()
        .ok_or_else(|| invalid(rule, "missing metric_name"))?;
    let unit = rule
        .unit
        .as_deref()
        .ok_or_else(|| invalid(rule, "missing unit"))?;
    Ok((metric, unit))
}

fn required_threshold(rule: &AlertRule) -> AlertResult<Decimal> {
    rule.threshold
        .ok_or_else(|| invalid(rule, "missing threshold"))
}

fn invalid(rule: &AlertRule, message: &str) -> AlertError {
    AlertError::InvalidRule {
        rule_id: rule.id.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterflow_core::model::ComparisonPeriod;

    fn rule_with_cooldown(cooldown_minutes: i64, last: Option<DateTime<Utc>>) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            organisation_id: None,
            name: "test".to_string(),
            rule_type: AlertRuleType::UsageThreshold,
            metric_name: Some("api_calls".to_string()),
            unit: Some("count".to_string()),
            threshold: Some(Decimal::from(100)),
            operator: Some(meterflow_core::model::ThresholdOperator::Gt),
            comparison_period: ComparisonPeriod::Hour,
            spike_percent: None,
            reference_period: None,
            is_active: true,
            channels: vec!["log".to_string()],
            cooldown_minutes,
            last_alert_at: last,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn spike_is_undefined_at_zero_reference() {
        assert_eq!(spike_percent(Decimal::from(500), Decimal::ZERO), None);
    }

    #[test]
    fn spike_percentage_matches_the_formula() {
        let spike = spike_percent(Decimal::from(150), Decimal::from(100)).unwrap();
        assert_eq!(spike, Decimal::from(50));
        let negative = spike_percent(Decimal::from(50), Decimal::from(100)).unwrap();
        assert_eq!(negative, Decimal::from(-50));
    }

    #[test]
    fn cooldown_blocks_until_it_elapses() {
        let now = Utc::now();
        let rule = rule_with_cooldown(60, Some(now - Duration::minutes(30)));
        assert!(in_cooldown(&rule, 60, now));
        let rule = rule_with_cooldown(60, Some(now - Duration::minutes(61)));
        assert!(!in_cooldown(&rule, 60, now));
        let rule = rule_with_cooldown(60, None);
        assert!(!in_cooldown(&rule, 60, now));
    }

    #[test]
    fn zero_cooldown_falls_back_to_the_default() {
        let now = Utc::now();
        let rule = rule_with_cooldown(0, Some(now - Duration::minutes(30)));
        assert!(in_cooldown(&rule, 60, now));
        assert!(!in_cooldown(&rule, 15, now));
    }
}
