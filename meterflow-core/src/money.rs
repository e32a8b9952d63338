//! Exact fixed-precision money kernel
//!
//! All monetary and usage quantities are `rust_decimal::Decimal`; floats
//! never enter a financial path. A `Money` value carries its ISO 4217
//! currency tag and refuses arithmetic against a different currency — cross
//! currency operations must go through the currency service, which produces
//! a fresh value tagged with the target currency. Rounding is half-even at
//! the currency's minor-unit scale (2 for INR/USD, 0 for JPY).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::errors::MoneyError;

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    pub const INR: Currency = Currency(*b"INR");
    pub const USD: Currency = Currency(*b"USD");
    pub const EUR: Currency = Currency(*b"EUR");
    pub const GBP: Currency = Currency(*b"GBP");
    pub const JPY: Currency = Currency(*b"JPY");

    /// Parse a three-letter uppercase ISO 4217 code.
    pub fn parse(code: &str) -> Result<Self, MoneyError> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(MoneyError::InvalidCurrency(code.to_string()));
        }
        Ok(Currency([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        // Constructed only from validated ASCII uppercase bytes
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    /// Number of decimal places of the currency's minor unit.
    pub fn minor_unit_scale(&self) -> u32 {
        match self.as_str() {
            "JPY" | "KRW" | "VND" => 0,
            "BHD" | "KWD" | "OMR" => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::parse(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.as_str().to_string()
    }
}

/// An exact decimal amount tagged with its currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    /// Parse a decimal string into a money value.
    pub fn parse(amount: &str, currency: Currency) -> Result<Self, MoneyError> {
        let amount = Decimal::from_str(amount)
            .map_err(|_| MoneyError::InvalidAmount(amount.to_string()))?;
        Ok(Self::new(amount, currency))
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    fn require_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency.to_string(),
                right: other.currency.to_string(),
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.require_same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| MoneyError::InvalidAmount(format!("{} + {}", self.amount, other.amount)))?;
        Ok(Money::new(amount, self.currency))
    }

    pub fn checked_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.require_same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| MoneyError::InvalidAmount(format!("{} - {}", self.amount, other.amount)))?;
        Ok(Money::new(amount, self.currency))
    }

    /// Multiply by a dimensionless decimal factor (a quantity or a rate).
    pub fn checked_mul(&self, factor: Decimal) -> Result<Money, MoneyError> {
        let amount = self
            .amount
            .checked_mul(factor)
            .ok_or_else(|| MoneyError::InvalidAmount(format!("{} * {}", self.amount, factor)))?;
        Ok(Money::new(amount, self.currency))
    }

    /// Divide by a dimensionless decimal factor, rejecting zero.
    pub fn checked_div(&self, divisor: Decimal) -> Result<Money, MoneyError> {
        if divisor.is_zero() {
            return Err(MoneyError::DivideByZero);
        }
        let amount = self
            .amount
            .checked_div(divisor)
            .ok_or_else(|| MoneyError::InvalidAmount(format!("{} / {}", self.amount, divisor)))?;
        Ok(Money::new(amount, self.currency))
    }

    /// Ordering against another value of the same currency.
    pub fn try_cmp(&self, other: &Money) -> Result<Ordering, MoneyError> {
        self.require_same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    pub fn min(self, other: Money) -> Result<Money, MoneyError> {
        Ok(match self.try_cmp(&other)? {
            Ordering::Greater => other,
            _ => self,
        })
    }

    pub fn max(self, other: Money) -> Result<Money, MoneyError> {
        Ok(match self.try_cmp(&other)? {
            Ordering::Less => other,
            _ => self,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.amount.is_sign_positive() && !self.amount.is_zero()
    }

    /// -1, 0 or 1.
    pub fn signum(&self) -> i32 {
        if self.amount.is_zero() {
            0
        } else if self.amount.is_sign_negative() {
            -1
        } else {
            1
        }
    }

    /// Round half-even at the currency's minor-unit scale.
    pub fn rounded(&self) -> Money {
        let scale = self.currency.minor_unit_scale();
        Money::new(
            self.amount
                .round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven),
            self.currency,
        )
    }

    /// The amount in minor units (paise for INR, cents for USD), rounding
    /// half-even first. Used for gateway order amounts.
    pub fn to_minor_units(&self) -> Result<i64, MoneyError> {
        let scale = self.currency.minor_unit_scale();
        let factor = Decimal::from(10i64.pow(scale));
        let minor = self
            .rounded()
            .amount
            .checked_mul(factor)
            .ok_or_else(|| MoneyError::MinorUnitOverflow {
                amount: self.amount.to_string(),
                currency: self.currency.to_string(),
            })?;
        minor.to_i64().ok_or_else(|| MoneyError::MinorUnitOverflow {
            amount: self.amount.to_string(),
            currency: self.currency.to_string(),
        })
    }

    pub fn from_minor_units(minor: i64, currency: Currency) -> Money {
        let scale = currency.minor_unit_scale();
        let mut amount = Decimal::from(minor);
        amount.set_scale(scale).unwrap_or_default();
        Money::new(amount, currency)
    }

    /// Fixed-scale serialization at the currency's minor-unit scale,
    /// e.g. `1180.00` for INR and `1180` for JPY.
    pub fn format_fixed(&self) -> String {
        let scale = self.currency.minor_unit_scale();
        let mut rounded = self.rounded().amount;
        rounded.rescale(scale);
        rounded.to_string()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.format_fixed(), self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inr(s: &str) -> Money {
        Money::parse(s, Currency::INR).unwrap()
    }

    #[test]
    fn parses_and_formats_at_fixed_scale() {
        assert_eq!(inr("1180").format_fixed(), "1180.00");
        assert_eq!(inr("0.5").format_fixed(), "0.50");
        let jpy = Money::parse("1200", Currency::JPY).unwrap();
        assert_eq!(jpy.format_fixed(), "1200");
    }

    #[test]
    fn rejects_invalid_currency_codes() {
        assert!(Currency::parse("inr").is_err());
        assert!(Currency::parse("INRR").is_err());
        assert!(Currency::parse("I1R").is_err());
        assert_eq!(Currency::parse("INR").unwrap(), Currency::INR);
    }

    #[test]
    fn addition_requires_same_currency() {
        let a = inr("10.00");
        let b = Money::parse("10.00", Currency::USD).unwrap();
        match a.checked_add(&b) {
            Err(MoneyError::CurrencyMismatch { left, right }) => {
                assert_eq!(left, "INR");
                assert_eq!(right, "USD");
            }
            other => panic!("expected currency mismatch, got {other:?}"),
        }
    }

    #[test]
    fn rounds_half_even() {
        assert_eq!(inr("2.345").rounded().amount(), Decimal::from_str("2.34").unwrap());
        assert_eq!(inr("2.355").rounded().amount(), Decimal::from_str("2.36").unwrap());
        assert_eq!(inr("2.005").rounded().amount(), Decimal::from_str("2.00").unwrap());
    }

    #[test]
    fn divide_by_zero_is_rejected() {
        assert_eq!(
            inr("10.00").checked_div(Decimal::ZERO).unwrap_err(),
            MoneyError::DivideByZero
        );
    }

    #[test]
    fn minor_units_round_trip() {
        assert_eq!(inr("1180.00").to_minor_units().unwrap(), 118000);
        assert_eq!(
            Money::from_minor_units(118000, Currency::INR).format_fixed(),
            "1180.00"
        );
        let jpy = Money::parse("1200", Currency::JPY).unwrap();
        assert_eq!(jpy.to_minor_units().unwrap(), 1200);
    }

    #[test]
    fn min_max_and_sign() {
        let small = inr("1.00");
        let large = inr("1000.00");
        assert_eq!(small.max(large).unwrap(), large);
        assert_eq!(small.min(large).unwrap(), small);
        assert_eq!(inr("-3.50").signum(), -1);
        assert_eq!(inr("0").signum(), 0);
        assert!(inr("-3.50").is_negative());
    }

    proptest! {
        #[test]
        fn add_is_commutative(a in -1_000_000_000i64..1_000_000_000, b in -1_000_000_000i64..1_000_000_000) {
            let x = Money::from_minor_units(a, Currency::INR);
            let y = Money::from_minor_units(b, Currency::INR);
            prop_assert_eq!(x.checked_add(&y).unwrap(), y.checked_add(&x).unwrap());
        }

        #[test]
        fn sub_then_add_round_trips(a in -1_000_000_000i64..1_000_000_000, b in -1_000_000_000i64..1_000_000_000) {
            let x = Money::from_minor_units(a, Currency::INR);
            let y = Money::from_minor_units(b, Currency::INR);
            let back = x.checked_sub(&y).unwrap().checked_add(&y).unwrap();
            prop_assert_eq!(back, x);
        }

        #[test]
        fn minor_units_are_exact(a in -1_000_000_000i64..1_000_000_000) {
            let x = Money::from_minor_units(a, Currency::INR);
            prop_assert_eq!(x.to_minor_units().unwrap(), a);
        }
    }
}
