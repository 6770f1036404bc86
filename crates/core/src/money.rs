//! Fixed-point money helpers.
//!
//! Costs are `Decimal` in the domain and integer micro-dollars in storage so
//! accumulators can be incremented atomically without float drift.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Fractional digits retained for every stored amount.
pub const MONEY_SCALE: u32 = 6;

const MICROS_PER_DOLLAR: i64 = 1_000_000;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount `{0}` is outside the storable range")]
    OutOfRange(Decimal),
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

pub fn to_micros(amount: Decimal) -> Result<i64, MoneyError> {
    round_money(amount)
        .checked_mul(Decimal::from(MICROS_PER_DOLLAR))
        .and_then(|micros| micros.to_i64())
        .ok_or(MoneyError::OutOfRange(amount))
}

pub fn from_micros(micros: i64) -> Decimal {
    Decimal::new(micros, MONEY_SCALE)
}

/// Renders an amount as `$1.2346` (four decimals, half away from zero).
pub fn format_usd(amount: Decimal) -> String {
    let mut rounded = amount.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(4);
    format!("${rounded}")
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{format_usd, from_micros, round_money, to_micros};

    #[test]
    fn micros_conversion_keeps_six_fractional_digits() {
        let cost = Decimal::new(1_234_567, 6);
        let micros = to_micros(cost).expect("in range");
        assert_eq!(micros, 1_234_567);
        assert_eq!(from_micros(micros), cost);
    }

    #[test]
    fn sub_micro_amounts_round_half_away_from_zero() {
        assert_eq!(round_money(Decimal::new(15, 7)), Decimal::new(2, 6));
        assert_eq!(to_micros(Decimal::new(14, 7)).expect("in range"), 1);
    }

    #[test]
    fn formats_dollars_with_four_decimals() {
        assert_eq!(format_usd(Decimal::new(8, 0)), "$8.0000");
        assert_eq!(format_usd(Decimal::new(123_456, 6)), "$0.1235");
    }

    #[test]
    fn out_of_range_amount_is_rejected() {
        assert!(to_micros(Decimal::MAX).is_err());
    }
}
