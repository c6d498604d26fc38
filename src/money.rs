//! Decimal helpers for two-decimal currency amounts.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Largest value a `DECIMAL(12, 2)` column holds.
pub const MAX_AMOUNT: Decimal = dec!(9999999999.99);

/// Rounds half away from zero to the currency's minor unit.
pub fn round_minor(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `unit * qty`, rounded and clamped into the storable range.
pub fn line_subtotal(unit: Decimal, qty: i32) -> Decimal {
    let raw = unit
        .checked_mul(Decimal::from(qty))
        .unwrap_or(MAX_AMOUNT);
    clamp(round_minor(raw))
}

pub fn clamp(amount: Decimal) -> Decimal {
    amount.min(MAX_AMOUNT).max(-MAX_AMOUNT)
}

/// Sums amounts, rounding the result.
pub fn sum<I: IntoIterator<Item = Decimal>>(amounts: I) -> Decimal {
    clamp(round_minor(
        amounts
            .into_iter()
            .fold(Decimal::ZERO, |acc, v| acc.saturating_add(v)),
    ))
}
