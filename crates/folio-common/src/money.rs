//! Decimal money helpers and venue quantization rules.
//!
//! Every monetary path in the workspace is fixed-point `Decimal`. The only
//! floating-point crossings are config parsing and human-readable display,
//! and both pass through `to_decimal` at the boundary.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BPS_DENOMINATOR: Decimal = dec!(10000);

/// Errors from boundary normalization.
#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("Value is not representable as a decimal: {0}")]
    NotRepresentable(f64),

    #[error("Value is not finite: {0}")]
    NotFinite(f64),
}

/// Normalize a float-derived value into a `Decimal` at a public boundary.
///
/// Rejects NaN and infinities instead of silently producing garbage. This is
/// the single legal crossing from float-land into the decimal-only core.
pub fn to_decimal(value: f64) -> Result<Decimal, MoneyError> {
    if !value.is_finite() {
        return Err(MoneyError::NotFinite(value));
    }
    Decimal::from_f64(value).ok_or(MoneyError::NotRepresentable(value))
}

/// A fraction of `value` expressed in basis points.
#[inline]
pub fn bps_of(value: Decimal, bps: Decimal) -> Decimal {
    value * bps / BPS_DENOMINATOR
}

/// Midpoint of a bid/ask pair.
#[inline]
pub fn mid_price(bid: Decimal, ask: Decimal) -> Decimal {
    (bid + ask) / Decimal::TWO
}

/// Spread of a bid/ask pair in basis points of the mid.
///
/// Returns `None` when the quote is crossed or degenerate (`ask <= bid` or
/// non-positive mid).
pub fn spread_bps(bid: Decimal, ask: Decimal) -> Option<Decimal> {
    if bid <= Decimal::ZERO || ask <= bid {
        return None;
    }
    let mid = mid_price(bid, ask);
    if mid <= Decimal::ZERO {
        return None;
    }
    Some((ask - bid) / mid * BPS_DENOMINATOR)
}

/// Exchange precision rules for one symbol on one venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueRules {
    /// Minimum price increment.
    pub price_tick: Decimal,
    /// Minimum quantity increment.
    pub qty_step: Decimal,
    /// Smallest order quantity the venue accepts.
    pub min_qty: Decimal,
    /// Smallest order notional the venue accepts.
    pub min_notional: Decimal,
}

impl Default for VenueRules {
    fn default() -> Self {
        Self {
            price_tick: dec!(0.01),
            qty_step: dec!(0.000001),
            min_qty: dec!(0.000001),
            min_notional: dec!(10),
        }
    }
}

/// Round a price to the nearest tick.
///
/// Idempotent: quantizing an already-quantized price is a no-op.
pub fn quantize_price(price: Decimal, rules: &VenueRules) -> Decimal {
    if rules.price_tick <= Decimal::ZERO {
        return price;
    }
    let ticks = (price / rules.price_tick)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    ticks * rules.price_tick
}

/// Round a quantity DOWN to the step.
///
/// Never rounds up: rounding up would inflate exposure past what the sizer
/// approved. Idempotent like `quantize_price`.
pub fn quantize_qty(qty: Decimal, rules: &VenueRules) -> Decimal {
    if rules.qty_step <= Decimal::ZERO {
        return qty;
    }
    let steps = (qty / rules.qty_step).floor();
    steps * rules.qty_step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_decimal_rejects_nan() {
        assert!(to_decimal(f64::NAN).is_err());
        assert!(to_decimal(f64::INFINITY).is_err());
        assert_eq!(to_decimal(1.5).unwrap(), dec!(1.5));
    }

    #[test]
    fn test_bps_of() {
        assert_eq!(bps_of(dec!(100000), dec!(5)), dec!(50));
        assert_eq!(bps_of(dec!(10000), dec!(1)), dec!(1));
    }

    #[test]
    fn test_spread_bps() {
        // bid=99.99 ask=100.01, mid=100, spread=0.02 -> 2 bps
        let spread = spread_bps(dec!(99.99), dec!(100.01)).unwrap();
        assert_eq!(spread, dec!(2));
    }

    #[test]
    fn test_spread_bps_crossed_quote() {
        assert!(spread_bps(dec!(100.01), dec!(99.99)).is_none());
        assert!(spread_bps(dec!(100), dec!(100)).is_none());
        assert!(spread_bps(Decimal::ZERO, dec!(1)).is_none());
    }

    #[test]
    fn test_quantize_price_nearest() {
        let rules = VenueRules {
            price_tick: dec!(0.01),
            ..VenueRules::default()
        };
        assert_eq!(quantize_price(dec!(100.004), &rules), dec!(100.00));
        assert_eq!(quantize_price(dec!(100.005), &rules), dec!(100.01));
        assert_eq!(quantize_price(dec!(100.006), &rules), dec!(100.01));
    }

    #[test]
    fn test_quantize_qty_rounds_down() {
        let rules = VenueRules {
            qty_step: dec!(0.001),
            ..VenueRules::default()
        };
        assert_eq!(quantize_qty(dec!(0.12345), &rules), dec!(0.123));
        assert_eq!(quantize_qty(dec!(0.1239), &rules), dec!(0.123));
        // Never up, even when close to the next step.
        assert_eq!(quantize_qty(dec!(0.1239999), &rules), dec!(0.123));
    }

    #[test]
    fn test_quantize_idempotent() {
        let rules = VenueRules {
            price_tick: dec!(0.05),
            qty_step: dec!(0.0001),
            ..VenueRules::default()
        };
        let price = quantize_price(dec!(1234.5678), &rules);
        assert_eq!(quantize_price(price, &rules), price);
        let qty = quantize_qty(dec!(3.14159), &rules);
        assert_eq!(quantize_qty(qty, &rules), qty);
    }
}
