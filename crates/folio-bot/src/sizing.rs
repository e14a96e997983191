//! Volatility-normalized position sizing and exchange quantization.
//!
//! Sizing formula:
//! - stop distance `d = entry * atr_pct * stop_atr_mult`
//! - risk amount `R = equity * risk_per_trade_pct`
//! - raw notional `N = (R / d) * entry`
//!
//! Caps apply in order (taking the minimum): max_notional_pct of equity,
//! remaining per-symbol headroom, remaining session headroom. A capped
//! notional below the floor scales up to the floor when caps allow, or
//! rejects with `below_floor`. Quantization rounds price to the nearest tick
//! and quantity DOWN to the step, bumping once to venue minimums; anything
//! still infeasible rejects with `precision_fail`.

pub mod atr;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;

use folio_common::{quantize_price, quantize_qty, venue_rules_for, VenueRules};

use crate::config::SizingConfig;
use crate::decision::router::OrderIntent;

/// Sizing rejections. All leave state untouched.
#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("Notional ${notional} below floor ${floor} and caps prevent scaling up")]
    BelowFloor { notional: Decimal, floor: Decimal },

    #[error("Order not representable on venue: {0}")]
    PrecisionFail(String),

    #[error("No remaining headroom under {0} cap")]
    NoHeadroom(&'static str),

    #[error("Invalid sizing input: {0}")]
    InvalidInput(String),
}

/// Inputs to one sizing decision.
#[derive(Debug, Clone)]
pub struct SizeRequest {
    pub symbol: String,
    pub intent: OrderIntent,
    pub entry_price: Decimal,
    pub equity: Decimal,
    /// ATR as a fraction of price (from `AtrService::atr_pct`).
    pub atr_pct: Decimal,
    /// Current notional exposure in this symbol.
    pub symbol_exposure: Decimal,
    /// Current notional exposure across the session.
    pub session_exposure: Decimal,
    /// Size multiplier (1 for normal; exploration multiplier otherwise).
    pub size_mult: Decimal,
}

/// A sized, exchange-legal order.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub notional: Decimal,
    pub stop_distance: Decimal,
    pub risk_amount: Decimal,
}

/// ATR-volatility-normalized sizer.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    /// Size an order, apply caps and floors, and quantize to venue rules.
    pub fn size(&self, req: &SizeRequest) -> Result<SizedOrder, SizingError> {
        if req.entry_price <= Decimal::ZERO {
            return Err(SizingError::InvalidInput(format!(
                "entry price {} must be positive",
                req.entry_price
            )));
        }
        if req.equity <= Decimal::ZERO {
            return Err(SizingError::InvalidInput(format!(
                "equity {} must be positive",
                req.equity
            )));
        }
        if req.atr_pct <= Decimal::ZERO {
            return Err(SizingError::InvalidInput(format!(
                "atr_pct {} must be positive",
                req.atr_pct
            )));
        }

        let cfg = &self.config;
        let stop_distance = req.entry_price * req.atr_pct * cfg.stop_atr_mult;
        let risk_amount = req.equity * cfg.risk_per_trade_pct * req.size_mult;
        let raw_qty = risk_amount / stop_distance;
        let raw_notional = raw_qty * req.entry_price;

        // Caps, in order; the binding cap is the minimum.
        let equity_cap = cfg.max_notional_pct * req.equity;
        let symbol_headroom = cfg.per_symbol_cap - req.symbol_exposure;
        let session_headroom = cfg.session_cap - req.session_exposure;
        if symbol_headroom <= Decimal::ZERO {
            return Err(SizingError::NoHeadroom("per_symbol"));
        }
        if session_headroom <= Decimal::ZERO {
            return Err(SizingError::NoHeadroom("session"));
        }
        let cap = equity_cap.min(symbol_headroom).min(session_headroom);
        let mut notional = raw_notional.min(cap);

        // Floor. Exploration trades get the smaller floor.
        let floor = match req.intent {
            OrderIntent::Explore => cfg.notional_floor_exploration,
            _ => cfg.notional_floor_normal,
        };
        if notional < floor {
            if floor <= cap {
                notional = floor;
            } else {
                return Err(SizingError::BelowFloor { notional, floor });
            }
        }

        let rules = venue_rules_for(&req.symbol);
        let (quantity, price) = quantize_order(&req.symbol, req.entry_price, notional, cap, &rules)?;

        let sized = SizedOrder {
            symbol: req.symbol.clone(),
            notional: quantity * price,
            quantity,
            price,
            stop_distance,
            risk_amount,
        };
        debug!(
            symbol = %sized.symbol,
            qty = %sized.quantity,
            price = %sized.price,
            notional = %sized.notional,
            stop_distance = %stop_distance,
            "Order sized"
        );
        Ok(sized)
    }
}

/// Quantize a (price, notional) target into an exchange-legal order.
///
/// Price rounds to the nearest tick; quantity rounds DOWN to the step.
/// Quantities or notionals under the venue minimum are bumped once to the
/// minimum; if the bump exceeds the available cap headroom, the order is a
/// precision failure, never a zero-quantity order.
pub fn quantize_order(
    symbol: &str,
    price: Decimal,
    target_notional: Decimal,
    cap: Decimal,
    rules: &VenueRules,
) -> Result<(Decimal, Decimal), SizingError> {
    let quantized_price = quantize_price(price, rules);
    if quantized_price <= Decimal::ZERO {
        return Err(SizingError::PrecisionFail(format!(
            "{}: price {} quantized to zero",
            symbol, price
        )));
    }

    let mut quantity = quantize_qty(target_notional / quantized_price, rules);

    if quantity < rules.min_qty || quantity * quantized_price < rules.min_notional {
        // Bump once to the venue minimum.
        let min_qty_for_notional = ceil_to_step(rules.min_notional / quantized_price, rules);
        let bumped = rules.min_qty.max(min_qty_for_notional);
        if bumped * quantized_price > cap {
            return Err(SizingError::PrecisionFail(format!(
                "{}: minimum order ${} exceeds cap headroom ${}",
                symbol,
                bumped * quantized_price,
                cap
            )));
        }
        quantity = bumped;
    }

    if quantity <= Decimal::ZERO {
        return Err(SizingError::PrecisionFail(format!(
            "{}: quantity rounds to zero at price {}",
            symbol, quantized_price
        )));
    }

    Ok((quantity, quantized_price))
}

fn ceil_to_step(qty: Decimal, rules: &VenueRules) -> Decimal {
    if rules.qty_step <= Decimal::ZERO {
        return qty;
    }
    let steps = (qty / rules.qty_step).ceil();
    steps * rules.qty_step
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> SizingConfig {
        SizingConfig {
            risk_per_trade_pct: dec!(0.0025),
            stop_atr_mult: dec!(2.0),
            max_notional_pct: dec!(0.25),
            per_symbol_cap: dec!(25000),
            session_cap: dec!(100000),
            notional_floor_normal: dec!(500),
            notional_floor_exploration: dec!(150),
        }
    }

    fn request() -> SizeRequest {
        SizeRequest {
            symbol: "BTC/USDT".to_string(),
            intent: OrderIntent::Normal,
            entry_price: dec!(100000),
            equity: dec!(100000),
            atr_pct: dec!(0.02),
            symbol_exposure: Decimal::ZERO,
            session_exposure: Decimal::ZERO,
            size_mult: Decimal::ONE,
        }
    }

    #[test]
    fn test_basic_sizing() {
        let sizer = PositionSizer::new(config());
        let sized = sizer.size(&request()).unwrap();

        // d = 100000 * 0.02 * 2 = 4000; R = 100000 * 0.0025 = 250
        // q_raw = 250/4000 = 0.0625 BTC -> notional 6250
        assert_eq!(sized.stop_distance, dec!(4000));
        assert_eq!(sized.risk_amount, dec!(250));
        assert_eq!(sized.quantity, dec!(0.0625));
        assert_eq!(sized.price, dec!(100000));
        assert_eq!(sized.notional, dec!(6250));
    }

    #[test]
    fn test_equity_cap_binds() {
        let sizer = PositionSizer::new(config());
        let mut req = request();
        // Tiny volatility would size huge; the 25%-of-equity cap binds.
        req.atr_pct = dec!(0.0001);
        let sized = sizer.size(&req).unwrap();
        assert!(sized.notional <= dec!(25000));
    }

    #[test]
    fn test_symbol_headroom_binds() {
        let sizer = PositionSizer::new(config());
        let mut req = request();
        req.atr_pct = dec!(0.0001);
        req.symbol_exposure = dec!(24000);
        let sized = sizer.size(&req).unwrap();
        // Remaining headroom is 1000.
        assert!(sized.notional <= dec!(1000));
    }

    #[test]
    fn test_no_headroom_rejects() {
        let sizer = PositionSizer::new(config());
        let mut req = request();
        req.symbol_exposure = dec!(25000);
        assert_eq!(
            sizer.size(&req).unwrap_err(),
            SizingError::NoHeadroom("per_symbol")
        );

        let mut req = request();
        req.session_exposure = dec!(100000);
        assert_eq!(
            sizer.size(&req).unwrap_err(),
            SizingError::NoHeadroom("session")
        );
    }

    #[test]
    fn test_floor_scales_up() {
        let sizer = PositionSizer::new(config());
        let mut req = request();
        // Small equity sizes below the $500 floor; caps still allow the floor.
        req.equity = dec!(20000);
        req.atr_pct = dec!(0.10);
        // R = 50, d = 20000 -> raw notional 250 < 500.
        let sized = sizer.size(&req).unwrap();
        assert_eq!(sized.notional, dec!(500));
    }

    #[test]
    fn test_floor_beyond_caps_rejects() {
        let mut cfg = config();
        cfg.per_symbol_cap = dec!(300);
        let sizer = PositionSizer::new(cfg);
        let mut req = request();
        req.equity = dec!(20000);
        req.atr_pct = dec!(0.10);
        assert!(matches!(
            sizer.size(&req).unwrap_err(),
            SizingError::BelowFloor { .. }
        ));
    }

    #[test]
    fn test_exploration_floor() {
        let sizer = PositionSizer::new(config());
        let mut req = request();
        req.intent = OrderIntent::Explore;
        req.equity = dec!(20000);
        req.atr_pct = dec!(0.10);
        req.size_mult = dec!(0.5);
        // Raw notional 125 < 150 exploration floor; scales to 150.
        let sized = sizer.size(&req).unwrap();
        assert_eq!(sized.notional, dec!(150));
    }

    #[test]
    fn test_quantize_rounds_qty_down() {
        let rules = VenueRules {
            price_tick: dec!(0.01),
            qty_step: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(10),
        };
        // 1234.56 / 100 = 12.3456 -> 12.345 (down, never up)
        let (qty, price) =
            quantize_order("TEST", dec!(100), dec!(1234.56), dec!(100000), &rules).unwrap();
        assert_eq!(price, dec!(100));
        assert_eq!(qty, dec!(12.345));
    }

    #[test]
    fn test_quantize_bumps_to_minimum_once() {
        let rules = VenueRules {
            price_tick: dec!(0.01),
            qty_step: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(10),
        };
        // Target $2 at price 100: rounds to 0.02 qty -> $2 < min_notional;
        // bumped to 0.1 qty = $10.
        let (qty, _) = quantize_order("TEST", dec!(100), dec!(2), dec!(100000), &rules).unwrap();
        assert_eq!(qty, dec!(0.1));
    }

    #[test]
    fn test_quantize_zero_qty_is_precision_fail() {
        // Quantity that rounds to zero after step-down must reject, never
        // emit a zero-quantity order.
        let rules = VenueRules {
            price_tick: dec!(0.01),
            qty_step: dec!(1),
            min_qty: dec!(1),
            min_notional: dec!(10),
        };
        // Target $5 at price 100 rounds down to zero units; the bump to
        // 1 unit ($100) exceeds a $50 cap.
        let err = quantize_order("TEST", dec!(100), dec!(5), dec!(50), &rules).unwrap_err();
        assert!(matches!(err, SizingError::PrecisionFail(_)));
    }

    #[test]
    fn test_quantized_order_is_realizable() {
        // quantize(price) * quantize(qty) stays aligned with the rules.
        let rules = folio_common::venue_rules_for("BTC/USDT");
        let (qty, price) =
            quantize_order("BTC/USDT", dec!(100000.004), dec!(6250), dec!(25000), &rules).unwrap();
        assert_eq!(quantize_price(price, &rules), price);
        assert_eq!(quantize_qty(qty, &rules), qty);
        assert!(qty >= rules.min_qty);
        assert!(qty * price >= rules.min_notional);
    }

    #[test]
    fn test_invalid_inputs() {
        let sizer = PositionSizer::new(config());
        let mut req = request();
        req.entry_price = Decimal::ZERO;
        assert!(matches!(
            sizer.size(&req).unwrap_err(),
            SizingError::InvalidInput(_)
        ));

        let mut req = request();
        req.equity = Decimal::ZERO;
        assert!(matches!(
            sizer.size(&req).unwrap_err(),
            SizingError::InvalidInput(_)
        ));
    }
}
