//! Simulated fills with fee and market-impact slippage.
//!
//! Slippage model: `slip_bps = min((notional / notional_scale) * base_bps,
//! cap_bps)`, applied adversely. Buys fill above the mark, sells below it.
//! Limit (post-only) fills take no slippage and pay the maker rate.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;
use uuid::Uuid;

use folio_common::{quantize_price, venue_rules_for, Side, Venue};

use crate::config::{FeeSchedule, SlippageConfig};

const BPS: Decimal = dec!(10000);

/// Inputs to one simulated fill.
#[derive(Debug, Clone)]
pub struct FillParams {
    pub symbol: String,
    pub venue: Venue,
    pub side: Side,
    pub quantity: Decimal,
    pub mark_price: Decimal,
    /// Market orders take slippage; resting limit fills do not.
    pub is_market: bool,
    /// Maker fills pay the maker rate (confirmed post-only only).
    pub is_maker: bool,
}

/// A simulated execution receipt.
#[derive(Debug, Clone)]
pub struct Fill {
    pub fill_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub mark_price: Decimal,
    pub effective_fill_price: Decimal,
    pub slippage_bps: Decimal,
    /// Dollar cost of slippage versus filling at the mark.
    pub slippage_cost: Decimal,
    pub fee_bps: Decimal,
    pub fees: Decimal,
    /// Quantity times effective fill price.
    pub notional: Decimal,
    pub is_maker: bool,
    pub executed_at: chrono::DateTime<chrono::Utc>,
}

impl Fill {
    /// Cash impact of this fill: negative for buys (notional + fees out),
    /// positive for sells (notional - fees in).
    pub fn cash_delta_ex_fees(&self) -> Decimal {
        match self.side {
            Side::Buy => -self.notional,
            Side::Sell => self.notional,
        }
    }
}

/// Computes fill costs; never mutates portfolio state.
#[derive(Debug, Clone)]
pub struct FillSimulator {
    fees: FeeSchedule,
    slippage: SlippageConfig,
}

impl FillSimulator {
    pub fn new(fees: FeeSchedule, slippage: SlippageConfig) -> Self {
        Self { fees, slippage }
    }

    /// Slippage in bps for an order of the given mark notional.
    pub fn slippage_bps(&self, notional: Decimal, is_market: bool) -> Decimal {
        if !is_market {
            return Decimal::ZERO;
        }
        let raw = notional / self.slippage.notional_scale * self.slippage.base_bps;
        raw.min(self.slippage.cap_bps)
    }

    /// Effective fill price after adverse slippage, quantized to the tick.
    pub fn effective_fill_price(
        &self,
        symbol: &str,
        side: Side,
        mark: Decimal,
        slip_bps: Decimal,
    ) -> Decimal {
        let multiplier = slip_bps / BPS;
        let effective = match side {
            Side::Buy => mark * (Decimal::ONE + multiplier),
            Side::Sell => mark * (Decimal::ONE - multiplier),
        };
        quantize_price(effective, &venue_rules_for(symbol))
    }

    /// Simulate one fill and return the receipt.
    pub fn simulate(&self, params: &FillParams) -> Fill {
        let notional_at_mark = params.quantity * params.mark_price;
        let slip_bps = self.slippage_bps(notional_at_mark, params.is_market);
        let effective =
            self.effective_fill_price(&params.symbol, params.side, params.mark_price, slip_bps);
        let notional = params.quantity * effective;
        let slippage_cost = (notional - notional_at_mark).abs();

        let fee_bps = if params.is_maker {
            self.fees.maker_bps(params.venue)
        } else {
            self.fees.taker_bps(params.venue)
        };
        let fees = notional * fee_bps / BPS;

        let fill = Fill {
            fill_id: Uuid::new_v4().to_string(),
            symbol: params.symbol.clone(),
            side: params.side,
            quantity: params.quantity,
            mark_price: params.mark_price,
            effective_fill_price: effective,
            slippage_bps: slip_bps,
            slippage_cost,
            fee_bps,
            fees,
            notional,
            is_maker: params.is_maker,
            executed_at: Utc::now(),
        };

        info!(
            symbol = %fill.symbol,
            side = %fill.side,
            qty = %fill.quantity,
            mark = %fill.mark_price,
            fill_price = %fill.effective_fill_price,
            slip_bps = %fill.slippage_bps,
            fees = %fill.fees,
            maker = fill.is_maker,
            "Fill simulated"
        );
        fill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn simulator() -> FillSimulator {
        FillSimulator::new(
            FeeSchedule {
                default_maker_bps: dec!(2),
                default_taker_bps: dec!(6),
                per_venue: HashMap::new(),
            },
            SlippageConfig {
                notional_scale: dec!(50000),
                base_bps: dec!(5),
                cap_bps: dec!(8),
            },
        )
    }

    fn buy(qty: Decimal, mark: Decimal) -> FillParams {
        FillParams {
            symbol: "BTC/USDT".to_string(),
            venue: Venue::Coinbase,
            side: Side::Buy,
            quantity: qty,
            mark_price: mark,
            is_market: true,
            is_maker: false,
        }
    }

    #[test]
    fn test_slippage_scales_with_notional() {
        let sim = simulator();
        // $50k notional -> exactly base 5 bps.
        assert_eq!(sim.slippage_bps(dec!(50000), true), dec!(5));
        // $25k -> 2.5 bps.
        assert_eq!(sim.slippage_bps(dec!(25000), true), dec!(2.5));
        // $100k -> 10 bps capped at 8.
        assert_eq!(sim.slippage_bps(dec!(100000), true), dec!(8));
        // Limit orders: no slippage.
        assert_eq!(sim.slippage_bps(dec!(100000), false), Decimal::ZERO);
    }

    #[test]
    fn test_trending_entry_costs() {
        // 0.5 BTC at mark $100,000: $50,025 notional at the 5 bps fill of
        // $100,050, taker fee 6 bps = $30.015.
        let sim = simulator();
        let fill = sim.simulate(&buy(dec!(0.5), dec!(100000)));

        assert_eq!(fill.slippage_bps, dec!(5));
        assert_eq!(fill.effective_fill_price, dec!(100050));
        assert_eq!(fill.notional, dec!(50025));
        assert_eq!(fill.fees, dec!(30.015));
        assert_eq!(fill.slippage_cost, dec!(25));
        // Entry cost = notional + fees = 50055.015
        assert_eq!(fill.notional + fill.fees, dec!(50055.015));
    }

    #[test]
    fn test_slippage_adversity() {
        // BUY fills at or above the mark; SELL at or below.
        let sim = simulator();
        let buy_fill = sim.simulate(&buy(dec!(1), dec!(100000)));
        assert!(buy_fill.effective_fill_price >= buy_fill.mark_price);

        let sell_fill = sim.simulate(&FillParams {
            side: Side::Sell,
            ..buy(dec!(1), dec!(100000))
        });
        assert!(sell_fill.effective_fill_price <= sell_fill.mark_price);
    }

    #[test]
    fn test_maker_fill_no_slip_lower_fee() {
        let sim = simulator();
        let fill = sim.simulate(&FillParams {
            is_market: false,
            is_maker: true,
            ..buy(dec!(0.5), dec!(100000))
        });
        assert_eq!(fill.slippage_bps, Decimal::ZERO);
        assert_eq!(fill.effective_fill_price, dec!(100000));
        assert_eq!(fill.fee_bps, dec!(2));
        assert_eq!(fill.fees, dec!(10));
    }

    #[test]
    fn test_cash_delta_signs() {
        let sim = simulator();
        let buy_fill = sim.simulate(&buy(dec!(0.1), dec!(100000)));
        assert!(buy_fill.cash_delta_ex_fees() < Decimal::ZERO);

        let sell_fill = sim.simulate(&FillParams {
            side: Side::Sell,
            ..buy(dec!(0.1), dec!(100000))
        });
        assert!(sell_fill.cash_delta_ex_fees() > Decimal::ZERO);
    }

    #[test]
    fn test_fill_price_quantized_to_tick() {
        let sim = simulator();
        // An awkward mark: the effective price must land on the venue tick.
        let fill = sim.simulate(&buy(dec!(0.37), dec!(99123.45)));
        let rules = venue_rules_for("BTC/USDT");
        assert_eq!(
            quantize_price(fill.effective_fill_price, &rules),
            fill.effective_fill_price
        );
    }
}
