//! ATR computation with a volatility bootstrap for warmup.
//!
//! Wilder's ATR over OHLCV bars when enough history exists. During warmup
//! the service falls back to `1.4 * sigma(log returns) * price` over the
//! last 5-20 bars, floored at 2% of price, so sizing always has a usable
//! volatility estimate.

use std::collections::HashMap;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use folio_common::Candle;

/// Minimum ATR as a fraction of price. The bootstrap never goes below this.
const MIN_ATR_PCT: Decimal = dec!(0.02);

/// Sigma multiplier for the bootstrap estimate.
const BOOTSTRAP_SIGMA_MULT: f64 = 1.4;

/// Minimum bars for the sigma bootstrap; fewer falls back to the floor.
const BOOTSTRAP_MIN_BARS: usize = 5;

/// Maximum bars the bootstrap looks back.
const BOOTSTRAP_MAX_BARS: usize = 20;

/// Per-symbol ATR tracking fed from OHLCV history.
#[derive(Debug)]
pub struct AtrService {
    period: usize,
    candles: HashMap<String, Vec<Candle>>,
}

impl Default for AtrService {
    fn default() -> Self {
        Self::new(14)
    }
}

impl AtrService {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            candles: HashMap::new(),
        }
    }

    /// Replace the candle history for a symbol (oldest first).
    pub fn update(&mut self, symbol: &str, candles: Vec<Candle>) {
        self.candles.insert(symbol.to_string(), candles);
    }

    /// Number of bars held for a symbol.
    pub fn bar_count(&self, symbol: &str) -> usize {
        self.candles.get(symbol).map(|c| c.len()).unwrap_or(0)
    }

    /// Wilder ATR over the configured period, if enough history exists.
    pub fn atr(&self, symbol: &str) -> Option<Decimal> {
        let candles = self.candles.get(symbol)?;
        if candles.len() < self.period + 1 {
            return None;
        }

        let mut true_ranges = Vec::with_capacity(candles.len() - 1);
        for window in candles.windows(2) {
            let prev_close = window[0].close;
            let bar = window[1];
            let tr = (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs());
            true_ranges.push(tr);
        }

        // Seed with the simple average of the first `period` TRs, then
        // apply Wilder smoothing over the remainder.
        let period_dec = Decimal::from(self.period as u64);
        let mut atr: Decimal =
            true_ranges[..self.period].iter().copied().sum::<Decimal>() / period_dec;
        for tr in &true_ranges[self.period..] {
            atr = (atr * (period_dec - Decimal::ONE) + *tr) / period_dec;
        }
        Some(atr)
    }

    /// ATR as a fraction of price, always usable.
    ///
    /// Full ATR when warmed up; otherwise the sigma bootstrap; with fewer
    /// than five bars, the 2%-of-price floor.
    pub fn atr_pct(&self, symbol: &str, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return MIN_ATR_PCT;
        }
        if let Some(atr) = self.atr(symbol) {
            return (atr / price).max(MIN_ATR_PCT * dec!(0.1));
        }
        self.bootstrap(symbol, price) / price
    }

    fn bootstrap(&self, symbol: &str, price: Decimal) -> Decimal {
        let floor = MIN_ATR_PCT * price;
        let candles = match self.candles.get(symbol) {
            Some(candles) if candles.len() >= BOOTSTRAP_MIN_BARS => candles,
            _ => {
                debug!(symbol = %symbol, "ATR bootstrap floor: insufficient bars");
                return floor;
            }
        };

        let start = candles.len().saturating_sub(BOOTSTRAP_MAX_BARS);
        let closes: Vec<f64> = candles[start..]
            .iter()
            .filter_map(|bar| bar.close.to_f64())
            .filter(|c| *c > 0.0)
            .collect();
        if closes.len() < BOOTSTRAP_MIN_BARS {
            return floor;
        }

        let returns: Vec<f64> = closes
            .windows(2)
            .map(|pair| (pair[1] / pair[0]).ln())
            .collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let sigma = variance.sqrt();

        let estimate = Decimal::from_f64(BOOTSTRAP_SIGMA_MULT * sigma)
            .unwrap_or(Decimal::ZERO)
            * price;
        estimate.max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(close: Decimal, range: Decimal) -> Candle {
        Candle {
            ts: Utc::now(),
            open: close,
            high: close + range / Decimal::TWO,
            low: close - range / Decimal::TWO,
            close,
            volume: dec!(1),
        }
    }

    #[test]
    fn test_atr_requires_warmup() {
        let mut service = AtrService::new(14);
        service.update("BTC/USDT", (0..10).map(|_| bar(dec!(100), dec!(2))).collect());
        assert!(service.atr("BTC/USDT").is_none());
    }

    #[test]
    fn test_atr_constant_range() {
        let mut service = AtrService::new(14);
        // 20 bars with a constant $2 range and flat closes: ATR = 2.
        service.update("BTC/USDT", (0..20).map(|_| bar(dec!(100), dec!(2))).collect());
        assert_eq!(service.atr("BTC/USDT").unwrap(), dec!(2));
    }

    #[test]
    fn test_atr_pct_from_full_atr() {
        let mut service = AtrService::new(14);
        service.update("BTC/USDT", (0..20).map(|_| bar(dec!(100), dec!(2))).collect());
        assert_eq!(service.atr_pct("BTC/USDT", dec!(100)), dec!(0.02));
    }

    #[test]
    fn test_bootstrap_floor_under_five_bars() {
        // S-boundary: ATR warmup with < 5 candles falls back to 2% of price.
        let mut service = AtrService::new(14);
        service.update("BTC/USDT", (0..3).map(|_| bar(dec!(100), dec!(2))).collect());
        assert_eq!(service.atr_pct("BTC/USDT", dec!(100)), dec!(0.02));
    }

    #[test]
    fn test_bootstrap_floor_no_bars() {
        let service = AtrService::default();
        assert_eq!(service.atr_pct("BTC/USDT", dec!(50000)), dec!(0.02));
    }

    #[test]
    fn test_bootstrap_flat_closes_hits_floor() {
        // Flat closes give sigma 0; the 2% floor applies.
        let mut service = AtrService::new(14);
        service.update("BTC/USDT", (0..8).map(|_| bar(dec!(100), dec!(1))).collect());
        assert_eq!(service.atr_pct("BTC/USDT", dec!(100)), dec!(0.02));
    }

    #[test]
    fn test_bootstrap_volatile_closes_above_floor() {
        let mut service = AtrService::new(14);
        // Alternate +10% / -10% closes: sigma ~0.1, estimate ~0.14 of price.
        let mut close = dec!(100);
        let mut bars = Vec::new();
        for i in 0..10 {
            close = if i % 2 == 0 {
                close * dec!(1.10)
            } else {
                close * dec!(0.90)
            };
            bars.push(bar(close, dec!(1)));
        }
        service.update("BTC/USDT", bars);
        let pct = service.atr_pct("BTC/USDT", dec!(100));
        assert!(pct > dec!(0.02), "expected bootstrap above floor, got {}", pct);
    }
}
