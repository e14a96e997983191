//! Shared types for the folio trading core.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Side::Buy),
            "SELL" | "SHORT" => Ok(Side::Sell),
            _ => Err(format!("Unknown side: {}", s)),
        }
    }
}

/// Position side derived from signed quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Classify a signed position quantity. Returns `None` for flat.
    pub fn from_signed_qty(qty: Decimal) -> Option<Self> {
        if qty > Decimal::ZERO {
            Some(PositionSide::Long)
        } else if qty < Decimal::ZERO {
            Some(PositionSide::Short)
        } else {
            None
        }
    }

    /// The order side that reduces a position on this side.
    pub fn closing_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Final action produced by the signal layer for one symbol.
///
/// The decision router maps this to an order side and intent; it is a total
/// function, every variant has an explicit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FinalAction {
    Buy,
    Sell,
    Hold,
    Skip,
    Close,
}

impl std::fmt::Display for FinalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalAction::Buy => write!(f, "BUY"),
            FinalAction::Sell => write!(f, "SELL"),
            FinalAction::Hold => write!(f, "HOLD"),
            FinalAction::Skip => write!(f, "SKIP"),
            FinalAction::Close => write!(f, "CLOSE"),
        }
    }
}

/// Supported execution venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Coinbase,
    Binance,
    Kraken,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Coinbase => "coinbase",
            Venue::Binance => "binance",
            Venue::Kraken => "kraken",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Venue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coinbase" => Ok(Venue::Coinbase),
            "binance" => Ok(Venue::Binance),
            "kraken" => Ok(Venue::Kraken),
            _ => Err(format!("Unknown venue: {}", s)),
        }
    }
}

/// Quality tag attached to every ticker fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    Ok,
    Stale,
    Missing,
    Unsupported,
}

impl std::fmt::Display for DataQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataQuality::Ok => write!(f, "ok"),
            DataQuality::Stale => write!(f, "stale"),
            DataQuality::Missing => write!(f, "missing"),
            DataQuality::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Result of one ticker fetch from a data source.
///
/// The data layer is responsible for venue normalization and retry; consumers
/// treat this as a typed record and never re-fetch inside a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerResult {
    pub symbol: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
    pub venue: Venue,
    pub data_quality: DataQuality,
    /// Price provenance, e.g. "coinbase_bid_ask_mid".
    pub source: String,
}

impl TickerResult {
    /// Bid/ask midpoint when both sides are present.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Quote age relative to `now`, in milliseconds. Negative ages clamp to 0.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_milliseconds().max(0)
    }
}

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_side_parse() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SHORT".parse::<Side>().unwrap(), Side::Sell);
        assert!("flat".parse::<Side>().is_err());
    }

    #[test]
    fn test_position_side_from_qty() {
        assert_eq!(
            PositionSide::from_signed_qty(dec!(1.5)),
            Some(PositionSide::Long)
        );
        assert_eq!(
            PositionSide::from_signed_qty(dec!(-0.2)),
            Some(PositionSide::Short)
        );
        assert_eq!(PositionSide::from_signed_qty(Decimal::ZERO), None);
    }

    #[test]
    fn test_closing_side() {
        assert_eq!(PositionSide::Long.closing_side(), Side::Sell);
        assert_eq!(PositionSide::Short.closing_side(), Side::Buy);
    }

    #[test]
    fn test_ticker_mid() {
        let ticker = TickerResult {
            symbol: "BTC/USDT".to_string(),
            bid: Some(dec!(99999)),
            ask: Some(dec!(100001)),
            last: dec!(100000),
            timestamp: Utc::now(),
            venue: Venue::Coinbase,
            data_quality: DataQuality::Ok,
            source: "coinbase_bid_ask_mid".to_string(),
        };
        assert_eq!(ticker.mid(), Some(dec!(100000)));
    }

    #[test]
    fn test_ticker_mid_missing_side() {
        let ticker = TickerResult {
            symbol: "BTC/USDT".to_string(),
            bid: None,
            ask: Some(dec!(100001)),
            last: dec!(100000),
            timestamp: Utc::now(),
            venue: Venue::Coinbase,
            data_quality: DataQuality::Ok,
            source: "coinbase_last".to_string(),
        };
        assert_eq!(ticker.mid(), None);
    }
}
