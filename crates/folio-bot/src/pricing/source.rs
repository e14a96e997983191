//! Market data source abstraction.
//!
//! The core never talks to an exchange directly; it consumes typed ticker and
//! OHLCV records through this seam. The replay implementation backs tests and
//! `--once` dry runs with deterministic data.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use folio_common::{Candle, TickerResult};

/// Errors from a market data source.
#[derive(Debug, Error)]
pub enum DataSourceError {
    /// Network, rate-limit, or timeout failure; eligible for retry.
    #[error("Transient data error for {symbol}: {reason}")]
    Transient { symbol: String, reason: String },

    /// The source does not quote this symbol at all.
    #[error("Symbol not supported by source: {0}")]
    Unsupported(String),
}

/// A source of tickers and OHLCV bars.
///
/// The data layer owns venue normalization. `candles` returns an empty
/// sequence on failure, never an error; sizing degrades to its ATR bootstrap.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch the current ticker for a symbol.
    async fn ticker(&self, symbol: &str) -> Result<TickerResult, DataSourceError>;

    /// Fetch up to `limit` recent OHLCV bars, oldest first.
    async fn candles(&self, symbol: &str, limit: usize) -> Vec<Candle>;

    /// Human-readable source name for logs.
    fn name(&self) -> &str {
        "market_data"
    }
}

/// Deterministic in-memory data source for tests and dry runs.
///
/// Tickers and candles are set explicitly; transient failures can be injected
/// per symbol to exercise the snapshot retry path.
#[derive(Debug, Default)]
pub struct ReplayDataSource {
    tickers: DashMap<String, TickerResult>,
    candles: DashMap<String, Vec<Candle>>,
    failures: DashMap<String, u32>,
}

impl ReplayDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the ticker returned for a symbol.
    pub fn set_ticker(&self, ticker: TickerResult) {
        self.tickers.insert(ticker.symbol.clone(), ticker);
    }

    /// Remove a symbol's ticker entirely.
    pub fn clear_ticker(&self, symbol: &str) {
        self.tickers.remove(symbol);
    }

    /// Set the candle history returned for a symbol.
    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.insert(symbol.to_string(), candles);
    }

    /// Make the next `count` ticker fetches for `symbol` fail transiently.
    pub fn inject_failures(&self, symbol: &str, count: u32) {
        self.failures.insert(symbol.to_string(), count);
    }
}

#[async_trait]
impl MarketDataSource for ReplayDataSource {
    async fn ticker(&self, symbol: &str) -> Result<TickerResult, DataSourceError> {
        if let Some(mut remaining) = self.failures.get_mut(symbol) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DataSourceError::Transient {
                    symbol: symbol.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
        }

        self.tickers
            .get(symbol)
            .map(|t| t.clone())
            .ok_or_else(|| DataSourceError::Unsupported(symbol.to_string()))
    }

    async fn candles(&self, symbol: &str, limit: usize) -> Vec<Candle> {
        self.candles
            .get(symbol)
            .map(|c| {
                let bars = c.value();
                let start = bars.len().saturating_sub(limit);
                bars[start..].to_vec()
            })
            .unwrap_or_default()
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use folio_common::{DataQuality, Venue};
    use rust_decimal_macros::dec;

    fn ticker(symbol: &str) -> TickerResult {
        TickerResult {
            symbol: symbol.to_string(),
            bid: Some(dec!(99.9)),
            ask: Some(dec!(100.1)),
            last: dec!(100),
            timestamp: Utc::now(),
            venue: Venue::Coinbase,
            data_quality: DataQuality::Ok,
            source: "coinbase_bid_ask_mid".to_string(),
        }
    }

    #[tokio::test]
    async fn test_replay_ticker_roundtrip() {
        let source = ReplayDataSource::new();
        source.set_ticker(ticker("BTC/USDT"));

        let fetched = source.ticker("BTC/USDT").await.unwrap();
        assert_eq!(fetched.last, dec!(100));
    }

    #[tokio::test]
    async fn test_replay_unknown_symbol() {
        let source = ReplayDataSource::new();
        assert!(matches!(
            source.ticker("BTC/USDT").await,
            Err(DataSourceError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let source = ReplayDataSource::new();
        source.set_ticker(ticker("BTC/USDT"));
        source.inject_failures("BTC/USDT", 2);

        assert!(source.ticker("BTC/USDT").await.is_err());
        assert!(source.ticker("BTC/USDT").await.is_err());
        assert!(source.ticker("BTC/USDT").await.is_ok());
    }

    #[tokio::test]
    async fn test_candles_empty_on_missing() {
        let source = ReplayDataSource::new();
        assert!(source.candles("BTC/USDT", 20).await.is_empty());
    }

    #[tokio::test]
    async fn test_candles_limit_takes_newest() {
        let source = ReplayDataSource::new();
        let bars: Vec<Candle> = (0..10)
            .map(|i| Candle {
                ts: Utc::now(),
                open: dec!(100) + rust_decimal::Decimal::from(i),
                high: dec!(101) + rust_decimal::Decimal::from(i),
                low: dec!(99) + rust_decimal::Decimal::from(i),
                close: dec!(100) + rust_decimal::Decimal::from(i),
                volume: dec!(1),
            })
            .collect();
        source.set_candles("BTC/USDT", bars);

        let fetched = source.candles("BTC/USDT", 3).await;
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched[0].close, dec!(107));
    }
}
