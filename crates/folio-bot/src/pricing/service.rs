//! Snapshot construction with retries, staleness, and provenance locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use folio_common::{resolve_venue, DataQuality, Venue};

use super::source::{DataSourceError, MarketDataSource};
use super::{PriceData, PricingSnapshot, ProvenanceLock};

/// Maximum fetch attempts per symbol per snapshot.
const MAX_ATTEMPTS: u32 = 3;

/// Total retry wait budget per symbol.
const RETRY_BUDGET: Duration = Duration::from_secs(1);

/// Builds one frozen snapshot per cycle from a market data source.
///
/// Keeps a last-good cache for stale promotion and the provenance locks
/// established when positions first enter a symbol.
pub struct SnapshotService {
    source: Arc<dyn MarketDataSource>,
    last_good: DashMap<String, PriceData>,
    provenance: DashMap<String, ProvenanceLock>,
    retry_base_ms: u64,
    debounce_ms: u64,
}

impl SnapshotService {
    pub fn new(source: Arc<dyn MarketDataSource>, retry_base_ms: u64, debounce_ms: u64) -> Self {
        Self {
            source,
            last_good: DashMap::new(),
            provenance: DashMap::new(),
            retry_base_ms,
            debounce_ms,
        }
    }

    /// Lock the valuation provenance for a symbol.
    ///
    /// Called when a position first enters the symbol; subsequent snapshots
    /// prefer the locked source while it stays fresh.
    pub fn lock_provenance(&self, symbol: &str, venue: Venue, price_type: &str) {
        info!(symbol = %symbol, venue = %venue, price_type = %price_type, "PROVENANCE_LOCKED");
        self.provenance.insert(
            symbol.to_string(),
            ProvenanceLock {
                venue,
                price_type: price_type.to_string(),
                locked_at: Utc::now(),
            },
        );
    }

    /// Release a symbol's provenance lock (position fully closed).
    pub fn release_provenance(&self, symbol: &str) {
        if self.provenance.remove(symbol).is_some() {
            debug!(symbol = %symbol, "Provenance lock released");
        }
    }

    /// Locked provenance for a symbol, if any.
    pub fn locked_provenance(&self, symbol: &str) -> Option<ProvenanceLock> {
        self.provenance.get(symbol).map(|p| p.clone())
    }

    /// Create the frozen snapshot for one cycle.
    ///
    /// Resilient per symbol: failed symbols degrade to the last-good cache
    /// (marked stale) or are omitted entirely. A partial snapshot is a normal
    /// outcome, not an error.
    pub async fn create_snapshot(&self, cycle_id: u64, symbols: &[String]) -> PricingSnapshot {
        let mut by_symbol = HashMap::new();
        let mut fresh = 0usize;
        let mut stale = 0usize;
        let mut failed = 0usize;

        for symbol in symbols {
            if resolve_venue(symbol).is_none() {
                failed += 1;
                warn!(symbol = %symbol, reason = "unsupported_by_venue", "DATA_SKIP");
                continue;
            }

            match self.fetch_with_retry(symbol).await {
                Some(data) => {
                    if data.stale {
                        stale += 1;
                    } else {
                        fresh += 1;
                        self.last_good.insert(symbol.clone(), data.clone());
                    }
                    self.check_provenance(symbol, &data);
                    by_symbol.insert(symbol.clone(), data);
                }
                None => {
                    // All retries exhausted: promote the cached last-good
                    // value as stale, or omit the symbol entirely.
                    match self.last_good.get(symbol) {
                        Some(cached) => {
                            stale += 1;
                            let mut promoted = cached.clone();
                            promoted.stale = true;
                            promoted.quality = DataQuality::Stale;
                            promoted.stale_reason = Some("retries_exhausted".to_string());
                            info!(
                                symbol = %symbol,
                                price = %promoted.price,
                                "Promoted last-good price as stale"
                            );
                            by_symbol.insert(symbol.clone(), promoted);
                        }
                        None => {
                            failed += 1;
                            warn!(symbol = %symbol, reason = "no_cached_price", "DATA_SKIP");
                        }
                    }
                }
            }
        }

        info!(
            snapshot_id = cycle_id,
            fresh,
            stale,
            failed,
            total = symbols.len(),
            "Snapshot created"
        );
        if failed > 0 {
            warn!(
                snapshot_id = cycle_id,
                failed,
                total = symbols.len(),
                available = by_symbol.len(),
                "Partial snapshot: trading continues with available symbols"
            );
        }

        PricingSnapshot::new(cycle_id, by_symbol, self.debounce_ms)
    }

    async fn fetch_with_retry(&self, symbol: &str) -> Option<PriceData> {
        let mut waited = Duration::ZERO;

        for attempt in 0..MAX_ATTEMPTS {
            match self.source.ticker(symbol).await {
                Ok(ticker) => {
                    if ticker.last <= Decimal::ZERO {
                        warn!(symbol = %symbol, price = %ticker.last, "Rejecting non-positive price");
                        return None;
                    }
                    let stale = ticker.data_quality == DataQuality::Stale;
                    return Some(PriceData {
                        price: ticker.mid().unwrap_or(ticker.last),
                        bid: ticker.bid,
                        ask: ticker.ask,
                        mid: ticker.mid(),
                        venue: ticker.venue,
                        source: ticker.source.clone(),
                        timestamp: ticker.timestamp,
                        quality: ticker.data_quality,
                        stale,
                        stale_reason: stale.then(|| "source_marked_stale".to_string()),
                    });
                }
                Err(DataSourceError::Unsupported(_)) => {
                    // Retrying cannot help; fall straight through to cache.
                    return None;
                }
                Err(DataSourceError::Transient { reason, .. }) => {
                    debug!(symbol = %symbol, attempt, reason = %reason, "Ticker fetch failed");
                    if attempt + 1 < MAX_ATTEMPTS {
                        let jitter: u64 = rand::thread_rng().gen_range(0..100);
                        let backoff = Duration::from_millis(
                            self.retry_base_ms.saturating_mul(1u64 << attempt) + jitter,
                        );
                        let remaining = RETRY_BUDGET.saturating_sub(waited);
                        let sleep = backoff.min(remaining);
                        if sleep.is_zero() {
                            break;
                        }
                        tokio::time::sleep(sleep).await;
                        waited += sleep;
                    }
                }
            }
        }
        None
    }

    fn check_provenance(&self, symbol: &str, data: &PriceData) {
        if let Some(lock) = self.provenance.get(symbol) {
            if lock.venue != data.venue || lock.price_type != data.source {
                warn!(
                    symbol = %symbol,
                    locked_venue = %lock.venue,
                    locked_type = %lock.price_type,
                    actual_venue = %data.venue,
                    actual_type = %data.source,
                    "PROVENANCE_FALLBACK: valuation source differs from locked provenance"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::source::ReplayDataSource;
    use folio_common::TickerResult;
    use rust_decimal_macros::dec;

    fn ticker(symbol: &str, last: Decimal, quality: DataQuality) -> TickerResult {
        TickerResult {
            symbol: symbol.to_string(),
            bid: Some(last - dec!(1)),
            ask: Some(last + dec!(1)),
            last,
            timestamp: Utc::now(),
            venue: Venue::Coinbase,
            data_quality: quality,
            source: "coinbase_bid_ask_mid".to_string(),
        }
    }

    fn service(source: Arc<ReplayDataSource>) -> SnapshotService {
        SnapshotService::new(source, 5, 300)
    }

    #[tokio::test]
    async fn test_snapshot_happy_path() {
        let source = Arc::new(ReplayDataSource::new());
        source.set_ticker(ticker("BTC/USDT", dec!(100000), DataQuality::Ok));
        let service = service(source);

        let snap = service
            .create_snapshot(1, &["BTC/USDT".to_string()])
            .await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.mark("BTC/USDT"), Some(dec!(100000)));
        assert!(!snap.price_data("BTC/USDT").unwrap().stale);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let source = Arc::new(ReplayDataSource::new());
        source.set_ticker(ticker("BTC/USDT", dec!(100000), DataQuality::Ok));
        source.inject_failures("BTC/USDT", 2);
        let service = service(source);

        let snap = service
            .create_snapshot(1, &["BTC/USDT".to_string()])
            .await;
        assert_eq!(snap.mark("BTC/USDT"), Some(dec!(100000)));
    }

    #[tokio::test]
    async fn test_exhausted_retries_promote_stale_cache() {
        let source = Arc::new(ReplayDataSource::new());
        source.set_ticker(ticker("BTC/USDT", dec!(100000), DataQuality::Ok));
        let service = service(source.clone());

        // Cycle 1 populates the last-good cache.
        let snap = service.create_snapshot(1, &["BTC/USDT".to_string()]).await;
        assert!(!snap.price_data("BTC/USDT").unwrap().stale);

        // Cycle 2: every attempt fails; the cached price is promoted stale.
        source.inject_failures("BTC/USDT", 10);
        let snap = service.create_snapshot(2, &["BTC/USDT".to_string()]).await;
        let data = snap.price_data("BTC/USDT").unwrap();
        assert!(data.stale);
        assert_eq!(data.stale_reason.as_deref(), Some("retries_exhausted"));
        assert_eq!(data.price, dec!(100000));
    }

    #[tokio::test]
    async fn test_no_cache_means_omission() {
        let source = Arc::new(ReplayDataSource::new());
        source.inject_failures("BTC/USDT", 10);
        let service = service(source);

        let snap = service.create_snapshot(1, &["BTC/USDT".to_string()]).await;
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn test_unmapped_symbol_omitted_not_mocked() {
        let source = Arc::new(ReplayDataSource::new());
        source.set_ticker(ticker("FAKE/USDT", dec!(5), DataQuality::Ok));
        let service = service(source);

        let snap = service.create_snapshot(1, &["FAKE/USDT".to_string()]).await;
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn test_stale_source_tagged() {
        let source = Arc::new(ReplayDataSource::new());
        source.set_ticker(ticker("BTC/USDT", dec!(100000), DataQuality::Stale));
        let service = service(source);

        let snap = service.create_snapshot(1, &["BTC/USDT".to_string()]).await;
        let data = snap.price_data("BTC/USDT").unwrap();
        assert!(data.stale);
        assert_eq!(data.quality, DataQuality::Stale);
    }

    #[tokio::test]
    async fn test_provenance_lock_roundtrip() {
        let source = Arc::new(ReplayDataSource::new());
        let service = service(source);

        assert!(service.locked_provenance("BTC/USDT").is_none());
        service.lock_provenance("BTC/USDT", Venue::Coinbase, "coinbase_bid_ask_mid");
        let lock = service.locked_provenance("BTC/USDT").unwrap();
        assert_eq!(lock.venue, Venue::Coinbase);

        service.release_provenance("BTC/USDT");
        assert!(service.locked_provenance("BTC/USDT").is_none());
    }
}
