//! Per-cycle pricing snapshots.
//!
//! All valuation within one trading cycle (position mark-to-market, decision
//! mid-price, commit validation) reads from a single frozen `PricingSnapshot`
//! tagged with the cycle id. Mixing marks across snapshots produced phantom
//! equity in earlier iterations of this system; the snapshot id in commit
//! logs exists to make that impossible to miss.

pub mod service;
pub mod source;

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::debug;

use folio_common::{DataQuality, PositionSide, Venue};

pub use service::SnapshotService;
pub use source::{DataSourceError, MarketDataSource, ReplayDataSource};

/// Locked valuation source for a symbol: venue and price type, established
/// on first position entry and preserved until explicit fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceLock {
    pub venue: Venue,
    pub price_type: String,
    pub locked_at: DateTime<Utc>,
}

/// Price data for one symbol inside a snapshot.
#[derive(Debug, Clone)]
pub struct PriceData {
    pub price: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub mid: Option<Decimal>,
    pub venue: Venue,
    /// Price provenance, e.g. "coinbase_bid_ask_mid".
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub quality: DataQuality,
    /// Freshness guarantee expired; the mark is usable but ineligible for
    /// tight-latency decisions.
    pub stale: bool,
    pub stale_reason: Option<String>,
}

#[derive(Debug)]
struct HitTrack {
    last_log: Instant,
    coalesced: u64,
}

/// Frozen pricing snapshot for one trading cycle.
///
/// Contents never mutate after construction. A snapshot may be partial:
/// symbols whose fetch failed with no cached fallback are simply absent, and
/// downstream consumers skip them rather than abort.
#[derive(Debug)]
pub struct PricingSnapshot {
    id: u64,
    created_at: DateTime<Utc>,
    by_symbol: HashMap<String, PriceData>,
    /// Debounce window for repeated-read logging, milliseconds.
    debounce_ms: u64,
    hit_tracking: DashMap<String, HitTrack>,
}

impl PricingSnapshot {
    pub(crate) fn new(
        id: u64,
        by_symbol: HashMap<String, PriceData>,
        debounce_ms: u64,
    ) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            by_symbol,
            debounce_ms,
            hit_tracking: DashMap::new(),
        }
    }

    /// Snapshot id, tied to the cycle count. Monotonically increasing.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Number of symbols present. May be less than requested.
    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    /// Symbols present in this snapshot.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.by_symbol.keys().map(|s| s.as_str())
    }

    /// Full price data for a symbol.
    pub fn price_data(&self, symbol: &str) -> Option<&PriceData> {
        self.by_symbol.get(symbol)
    }

    /// Mark price for a symbol, with debounced access logging.
    ///
    /// The first read of a symbol always logs; repeated reads within the
    /// debounce window are coalesced into one `SNAPSHOT_HIT[xN]` line when
    /// the window rolls over.
    pub fn mark(&self, symbol: &str) -> Option<Decimal> {
        let data = self.by_symbol.get(symbol)?;
        self.log_hit(symbol, data.price);
        Some(data.price)
    }

    fn log_hit(&self, symbol: &str, price: Decimal) {
        let window = std::time::Duration::from_millis(self.debounce_ms);
        match self.hit_tracking.get_mut(symbol) {
            None => {
                debug!(
                    snapshot_id = self.id,
                    symbol = %symbol,
                    price = %price,
                    "SNAPSHOT_HIT"
                );
                self.hit_tracking.insert(
                    symbol.to_string(),
                    HitTrack {
                        last_log: Instant::now(),
                        coalesced: 0,
                    },
                );
            }
            Some(mut track) => {
                track.coalesced += 1;
                if track.last_log.elapsed() >= window {
                    debug!(
                        snapshot_id = self.id,
                        symbol = %symbol,
                        price = %price,
                        hits = track.coalesced,
                        "SNAPSHOT_HIT[xN]"
                    );
                    track.last_log = Instant::now();
                    track.coalesced = 0;
                }
            }
        }
    }

    /// Entry price for a symbol: bid/ask mid when available, else the mark.
    pub fn entry_price(&self, symbol: &str) -> Option<Decimal> {
        let data = self.by_symbol.get(symbol)?;
        Some(data.mid.unwrap_or(data.price))
    }

    /// Exit valuation for a position: bid for longs (what a sell realizes),
    /// ask for shorts (what a buy-back costs), falling back to mid then mark.
    pub fn exit_value(&self, symbol: &str, side: PositionSide) -> Option<Decimal> {
        let data = self.by_symbol.get(symbol)?;
        let preferred = match side {
            PositionSide::Long => data.bid,
            PositionSide::Short => data.ask,
        };
        Some(preferred.or(data.mid).unwrap_or(data.price))
    }

    /// Mark prices for every symbol in the snapshot.
    pub fn mark_map(&self) -> HashMap<String, Decimal> {
        self.by_symbol
            .iter()
            .map(|(symbol, data)| (symbol.clone(), data.price))
            .collect()
    }

    /// Snapshot age in milliseconds.
    pub fn staleness_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price_data(price: Decimal, bid: Decimal, ask: Decimal) -> PriceData {
        PriceData {
            price,
            bid: Some(bid),
            ask: Some(ask),
            mid: Some((bid + ask) / Decimal::TWO),
            venue: Venue::Coinbase,
            source: "coinbase_bid_ask_mid".to_string(),
            timestamp: Utc::now(),
            quality: DataQuality::Ok,
            stale: false,
            stale_reason: None,
        }
    }

    fn snapshot() -> PricingSnapshot {
        let mut by_symbol = HashMap::new();
        by_symbol.insert(
            "BTC/USDT".to_string(),
            price_data(dec!(100000), dec!(99990), dec!(100010)),
        );
        PricingSnapshot::new(7, by_symbol, 300)
    }

    #[test]
    fn test_mark_lookup() {
        let snap = snapshot();
        assert_eq!(snap.id(), 7);
        assert_eq!(snap.mark("BTC/USDT"), Some(dec!(100000)));
        assert_eq!(snap.mark("ETH/USDT"), None);
    }

    #[test]
    fn test_repeated_reads_identical() {
        let snap = snapshot();
        let first = snap.mark("BTC/USDT");
        for _ in 0..100 {
            assert_eq!(snap.mark("BTC/USDT"), first);
        }
    }

    #[test]
    fn test_entry_price_prefers_mid() {
        let snap = snapshot();
        assert_eq!(snap.entry_price("BTC/USDT"), Some(dec!(100000)));
    }

    #[test]
    fn test_exit_value_by_side() {
        let snap = snapshot();
        assert_eq!(
            snap.exit_value("BTC/USDT", PositionSide::Long),
            Some(dec!(99990))
        );
        assert_eq!(
            snap.exit_value("BTC/USDT", PositionSide::Short),
            Some(dec!(100010))
        );
    }

    #[test]
    fn test_partial_snapshot_is_not_a_failure() {
        let snap = PricingSnapshot::new(1, HashMap::new(), 300);
        assert!(snap.is_empty());
        assert_eq!(snap.mark("BTC/USDT"), None);
    }
}
