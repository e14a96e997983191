//! Decision pipeline: from scored candidate to routed order or skip.
//!
//! Gates run in a fixed order and short-circuit on the first rejection:
//!
//! 1. Data quality (snapshot entry present, quality acceptable)
//! 2. Venue support
//! 3. L2 freshness (bid/ask present, uncrossed, young enough, right venue)
//! 4. Spread and edge after costs
//! 5. Direction (the deterministic action router)
//! 6. Entry score thresholds
//!
//! Every rejection emits a single structured `DECISION_TRACE` line with the
//! reason code and the quantitative evidence behind it.

pub mod router;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use folio_common::{resolve_venue, spread_bps, DataQuality, FinalAction, PositionSide, Side};

use crate::config::BotConfig;
use crate::ledger::PositionRecord;
use crate::pricing::{PriceData, PricingSnapshot};
use router::{route_action, OrderIntent, RouteContext, RoutedSide};

/// A scored candidate handed in by the signal layer.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub symbol: String,
    pub final_action: FinalAction,
    /// Composite signal score in [0, 1].
    pub composite_score: Decimal,
    /// Expected favorable move from signal metadata, in bps.
    pub expected_move_bps: Decimal,
    pub strategy: String,
    pub is_pilot: bool,
    pub is_exploration: bool,
}

/// A fully routed order ready for sizing.
#[derive(Debug, Clone)]
pub struct RoutedOrder {
    pub symbol: String,
    pub side: Side,
    pub intent: OrderIntent,
    pub reason: &'static str,
    /// Decision entry price (snapshot bid/ask mid).
    pub entry_price: Decimal,
    /// Edge after costs, bps.
    pub edge_bps: Decimal,
    pub composite_score: Decimal,
    pub strategy: String,
    /// Optional size hint (used by pyramiding adds); the sizer decides.
    pub size_hint: Option<Decimal>,
}

/// One skip, with the evidence that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionTrace {
    pub snapshot_id: u64,
    pub symbol: String,
    pub action: String,
    pub reason: String,
    pub score: Decimal,
    pub spread_bps: Option<Decimal>,
    pub quote_age_ms: Option<i64>,
    pub edge_bps: Option<Decimal>,
}

/// Outcome of the pipeline for one candidate.
#[derive(Debug)]
pub enum Decision {
    Route(RoutedOrder),
    Skip(DecisionTrace),
}

impl Decision {
    pub fn is_skip(&self) -> bool {
        matches!(self, Decision::Skip(_))
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match self {
            Decision::Skip(trace) => Some(&trace.reason),
            Decision::Route(_) => None,
        }
    }
}

/// The gate pipeline. Holds only configuration; all state comes in per call.
#[derive(Debug, Clone)]
pub struct DecisionPipeline {
    config: BotConfig,
}

impl DecisionPipeline {
    pub fn new(config: BotConfig) -> Self {
        Self { config }
    }

    /// Run a candidate through every gate against a frozen snapshot.
    pub fn decide(
        &self,
        candidate: &ScoredCandidate,
        snapshot: &PricingSnapshot,
        position: Option<&PositionRecord>,
        now: DateTime<Utc>,
    ) -> Decision {
        let mut evidence = Evidence::default();

        // Gate 1: data quality.
        let data = match snapshot.price_data(&candidate.symbol) {
            None => return self.skip(candidate, snapshot, "data_quality:missing", &evidence),
            Some(data) => data,
        };
        match data.quality {
            DataQuality::Ok | DataQuality::Stale => {}
            DataQuality::Missing => {
                return self.skip(candidate, snapshot, "data_quality:missing", &evidence)
            }
            DataQuality::Unsupported => {
                return self.skip(candidate, snapshot, "data_quality:unsupported", &evidence)
            }
        }

        // Gate 2: venue support.
        let mapping = match resolve_venue(&candidate.symbol) {
            None => return self.skip(candidate, snapshot, "unsupported_by_venue", &evidence),
            Some(mapping) => mapping,
        };

        // Gate 3: L2 freshness.
        if let Some(reason) = self.freshness_rejection(data, mapping.venue, now, &mut evidence) {
            return self.skip(candidate, snapshot, reason, &evidence);
        }

        // Gate 4: spread and edge after costs.
        let (bid, ask) = (data.bid.unwrap_or_default(), data.ask.unwrap_or_default());
        let spread = match spread_bps(bid, ask) {
            None => return self.skip(candidate, snapshot, "stale_tick:crossed_book", &evidence),
            Some(spread) => spread,
        };
        evidence.spread_bps = Some(spread);
        if spread > self.config.market_data.max_spread_bps {
            return self.skip(candidate, snapshot, "spread_too_wide", &evidence);
        }

        let fee_bps = self.effective_fee_bps(mapping.venue);
        let edge = candidate.expected_move_bps - (spread + Decimal::TWO * fee_bps);
        evidence.edge_bps = Some(edge);
        if edge < self.config.market_data.min_edge_bps {
            return self.skip(candidate, snapshot, "insufficient_edge", &evidence);
        }

        // Gate 5: direction.
        let ctx = RouteContext {
            has_position: position.is_some(),
            position_side: position.and_then(|p| PositionSide::from_signed_qty(p.quantity)),
            shorting_allowed: self.config.shorting_allowed(&candidate.symbol),
            is_pilot: candidate.is_pilot,
            is_exploration: candidate.is_exploration,
        };
        let (routed, intent, reason) = route_action(candidate.final_action, &ctx);
        let side = match routed {
            RoutedSide::Skip => return self.skip(candidate, snapshot, reason, &evidence),
            RoutedSide::Order(side) => side,
        };
        info!(
            symbol = %candidate.symbol,
            action = %candidate.final_action,
            side = %side,
            intent = %intent,
            reason = %reason,
            "ACTION_ROUTE"
        );

        // Gate 6: entry score thresholds. Exits and risk management are
        // never score-gated; a position must always be closable.
        if !matches!(intent, OrderIntent::Exit | OrderIntent::RiskManagement) {
            if candidate.composite_score < self.config.risk.hard_floor_min {
                return self.skip(candidate, snapshot, "score_below_floor", &evidence);
            }
            if intent == OrderIntent::Normal
                && candidate.composite_score < self.config.risk.effective_threshold
            {
                return self.skip(candidate, snapshot, "score_below_threshold", &evidence);
            }
        }

        let entry_price = data.mid.unwrap_or(data.price);
        Decision::Route(RoutedOrder {
            symbol: candidate.symbol.clone(),
            side,
            intent,
            reason,
            entry_price,
            edge_bps: edge,
            composite_score: candidate.composite_score,
            strategy: candidate.strategy.clone(),
            size_hint: None,
        })
    }

    fn freshness_rejection(
        &self,
        data: &PriceData,
        planned_venue: folio_common::Venue,
        now: DateTime<Utc>,
        evidence: &mut Evidence,
    ) -> Option<&'static str> {
        let md = &self.config.market_data;

        if md.require_l2_mid && (data.bid.is_none() || data.ask.is_none()) {
            return Some("stale_tick:l2_missing");
        }
        if let (Some(bid), Some(ask)) = (data.bid, data.ask) {
            if bid <= Decimal::ZERO || ask <= bid {
                return Some("stale_tick:crossed_book");
            }
        }
        if data.stale {
            return Some("stale_tick:stale_mark");
        }
        let age_ms = (now - data.timestamp).num_milliseconds().max(0);
        evidence.quote_age_ms = Some(age_ms);
        if age_ms > md.max_quote_age_ms {
            return Some("stale_tick:quote_age");
        }
        if data.venue != planned_venue {
            return Some("stale_tick:venue_mismatch");
        }
        None
    }

    /// Fee basis for the edge gate: taker for worst case; maker only when
    /// post-only routing cannot fall back to taker.
    fn effective_fee_bps(&self, venue: folio_common::Venue) -> Decimal {
        let ex = &self.config.execution;
        if ex.post_only && !ex.allow_taker_fallback {
            ex.fees.maker_bps(venue)
        } else {
            ex.fees.taker_bps(venue)
        }
    }

    fn skip(
        &self,
        candidate: &ScoredCandidate,
        snapshot: &PricingSnapshot,
        reason: &str,
        evidence: &Evidence,
    ) -> Decision {
        let trace = DecisionTrace {
            snapshot_id: snapshot.id(),
            symbol: candidate.symbol.clone(),
            action: candidate.final_action.to_string(),
            reason: reason.to_string(),
            score: candidate.composite_score,
            spread_bps: evidence.spread_bps,
            quote_age_ms: evidence.quote_age_ms,
            edge_bps: evidence.edge_bps,
        };
        info!(
            snapshot_id = trace.snapshot_id,
            symbol = %trace.symbol,
            action = %trace.action,
            reason = %trace.reason,
            score = %trace.score,
            spread_bps = ?trace.spread_bps,
            quote_age_ms = ?trace.quote_age_ms,
            edge_bps = ?trace.edge_bps,
            "DECISION_TRACE"
        );
        Decision::Skip(trace)
    }
}

#[derive(Debug, Default)]
struct Evidence {
    spread_bps: Option<Decimal>,
    quote_age_ms: Option<i64>,
    edge_bps: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_common::Venue;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn fresh_data(price: Decimal, spread: Decimal, timestamp: DateTime<Utc>) -> PriceData {
        let half = spread / Decimal::TWO;
        PriceData {
            price,
            bid: Some(price - half),
            ask: Some(price + half),
            mid: Some(price),
            venue: Venue::Coinbase,
            source: "coinbase_bid_ask_mid".to_string(),
            timestamp,
            quality: DataQuality::Ok,
            stale: false,
            stale_reason: None,
        }
    }

    fn snapshot_with(symbol: &str, data: PriceData) -> PricingSnapshot {
        let mut by_symbol = HashMap::new();
        by_symbol.insert(symbol.to_string(), data);
        PricingSnapshot::new(1, by_symbol, 300)
    }

    fn candidate(symbol: &str, action: FinalAction) -> ScoredCandidate {
        ScoredCandidate {
            symbol: symbol.to_string(),
            final_action: action,
            composite_score: dec!(0.80),
            expected_move_bps: dec!(60),
            strategy: "momentum".to_string(),
            is_pilot: false,
            is_exploration: false,
        }
    }

    fn pipeline() -> DecisionPipeline {
        DecisionPipeline::new(BotConfig::default())
    }

    fn position(symbol: &str, qty: Decimal) -> PositionRecord {
        PositionRecord {
            symbol: symbol.to_string(),
            quantity: qty,
            entry_price: dec!(100000),
            current_price: dec!(100000),
            value: qty * dec!(100000),
            unrealized_pnl: Decimal::ZERO,
            strategy: "momentum".to_string(),
            session_id: "s1".to_string(),
        }
    }

    #[test]
    fn test_clean_buy_routes() {
        let now = Utc::now();
        let snap = snapshot_with("BTC/USDT", fresh_data(dec!(100000), dec!(10), now));
        let decision = pipeline().decide(&candidate("BTC/USDT", FinalAction::Buy), &snap, None, now);

        match decision {
            Decision::Route(order) => {
                assert_eq!(order.side, Side::Buy);
                assert_eq!(order.intent, OrderIntent::Normal);
                assert_eq!(order.reason, "open_long");
                assert_eq!(order.entry_price, dec!(100000));
                // spread 1 bps, taker 6 bps: edge = 60 - (1 + 12) = 47
                assert_eq!(order.edge_bps, dec!(47));
            }
            Decision::Skip(trace) => panic!("unexpected skip: {}", trace.reason),
        }
    }

    #[test]
    fn test_missing_snapshot_entry_skips() {
        let now = Utc::now();
        let snap = snapshot_with("BTC/USDT", fresh_data(dec!(100000), dec!(10), now));
        let decision = pipeline().decide(&candidate("ETH/USDT", FinalAction::Buy), &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("data_quality:missing"));
    }

    #[test]
    fn test_unmapped_symbol_skips() {
        let now = Utc::now();
        let snap = snapshot_with("FAKE/USDT", fresh_data(dec!(5), dec!(0.001), now));
        let decision = pipeline().decide(&candidate("FAKE/USDT", FinalAction::Buy), &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("unsupported_by_venue"));
    }

    #[test]
    fn test_stale_mark_skips() {
        // S4: a stale ETH entry skips with a stale_tick reason while fresh
        // BTC in the same snapshot proceeds.
        let now = Utc::now();
        let mut by_symbol = HashMap::new();
        by_symbol.insert("BTC/USDT".to_string(), fresh_data(dec!(100000), dec!(10), now));
        let mut eth = fresh_data(dec!(3000), dec!(0.5), now - chrono::Duration::milliseconds(2000));
        eth.stale = true;
        eth.quality = DataQuality::Stale;
        by_symbol.insert("ETH/USDT".to_string(), eth);
        let snap = PricingSnapshot::new(4, by_symbol, 300);

        let pipeline = pipeline();
        let eth_decision = pipeline.decide(&candidate("ETH/USDT", FinalAction::Buy), &snap, None, now);
        assert_eq!(eth_decision.skip_reason(), Some("stale_tick:stale_mark"));

        let btc_decision = pipeline.decide(&candidate("BTC/USDT", FinalAction::Buy), &snap, None, now);
        assert!(!btc_decision.is_skip());
    }

    #[test]
    fn test_old_quote_skips() {
        let now = Utc::now();
        let data = fresh_data(
            dec!(100000),
            dec!(10),
            now - chrono::Duration::milliseconds(2000),
        );
        let snap = snapshot_with("BTC/USDT", data);
        let decision = pipeline().decide(&candidate("BTC/USDT", FinalAction::Buy), &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("stale_tick:quote_age"));
    }

    #[test]
    fn test_missing_l2_skips() {
        let now = Utc::now();
        let mut data = fresh_data(dec!(100000), dec!(10), now);
        data.bid = None;
        let snap = snapshot_with("BTC/USDT", data);
        let decision = pipeline().decide(&candidate("BTC/USDT", FinalAction::Buy), &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("stale_tick:l2_missing"));
    }

    #[test]
    fn test_crossed_book_skips() {
        let now = Utc::now();
        let mut data = fresh_data(dec!(100000), dec!(10), now);
        data.bid = Some(dec!(100010));
        data.ask = Some(dec!(100000));
        let snap = snapshot_with("BTC/USDT", data);
        let decision = pipeline().decide(&candidate("BTC/USDT", FinalAction::Buy), &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("stale_tick:crossed_book"));
    }

    #[test]
    fn test_wide_spread_skips() {
        let now = Utc::now();
        // 50 bps spread against a 25 bps limit.
        let data = fresh_data(dec!(100000), dec!(500), now);
        let snap = snapshot_with("BTC/USDT", data);
        let decision = pipeline().decide(&candidate("BTC/USDT", FinalAction::Buy), &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("spread_too_wide"));
    }

    #[test]
    fn test_insufficient_edge_skips() {
        let now = Utc::now();
        let snap = snapshot_with("BTC/USDT", fresh_data(dec!(100000), dec!(10), now));
        let mut weak = candidate("BTC/USDT", FinalAction::Buy);
        // spread 1 + 2*6 fees = 13 bps of cost; 20 - 13 = 7 < 10 minimum.
        weak.expected_move_bps = dec!(20);
        let decision = pipeline().decide(&weak, &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("insufficient_edge"));
    }

    #[test]
    fn test_sell_no_position_shorting_disabled() {
        // S3: SELL with no position and shorting disabled: skip, no fill.
        let now = Utc::now();
        let snap = snapshot_with("BTC/USDT", fresh_data(dec!(100000), dec!(10), now));
        let decision =
            pipeline().decide(&candidate("BTC/USDT", FinalAction::Sell), &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("shorting_disabled"));
    }

    #[test]
    fn test_sell_with_long_routes_exit() {
        let now = Utc::now();
        let snap = snapshot_with("BTC/USDT", fresh_data(dec!(100000), dec!(10), now));
        let long = position("BTC/USDT", dec!(0.01));
        let decision = pipeline().decide(
            &candidate("BTC/USDT", FinalAction::Sell),
            &snap,
            Some(&long),
            now,
        );
        match decision {
            Decision::Route(order) => {
                assert_eq!(order.side, Side::Sell);
                assert_eq!(order.intent, OrderIntent::Exit);
                assert_eq!(order.reason, "close_long");
            }
            Decision::Skip(trace) => panic!("unexpected skip: {}", trace.reason),
        }
    }

    #[test]
    fn test_exit_not_score_gated() {
        let now = Utc::now();
        let snap = snapshot_with("BTC/USDT", fresh_data(dec!(100000), dec!(10), now));
        let long = position("BTC/USDT", dec!(0.01));
        let mut weak = candidate("BTC/USDT", FinalAction::Sell);
        weak.composite_score = dec!(0.05);
        let decision = pipeline().decide(&weak, &snap, Some(&long), now);
        assert!(!decision.is_skip());
    }

    #[test]
    fn test_low_score_entry_skips() {
        let now = Utc::now();
        let snap = snapshot_with("BTC/USDT", fresh_data(dec!(100000), dec!(10), now));

        let mut below_floor = candidate("BTC/USDT", FinalAction::Buy);
        below_floor.composite_score = dec!(0.10);
        let decision = pipeline().decide(&below_floor, &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("score_below_floor"));

        let mut below_threshold = candidate("BTC/USDT", FinalAction::Buy);
        below_threshold.composite_score = dec!(0.40);
        let decision = pipeline().decide(&below_threshold, &snap, None, now);
        assert_eq!(decision.skip_reason(), Some("score_below_threshold"));

        // Pilot entries bypass the effective threshold, not the hard floor.
        let mut pilot = candidate("BTC/USDT", FinalAction::Buy);
        pilot.composite_score = dec!(0.40);
        pilot.is_pilot = true;
        let decision = pipeline().decide(&pilot, &snap, None, now);
        assert!(!decision.is_skip());
    }
}
