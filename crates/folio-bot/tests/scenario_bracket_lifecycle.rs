//! End-to-end bracket lifecycle scenarios against the full cycle engine:
//! a trending long capture through TP1/TP2, and a choppy breakeven exit.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use folio_bot::config::BotConfig;
use folio_bot::engine::CycleEngine;
use folio_bot::ledger::StateLedger;
use folio_bot::pricing::source::ReplayDataSource;
use folio_bot::ScoredCandidate;
use folio_common::{DataQuality, FinalAction, Side, TickerResult, Venue};

fn ticker(symbol: &str, mid: Decimal) -> TickerResult {
    let half_spread = mid * dec!(0.0001);
    TickerResult {
        symbol: symbol.to_string(),
        bid: Some(mid - half_spread),
        ask: Some(mid + half_spread),
        last: mid,
        timestamp: Utc::now(),
        venue: Venue::Coinbase,
        data_quality: DataQuality::Ok,
        source: "coinbase_bid_ask_mid".to_string(),
    }
}

fn buy_candidate(symbol: &str) -> ScoredCandidate {
    ScoredCandidate {
        symbol: symbol.to_string(),
        final_action: FinalAction::Buy,
        composite_score: dec!(0.80),
        expected_move_bps: dec!(600),
        strategy: "momentum".to_string(),
        is_pilot: false,
        is_exploration: false,
    }
}

async fn engine_with_source(
    capital: Decimal,
) -> (CycleEngine, Arc<ReplayDataSource>) {
    let config = BotConfig {
        symbols: vec!["BTC/USDT".to_string()],
        ..BotConfig::default()
    };
    let ledger = StateLedger::connect(":memory:").await.unwrap();
    let source = Arc::new(ReplayDataSource::new());
    let engine = CycleEngine::new(
        config,
        ledger,
        source.clone(),
        "s1",
        capital,
        false,
        false,
    )
    .await
    .unwrap();
    (engine, source)
}

/// Conservation from first principles: the cash balance must equal the
/// initial capital plus every sell's net proceeds minus every buy's full
/// cost, reconstructed from the immutable trade log.
async fn assert_cash_conserves(ledger: &StateLedger, session: &str, initial: Decimal) {
    let trades = ledger.trades(session).await.unwrap();
    let mut expected_cash = initial;
    for trade in &trades {
        match trade.side {
            Side::Buy => expected_cash -= trade.notional + trade.fees,
            Side::Sell => expected_cash += trade.notional - trade.fees,
        }
    }
    let row = ledger.latest_cash_equity(session).await.unwrap().unwrap();
    let diff = (row.cash_balance - expected_cash).abs();
    assert!(
        diff <= dec!(0.50),
        "cash {} diverged from trade-log reconstruction {}",
        row.cash_balance,
        expected_cash
    );
}

#[tokio::test]
async fn scenario_trending_long_capture() {
    let initial = dec!(100000);
    let (mut engine, source) = engine_with_source(initial).await;

    // Cycle 1: fresh quote at $100,000; a BUY enters and gets a bracket.
    source.set_ticker(ticker("BTC/USDT", dec!(100000)));
    let report = engine.run_cycle(&[buy_candidate("BTC/USDT")]).await.unwrap();
    assert_eq!(report.routed, 1);
    assert_eq!(report.commit, Some("committed"));

    let ledger = engine.ledger().clone();
    let position = ledger.position("s1", "BTC/USDT").await.unwrap().unwrap();
    let entry_qty = position.quantity;
    assert!(entry_qty > Decimal::ZERO);
    // Sizing: 0.25% risk on $100k equity against a 4% stop distance.
    assert_eq!(entry_qty, dec!(0.0625));

    // Lots mirror the position exactly.
    let lots = ledger.lots("s1", "BTC/USDT").await.unwrap();
    let lot_qty: Decimal = lots.iter().map(|l| l.quantity_remaining).sum();
    assert_eq!(lot_qty, entry_qty);

    // Cycle 2: price reaches TP1 ($101,200 = entry + 0.6 * 2% risk unit).
    source.set_ticker(ticker("BTC/USDT", dec!(101200)));
    let report = engine.run_cycle(&[]).await.unwrap();
    assert_eq!(report.exit_fills, 1);
    assert_eq!(report.commit, Some("committed"));

    let position = ledger.position("s1", "BTC/USDT").await.unwrap().unwrap();
    assert_eq!(position.quantity, entry_qty * dec!(0.6));

    // TP1 realized a profit near 0.4*qty * (101200 - fill).
    let trades = ledger.trades("s1").await.unwrap();
    let tp1 = trades
        .iter()
        .find(|t| t.exit_reason.as_deref() == Some("take_profit_1"))
        .unwrap();
    assert!(tp1.realized_pnl.unwrap() > Decimal::ZERO);
    assert_eq!(tp1.effective_fill_price, dec!(101200));

    // Cycle 3: price reaches TP2 ($102,400).
    source.set_ticker(ticker("BTC/USDT", dec!(102400)));
    let report = engine.run_cycle(&[]).await.unwrap();
    assert_eq!(report.exit_fills, 1);
    assert_eq!(report.commit, Some("committed"));

    let position = ledger.position("s1", "BTC/USDT").await.unwrap().unwrap();
    assert_eq!(position.quantity, entry_qty * dec!(0.2));

    // Lot/position consistency held through partial exits.
    let lots = ledger.lots("s1", "BTC/USDT").await.unwrap();
    let lot_qty: Decimal = lots.iter().map(|l| l.quantity_remaining).sum();
    assert_eq!(lot_qty, position.quantity);

    // Equity identity at the final marks.
    let row = ledger.latest_cash_equity("s1").await.unwrap().unwrap();
    let positions_value = ledger.positions_value("s1").await.unwrap();
    assert!((row.total_equity - (row.cash_balance + positions_value)).abs() <= dec!(0.50));

    assert_cash_conserves(&ledger, "s1", initial).await;

    // Both realized exits were profitable and the session is up overall.
    assert!(row.total_realized_pnl > Decimal::ZERO);
    assert!(row.total_equity > initial);
}

#[tokio::test]
async fn scenario_choppy_breakeven_exit() {
    let initial = dec!(100000);
    let (mut engine, source) = engine_with_source(initial).await;

    // Entry at $100,000.
    source.set_ticker(ticker("BTC/USDT", dec!(100000)));
    engine.run_cycle(&[buy_candidate("BTC/USDT")]).await.unwrap();
    let ledger = engine.ledger().clone();
    let entry_qty = ledger
        .position("s1", "BTC/USDT")
        .await
        .unwrap()
        .unwrap()
        .quantity;

    // TP1 fills.
    source.set_ticker(ticker("BTC/USDT", dec!(101200)));
    let report = engine.run_cycle(&[]).await.unwrap();
    assert_eq!(report.exit_fills, 1);

    // Price collapses back to entry: the breakeven stop closes the rest.
    source.set_ticker(ticker("BTC/USDT", dec!(100000)));
    let report = engine.run_cycle(&[]).await.unwrap();
    assert_eq!(report.exit_fills, 1);
    assert_eq!(report.commit, Some("committed"));

    // Flat: no position row, no lots, zero positions value.
    assert!(ledger.position("s1", "BTC/USDT").await.unwrap().is_none());
    assert!(ledger.lots("s1", "BTC/USDT").await.unwrap().is_empty());
    assert_eq!(ledger.positions_value("s1").await.unwrap(), Decimal::ZERO);

    let trades = ledger.trades("s1").await.unwrap();
    let stop = trades
        .iter()
        .find(|t| t.exit_reason.as_deref() == Some("stop_loss"))
        .unwrap();
    assert_eq!(stop.quantity, entry_qty * dec!(0.6));

    // At a flat book, cash minus initial equals the summed realized P&L of
    // the exit trades exactly.
    let row = ledger.latest_cash_equity("s1").await.unwrap().unwrap();
    let realized: Decimal = trades.iter().filter_map(|t| t.realized_pnl).sum();
    assert!(((row.cash_balance - initial) - realized).abs() <= dec!(0.01));

    // Net outcome: TP1 gain minus exit friction leaves a small profit.
    assert!(row.total_realized_pnl > Decimal::ZERO);

    assert_cash_conserves(&ledger, "s1", initial).await;
}

#[tokio::test]
async fn scenario_time_stop_flattens_stale_position() {
    let initial = dec!(100000);
    let (mut engine, source) = engine_with_source(initial).await;

    source.set_ticker(ticker("BTC/USDT", dec!(100000)));
    engine.run_cycle(&[buy_candidate("BTC/USDT")]).await.unwrap();
    let ledger = engine.ledger().clone();

    // 48 drifting cycles that never reach TP1 or the stop.
    for _ in 0..48 {
        source.set_ticker(ticker("BTC/USDT", dec!(100300)));
        engine.run_cycle(&[]).await.unwrap();
    }

    // The time stop market-closed the whole position.
    assert!(ledger.position("s1", "BTC/USDT").await.unwrap().is_none());
    let trades = ledger.trades("s1").await.unwrap();
    assert!(trades
        .iter()
        .any(|t| t.exit_reason.as_deref() == Some("time_stop")));

    assert_cash_conserves(&ledger, "s1", initial).await;
}
