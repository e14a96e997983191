//! The per-cycle orchestrator.
//!
//! One cycle runs to completion before the next starts: pricing snapshot,
//! mark-to-market, bracket tick, decisions, sizing, simulated fills, then a
//! single staged commit validated against the same snapshot. The engine is
//! the only caller of mutating ledger operations, and the cycle loop is the
//! top-level error boundary: component failures arrive as tagged results and
//! turn into per-symbol skips or a discarded transaction, never a crash.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{debug, info, warn};

use folio_common::{resolve_venue, PositionSide, Side};

use crate::brackets::{route_entry, BracketEngine, EntryPlan, ExitInstruction, ExitKind};
use crate::budget::ExplorationBudget;
use crate::config::BotConfig;
use crate::decision::router::OrderIntent;
use crate::decision::{Decision, DecisionPipeline, RoutedOrder, ScoredCandidate};
use crate::fills::{Fill, FillParams, FillSimulator};
use crate::ledger::{LedgerError, PositionRecord, SessionStatus, StateLedger, TradeRecord};
use crate::portfolio::transaction::{
    CommitOutcome, PortfolioTransaction, TransactionError,
};
use crate::pricing::source::MarketDataSource;
use crate::pricing::{PricingSnapshot, SnapshotService};
use crate::sizing::atr::AtrService;
use crate::sizing::{PositionSizer, SizeRequest, SizingError};
use crate::stats::SessionStats;

/// Candle history depth fetched per symbol per cycle.
const CANDLE_LOOKBACK: usize = 32;

/// Errors that abort a cycle (not just a symbol).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub snapshot_symbols: usize,
    pub routed: usize,
    pub skipped: usize,
    pub exit_fills: usize,
    /// None when nothing was staged this cycle.
    pub commit: Option<&'static str>,
    pub equity: Decimal,
}

#[derive(Debug, Clone)]
struct PyramidState {
    initial_qty: Decimal,
    adds_done: u32,
}

/// The cycle engine: owns every component and the session it drives.
pub struct CycleEngine {
    config: BotConfig,
    session_id: String,
    ledger: StateLedger,
    snapshots: SnapshotService,
    source: Arc<dyn MarketDataSource>,
    pipeline: DecisionPipeline,
    sizer: PositionSizer,
    atr: AtrService,
    brackets: BracketEngine,
    fills: FillSimulator,
    budget: ExplorationBudget,
    stats: SessionStats,
    cycle_count: u64,
    /// Symbol -> cycle index until which entries stay blocked after a stop.
    sl_cooldown_until: HashMap<String, u64>,
    pyramids: HashMap<String, PyramidState>,
}

impl CycleEngine {
    /// Build an engine and open (or resume) its session.
    pub async fn new(
        config: BotConfig,
        ledger: StateLedger,
        source: Arc<dyn MarketDataSource>,
        session_id: &str,
        capital: Decimal,
        continue_session: bool,
        override_capital: bool,
    ) -> Result<Self, EngineError> {
        let existing = ledger.get_session(session_id).await?;
        match (&existing, continue_session) {
            (None, _) => {
                ledger.open_session(session_id, capital).await?;
            }
            (Some(_), true) => {
                info!(session_id = %session_id, "Resuming existing session");
                if override_capital {
                    let row = ledger
                        .latest_cash_equity(session_id)
                        .await?
                        .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
                    let delta = capital - row.cash_balance;
                    warn!(
                        session_id = %session_id,
                        old_cash = %row.cash_balance,
                        new_cash = %capital,
                        "Overriding session capital"
                    );
                    if delta >= Decimal::ZERO {
                        ledger.credit_cash(session_id, delta, Decimal::ZERO).await?;
                    } else {
                        ledger.debit_cash(session_id, -delta, Decimal::ZERO).await?;
                    }
                }
            }
            (Some(_), false) => {
                // Duplicate session-init is a programming error; surface it.
                return Err(EngineError::Ledger(LedgerError::SessionExists(
                    session_id.to_string(),
                )));
            }
        }

        let starting_equity = ledger
            .latest_cash_equity(session_id)
            .await?
            .map(|row| row.total_equity)
            .unwrap_or(capital);

        let snapshots = SnapshotService::new(
            Arc::clone(&source),
            config.market_data.retry_base_ms,
            config.market_data.snapshot_debounce_ms,
        );
        let pipeline = DecisionPipeline::new(config.clone());
        let sizer = PositionSizer::new(config.sizing.clone());
        let brackets = BracketEngine::new(&config.realization, config.risk.bracket_risk_pct);
        let fills = FillSimulator::new(
            config.execution.fees.clone(),
            config.execution.slippage.clone(),
        );
        let budget = ExplorationBudget::new(config.exploration.clone());

        Ok(Self {
            session_id: session_id.to_string(),
            ledger,
            snapshots,
            source,
            pipeline,
            sizer,
            atr: AtrService::default(),
            brackets,
            fills,
            budget,
            stats: SessionStats::new(starting_equity),
            cycle_count: 0,
            sl_cooldown_until: HashMap::new(),
            pyramids: HashMap::new(),
            config,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn ledger(&self) -> &StateLedger {
        &self.ledger
    }

    /// Run one full cycle with the given scored candidates.
    pub async fn run_cycle(
        &mut self,
        candidates: &[ScoredCandidate],
    ) -> Result<CycleReport, EngineError> {
        self.cycle_count += 1;
        self.stats.record_cycle();
        let cycle_id = self.cycle_count;

        // 1. Symbol universe: configured symbols, open positions, candidates.
        let mut symbols = self.config.symbols.clone();
        for position in self.ledger.positions(&self.session_id).await? {
            if !symbols.contains(&position.symbol) {
                symbols.push(position.symbol.clone());
            }
        }
        for candidate in candidates {
            if !symbols.contains(&candidate.symbol) {
                symbols.push(candidate.symbol.clone());
            }
        }

        // 2. One frozen snapshot for the whole cycle.
        let snapshot = self.snapshots.create_snapshot(cycle_id, &symbols).await;

        // 3. ATR history for candidate symbols.
        for candidate in candidates {
            let candles = self.source.candles(&candidate.symbol, CANDLE_LOOKBACK).await;
            if !candles.is_empty() {
                self.atr.update(&candidate.symbol, candles);
            }
        }

        // 4. Mark-to-market against this snapshot, so the transaction's
        //    previous equity is valued at the same marks it commits under.
        self.ledger
            .mark_to_market(&self.session_id, &snapshot.mark_map())
            .await?;

        // 5. One staged transaction for the cycle's fills.
        let mut tx = PortfolioTransaction::begin(
            &self.ledger,
            &self.session_id,
            cycle_id,
            self.config.analytics.commit_base_epsilon,
        )
        .await?;

        // 6. Bracket exits first: risk management outranks new entries.
        let mut exit_fills = 0usize;
        for symbol in self.brackets.active_symbols() {
            let mark = match snapshot.mark(&symbol) {
                Some(mark) => mark,
                None => continue,
            };
            for instruction in self.brackets.tick(&symbol, mark) {
                self.apply_exit(&mut tx, &snapshot, &instruction);
                exit_fills += 1;
            }
        }

        // 7. Decisions.
        let mut routed = 0usize;
        let mut skipped = 0usize;
        for candidate in candidates {
            self.stats.record_decision();
            let position = self.effective_position(&tx, &candidate.symbol).await?;
            let decision =
                self.pipeline
                    .decide(candidate, &snapshot, position.as_ref(), Utc::now());

            match decision {
                Decision::Skip(trace) => {
                    if trace.reason == "already_long_no_pyramid"
                        && self.config.risk.allow_pyramids
                    {
                        if self.try_pyramid_add(&mut tx, &snapshot, candidate) {
                            routed += 1;
                            continue;
                        }
                    }
                    skipped += 1;
                    self.stats.record_skip();
                }
                Decision::Route(order) => {
                    if order.intent == OrderIntent::Exit {
                        if self.apply_strategy_exit(&mut tx, &snapshot, &order) {
                            routed += 1;
                        } else {
                            skipped += 1;
                            self.stats.record_skip();
                        }
                    } else if self.apply_entry(&mut tx, &snapshot, candidate, &order) {
                        routed += 1;
                    } else {
                        skipped += 1;
                        self.stats.record_skip();
                    }
                }
            }
        }

        // 8. Commit the cycle's staged state against the same snapshot.
        let commit = if tx.is_dirty() {
            let staged_trades = exit_fills + routed;
            let outcome = tx.commit(&self.ledger, &snapshot.mark_map()).await?;
            let label = match &outcome {
                CommitOutcome::Committed(report) => {
                    self.stats
                        .record_commit(report.fees, report.realized_delta);
                    self.stats.record_trades(staged_trades as u64);
                    "committed"
                }
                CommitOutcome::Reconciled(report) => {
                    self.stats
                        .record_commit(report.fees, report.realized_delta);
                    self.stats.record_reconcile();
                    self.stats.record_trades(staged_trades as u64);
                    "reconciled"
                }
                CommitOutcome::Discarded(_) => {
                    self.stats.record_discard(staged_trades as u64);
                    "discarded"
                }
            };
            Some(label)
        } else {
            tx.discard("nothing_staged");
            None
        };

        // 9. NAV validation against the same snapshot id.
        let equity = self.nav_check(&snapshot).await?;
        self.stats.observe_equity(equity);

        info!(
            cycle = cycle_id,
            snapshot_id = snapshot.id(),
            symbols = snapshot.len(),
            routed,
            skipped,
            exit_fills,
            commit = ?commit,
            equity = %equity,
            "Cycle complete"
        );

        Ok(CycleReport {
            cycle_id,
            snapshot_symbols: snapshot.len(),
            routed,
            skipped,
            exit_fills,
            commit,
            equity,
        })
    }

    /// Flush state and close out the session.
    ///
    /// Any staged-but-uncommitted transaction was already dropped by the time
    /// this runs; persist one final marked cash/equity row and mark the
    /// session completed.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let positions = self.ledger.positions(&self.session_id).await?;
        let marks: HashMap<String, Decimal> = positions
            .iter()
            .map(|p| (p.symbol.clone(), p.current_price))
            .collect();
        self.ledger.mark_to_market(&self.session_id, &marks).await?;
        self.ledger
            .set_session_status(&self.session_id, SessionStatus::Completed)
            .await?;
        self.stats.log_summary();
        info!(session_id = %self.session_id, "Session closed");
        Ok(())
    }

    // =========================================================================
    // Fills
    // =========================================================================

    fn apply_exit(
        &mut self,
        tx: &mut PortfolioTransaction,
        snapshot: &PricingSnapshot,
        instruction: &ExitInstruction,
    ) {
        let symbol = &instruction.symbol;
        let mark = snapshot.mark(symbol).unwrap_or_default();
        let venue = resolve_venue(symbol)
            .map(|m| m.venue)
            .unwrap_or(self.config.execution.venue);

        // TP limits fill as resting makers at their limit price; stop and
        // time-stop exits cross the book as takers. A triggered stop fills at
        // the worse of its trigger and the cycle mark.
        let (fill_base, is_market, is_maker) = match instruction.limit_price {
            Some(limit) if !matches!(instruction.kind, ExitKind::StopLoss) => (limit, false, true),
            Some(limit) => {
                let adverse = match instruction.side {
                    Side::Sell => limit.min(mark),
                    Side::Buy => limit.max(mark),
                };
                (adverse.max(Decimal::ZERO), true, false)
            }
            None => (mark, true, false),
        };

        let fill = self.fills.simulate(&FillParams {
            symbol: symbol.clone(),
            venue,
            side: instruction.side,
            quantity: instruction.quantity,
            mark_price: fill_base,
            is_market,
            is_maker,
        });

        let closing_side = match instruction.side {
            Side::Sell => PositionSide::Long,
            Side::Buy => PositionSide::Short,
        };
        self.stage_exit_fill(tx, snapshot, &fill, closing_side, instruction.reason);
        self.brackets
            .on_exit_filled(symbol, instruction.kind, instruction.quantity);

        if matches!(instruction.kind, ExitKind::StopLoss) {
            let until = self.cycle_count + self.config.risk.sl_cooldown_cycles;
            self.sl_cooldown_until.insert(symbol.clone(), until);
            debug!(symbol = %symbol, until_cycle = until, "Stop-loss cooldown armed");
        }

        if tx.staged_qty(symbol).abs() <= dec!(0.00000001) {
            self.snapshots.release_provenance(symbol);
            self.pyramids.remove(symbol);
        }
    }

    fn stage_exit_fill(
        &self,
        tx: &mut PortfolioTransaction,
        snapshot: &PricingSnapshot,
        fill: &Fill,
        closing_side: PositionSide,
        reason: &str,
    ) {
        let consume = match tx.stage_lot_consumption(
            &fill.symbol,
            fill.quantity,
            fill.effective_fill_price,
            fill.fees,
            closing_side,
        ) {
            Ok(consume) => consume,
            Err(err) => {
                // Lots out of sync with the position: stage nothing for this
                // exit and let commit-side validation surface the state.
                warn!(symbol = %fill.symbol, error = %err, "Exit fill dropped: lot consumption failed");
                return;
            }
        };

        let qty_delta = match closing_side {
            PositionSide::Long => -fill.quantity,
            PositionSide::Short => fill.quantity,
        };
        let mark = snapshot.mark(&fill.symbol).unwrap_or(fill.mark_price);
        tx.stage_cash_delta(fill.cash_delta_ex_fees(), fill.fees);
        tx.stage_slippage_cost(fill.slippage_cost);
        tx.stage_position_delta(&fill.symbol, qty_delta, None, mark, None);
        tx.stage_realized_pnl_delta(consume.realized_pnl);
        tx.stage_trade(TradeRecord {
            trade_id: fill.fill_id.clone(),
            session_id: self.session_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            quantity: fill.quantity,
            mark_price: fill.mark_price,
            effective_fill_price: fill.effective_fill_price,
            slippage_bps: fill.slippage_bps,
            fee_bps: fill.fee_bps,
            fees: fill.fees,
            notional: fill.notional,
            strategy: "risk".to_string(),
            exit_reason: Some(reason.to_string()),
            realized_pnl: Some(consume.realized_pnl),
            executed_at: fill.executed_at,
        });
    }

    fn apply_strategy_exit(
        &mut self,
        tx: &mut PortfolioTransaction,
        snapshot: &PricingSnapshot,
        order: &RoutedOrder,
    ) -> bool {
        let symbol = &order.symbol;
        let qty = tx.staged_qty(symbol).abs();
        if qty <= dec!(0.00000001) {
            return false;
        }
        let mark = match snapshot.mark(symbol) {
            Some(mark) => mark,
            None => return false,
        };
        let venue = resolve_venue(symbol)
            .map(|m| m.venue)
            .unwrap_or(self.config.execution.venue);

        let fill = self.fills.simulate(&FillParams {
            symbol: symbol.clone(),
            venue,
            side: order.side,
            quantity: qty,
            mark_price: mark,
            is_market: true,
            is_maker: false,
        });

        let closing_side = match order.side {
            Side::Sell => PositionSide::Long,
            Side::Buy => PositionSide::Short,
        };
        self.stage_exit_fill(tx, snapshot, &fill, closing_side, order.reason);

        // The position left through the strategy path; the bracket's OCO
        // group must shrink (to zero here) with it.
        self.brackets.on_external_reduction(symbol, tx.staged_qty(symbol));
        self.snapshots.release_provenance(symbol);
        self.pyramids.remove(symbol);
        true
    }

    fn apply_entry(
        &mut self,
        tx: &mut PortfolioTransaction,
        snapshot: &PricingSnapshot,
        candidate: &ScoredCandidate,
        order: &RoutedOrder,
    ) -> bool {
        let symbol = &order.symbol;

        // Stop-loss cooldown (entries only).
        if let Some(until) = self.sl_cooldown_until.get(symbol) {
            if self.cycle_count < *until {
                self.trace_skip(snapshot, candidate, "sl_cooldown");
                return false;
            }
        }

        let data = match snapshot.price_data(symbol) {
            Some(data) => data,
            None => return false,
        };
        let mark = data.price;
        let atr_pct = self.atr.atr_pct(symbol, order.entry_price);

        // Reward/risk gate: expected favorable move against the stop distance.
        let stop_distance = order.entry_price * atr_pct * self.config.sizing.stop_atr_mult;
        let reward = order.entry_price * candidate.expected_move_bps / dec!(10000);
        let rr_min = if candidate.is_pilot {
            self.config.risk.rr_min * self.config.risk.rr_relax_for_pilot
        } else {
            self.config.risk.rr_min
        };
        if stop_distance > Decimal::ZERO && reward / stop_distance < rr_min {
            self.trace_skip(snapshot, candidate, "rr_below_min");
            return false;
        }

        // Size against marked equity and current exposures.
        let size_mult = if order.intent == OrderIntent::Explore {
            self.budget.size_mult()
        } else {
            Decimal::ONE
        };
        let (symbol_exposure, session_exposure) = self.exposures(tx, snapshot);
        let request = SizeRequest {
            symbol: symbol.clone(),
            intent: order.intent,
            entry_price: order.entry_price,
            equity: tx.previous_equity(),
            atr_pct,
            symbol_exposure: symbol_exposure
                .get(symbol)
                .copied()
                .unwrap_or(Decimal::ZERO),
            session_exposure,
            size_mult,
        };
        let sized = match self.sizer.size(&request) {
            Ok(sized) => sized,
            Err(err) => {
                let reason = match err {
                    SizingError::BelowFloor { .. } => "below_floor",
                    SizingError::PrecisionFail(_) => "precision_fail",
                    SizingError::NoHeadroom(_) => "no_headroom",
                    SizingError::InvalidInput(_) => "sizing_invalid_input",
                };
                self.trace_skip(snapshot, candidate, reason);
                return false;
            }
        };

        // Exploration budget (PILOT/EXPLORE only).
        if let Err(err) = self.budget.check(
            order.intent,
            candidate.composite_score,
            sized.notional,
            tx.previous_equity(),
        ) {
            debug!(symbol = %symbol, error = %err, "Exploration budget refused entry");
            self.trace_skip(snapshot, candidate, "exploration_budget");
            return false;
        }

        // Post-only entry routing.
        let plan = route_entry(order.side, data.bid, data.ask, mark, &self.config.execution);
        let (price, is_maker, is_market) = match plan {
            EntryPlan::Execute {
                price,
                is_maker,
                is_market,
            } => (price, is_maker, is_market),
            EntryPlan::GiveUp { reason } => {
                self.trace_skip(snapshot, candidate, reason);
                return false;
            }
        };

        let venue = resolve_venue(symbol)
            .map(|m| m.venue)
            .unwrap_or(self.config.execution.venue);
        let fill = self.fills.simulate(&FillParams {
            symbol: symbol.clone(),
            venue,
            side: order.side,
            quantity: sized.quantity,
            mark_price: price,
            is_market,
            is_maker,
        });

        // Affordability check (cheaper than letting commit discard the whole
        // cycle for one oversized entry).
        let cost = fill.notional + fill.fees;
        if order.side == Side::Buy && cost > tx.previous_cash() {
            self.trace_skip(snapshot, candidate, "insufficient_cash");
            return false;
        }

        let qty_delta = match order.side {
            Side::Buy => fill.quantity,
            Side::Sell => -fill.quantity,
        };
        tx.stage_cash_delta(fill.cash_delta_ex_fees(), fill.fees);
        tx.stage_slippage_cost(fill.slippage_cost);
        tx.stage_position_delta(
            symbol,
            qty_delta,
            Some(fill.effective_fill_price),
            mark,
            Some(&candidate.strategy),
        );
        if tx
            .stage_lot_addition(symbol, fill.quantity, fill.effective_fill_price, fill.fees)
            .is_err()
        {
            warn!(symbol = %symbol, "Entry dropped: lot addition failed");
            return false;
        }
        tx.stage_trade(TradeRecord {
            trade_id: fill.fill_id.clone(),
            session_id: self.session_id.clone(),
            symbol: symbol.clone(),
            side: fill.side,
            quantity: fill.quantity,
            mark_price: fill.mark_price,
            effective_fill_price: fill.effective_fill_price,
            slippage_bps: fill.slippage_bps,
            fee_bps: fill.fee_bps,
            fees: fill.fees,
            notional: fill.notional,
            strategy: candidate.strategy.clone(),
            exit_reason: None,
            realized_pnl: None,
            executed_at: fill.executed_at,
        });

        // Bracket on the snapshot mark; risk distances key off the mark, not
        // the slipped fill.
        let position_side = match order.side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        };
        self.brackets
            .attach_on_entry(&fill.fill_id, symbol, position_side, mark, fill.quantity);
        self.pyramids.insert(
            symbol.clone(),
            PyramidState {
                initial_qty: fill.quantity,
                adds_done: 0,
            },
        );

        // First entry into the symbol locks valuation provenance.
        self.snapshots
            .lock_provenance(symbol, data.venue, &data.source);
        self.budget.record_spend(order.intent, fill.notional);
        true
    }

    /// Pyramiding add: triggered when a BUY lands on an existing long with
    /// adds remaining and the position has run far enough in R-multiples.
    fn try_pyramid_add(
        &mut self,
        tx: &mut PortfolioTransaction,
        snapshot: &PricingSnapshot,
        candidate: &ScoredCandidate,
    ) -> bool {
        let symbol = &candidate.symbol;
        let risk = &self.config.risk;
        let state = match self.pyramids.get(symbol) {
            Some(state) => state.clone(),
            None => return false,
        };
        if state.adds_done >= risk.max_adds {
            return false;
        }
        let bracket = match self.brackets.bracket(symbol) {
            Some(bracket) => bracket.clone(),
            None => return false,
        };
        let mark = match snapshot.mark(symbol) {
            Some(mark) => mark,
            None => return false,
        };

        let trigger_r = match risk.add_triggers_r.get(state.adds_done as usize) {
            Some(trigger) => *trigger,
            None => return false,
        };
        let progress_r = match bracket.side {
            PositionSide::Long => (mark - bracket.entry_price) / bracket.risk_unit,
            PositionSide::Short => (bracket.entry_price - mark) / bracket.risk_unit,
        };
        if progress_r < trigger_r {
            return false;
        }

        let add_fraction = risk
            .add_sizes
            .get(state.adds_done as usize)
            .copied()
            .unwrap_or(dec!(0.5));
        let add_qty = state.initial_qty * add_fraction;
        if add_qty <= dec!(0.00000001) {
            return false;
        }

        let venue = resolve_venue(symbol)
            .map(|m| m.venue)
            .unwrap_or(self.config.execution.venue);
        let side = bracket.side.closing_side().opposite();
        let fill = self.fills.simulate(&FillParams {
            symbol: symbol.clone(),
            venue,
            side,
            quantity: add_qty,
            mark_price: mark,
            is_market: true,
            is_maker: false,
        });

        let cost = fill.notional + fill.fees;
        if side == Side::Buy && cost > tx.previous_cash() {
            self.trace_skip(snapshot, candidate, "insufficient_cash");
            return false;
        }

        let qty_delta = match side {
            Side::Buy => fill.quantity,
            Side::Sell => -fill.quantity,
        };
        tx.stage_cash_delta(fill.cash_delta_ex_fees(), fill.fees);
        tx.stage_slippage_cost(fill.slippage_cost);
        tx.stage_position_delta(
            symbol,
            qty_delta,
            Some(fill.effective_fill_price),
            mark,
            Some(&candidate.strategy),
        );
        if tx
            .stage_lot_addition(symbol, fill.quantity, fill.effective_fill_price, fill.fees)
            .is_err()
        {
            return false;
        }
        tx.stage_trade(TradeRecord {
            trade_id: fill.fill_id.clone(),
            session_id: self.session_id.clone(),
            symbol: symbol.clone(),
            side: fill.side,
            quantity: fill.quantity,
            mark_price: fill.mark_price,
            effective_fill_price: fill.effective_fill_price,
            slippage_bps: fill.slippage_bps,
            fee_bps: fill.fee_bps,
            fees: fill.fees,
            notional: fill.notional,
            strategy: candidate.strategy.clone(),
            exit_reason: None,
            realized_pnl: None,
            executed_at: fill.executed_at,
        });

        // Rebuild the bracket over the combined quantity at the new mark.
        let combined_qty = tx.staged_qty(symbol).abs();
        self.brackets.cancel_bracket(symbol, "pyramid_add");
        self.brackets
            .attach_on_entry(&fill.fill_id, symbol, bracket.side, mark, combined_qty);

        if let Some(state) = self.pyramids.get_mut(symbol) {
            state.adds_done += 1;
        }
        info!(
            symbol = %symbol,
            add = state.adds_done + 1,
            qty = %add_qty,
            progress_r = %progress_r,
            "Pyramid add executed"
        );
        true
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn effective_position(
        &self,
        tx: &PortfolioTransaction,
        symbol: &str,
    ) -> Result<Option<PositionRecord>, EngineError> {
        let qty = tx.staged_qty(symbol);
        if qty.abs() <= dec!(0.00000001) {
            return Ok(None);
        }
        let base = self.ledger.position(&self.session_id, symbol).await?;
        Ok(Some(match base {
            Some(mut position) => {
                position.quantity = qty;
                position
            }
            None => PositionRecord {
                symbol: symbol.to_string(),
                quantity: qty,
                entry_price: Decimal::ZERO,
                current_price: Decimal::ZERO,
                value: Decimal::ZERO,
                unrealized_pnl: Decimal::ZERO,
                strategy: "unknown".to_string(),
                session_id: self.session_id.clone(),
            },
        }))
    }

    /// Per-symbol and total notional exposure at staged quantities.
    fn exposures(
        &self,
        tx: &PortfolioTransaction,
        snapshot: &PricingSnapshot,
    ) -> (HashMap<String, Decimal>, Decimal) {
        let mut per_symbol = HashMap::new();
        let mut total = Decimal::ZERO;
        for symbol in snapshot.symbols() {
            let qty = tx.staged_qty(symbol);
            if qty.abs() <= dec!(0.00000001) {
                continue;
            }
            let mark = snapshot.mark(symbol).unwrap_or_default();
            let exposure = qty.abs() * mark;
            per_symbol.insert(symbol.to_string(), exposure);
            total += exposure;
        }
        (per_symbol, total)
    }

    fn trace_skip(
        &mut self,
        snapshot: &PricingSnapshot,
        candidate: &ScoredCandidate,
        reason: &str,
    ) {
        info!(
            snapshot_id = snapshot.id(),
            symbol = %candidate.symbol,
            action = %candidate.final_action,
            reason = %reason,
            score = %candidate.composite_score,
            "DECISION_TRACE"
        );
    }

    async fn nav_check(&self, snapshot: &PricingSnapshot) -> Result<Decimal, EngineError> {
        let row = match self.ledger.latest_cash_equity(&self.session_id).await? {
            Some(row) => row,
            None => return Ok(Decimal::ZERO),
        };
        let mut positions_value = Decimal::ZERO;
        for position in self.ledger.positions(&self.session_id).await? {
            let mark = snapshot
                .mark(&position.symbol)
                .unwrap_or(position.current_price);
            positions_value += position.quantity * mark;
        }
        let recomputed = row.cash_balance + positions_value;
        let tolerance = self
            .config
            .analytics
            .nav_validation_tolerance
            .max(dec!(10));
        let diff = (recomputed - row.total_equity).abs();
        if diff > tolerance {
            warn!(
                snapshot_id = snapshot.id(),
                ledger_equity = %row.total_equity,
                recomputed = %recomputed,
                diff = %diff,
                tolerance = %tolerance,
                "NAV_CHECK mismatch"
            );
        } else {
            debug!(
                snapshot_id = snapshot.id(),
                equity = %row.total_equity,
                diff = %diff,
                "NAV_CHECK ok"
            );
        }
        Ok(row.total_equity)
    }
}
