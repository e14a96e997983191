//! Staged, validated, atomic portfolio mutations.
//!
//! A `PortfolioTransaction` buffers one decision's worth of cash, position,
//! lot, and realized-P&L deltas in memory. Staging is never validated;
//! interim states during multi-leg operations routinely violate conservation
//! while the final state does not. Only `commit` validates, and it validates
//! the FINAL staged state:
//!
//! - within ε: write everything through the ledger in one atomic batch
//! - within 0.1% of previous equity and no critical error: auto-reconcile,
//!   commit anyway with a full diff report
//! - otherwise: discard, leaving the ledger untouched
//!
//! Critical errors (negative cash, negative equity, quantity leak, lot
//! mismatch) always discard regardless of magnitude.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use folio_common::{venue_rules_for, PositionSide};

use crate::ledger::{
    CashEquityRow, LedgerCommit, LedgerError, PositionRecord, PositionWrite, StateLedger,
    TradeRecord,
};
use crate::portfolio::lots::{ConsumeResult, LotBook, LotError};

const QTY_DUST: Decimal = dec!(0.00000001);

/// Fraction of previous equity within which a mismatch auto-reconciles.
const RECONCILE_LIMIT: Decimal = dec!(0.001);

/// Fraction of previous equity above which unexplained cross-symbol value
/// movement counts as a quantity leak.
const LEAK_LIMIT: Decimal = dec!(0.01);

/// Errors from the transaction lifecycle.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("No cash/equity row for session {0}; open the session first")]
    MissingCashRow(String),

    #[error("Transaction already finished")]
    AlreadyFinished,

    #[error(transparent)]
    Lot(#[from] LotError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Conditions that unconditionally discard a commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CriticalError {
    NegativeCash { staged_cash: Decimal },
    NegativeEquity { staged_equity: Decimal },
    QuantityLeak { residual: Decimal, limit: Decimal },
    LotMismatch {
        symbol: String,
        lots_qty: Decimal,
        position_qty: Decimal,
    },
}

impl CriticalError {
    pub fn category(&self) -> &'static str {
        match self {
            CriticalError::NegativeCash { .. } => "negative_cash",
            CriticalError::NegativeEquity { .. } => "negative_equity",
            CriticalError::QuantityLeak { .. } => "quantity_leak",
            CriticalError::LotMismatch { .. } => "lot_mismatch",
        }
    }
}

/// Per-symbol entry of a diff report.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolDiff {
    pub symbol: String,
    pub qty_before: Decimal,
    pub qty_after: Decimal,
    pub mark: Decimal,
    pub value_delta: Decimal,
}

/// Structured evidence attached to every commit outcome.
#[derive(Debug, Clone, Serialize)]
pub struct DiffReport {
    pub session_id: String,
    pub snapshot_id: u64,
    pub cash_before: Decimal,
    pub cash_after: Decimal,
    pub fees: Decimal,
    pub slippage_cost: Decimal,
    pub realized_delta: Decimal,
    pub per_symbol: Vec<SymbolDiff>,
    pub staged_equity: Decimal,
    pub expected_equity: Decimal,
    pub delta: Decimal,
    pub epsilon: Decimal,
    /// Residual value movement not explained by cash/fees/slippage.
    pub rounding_residual: Decimal,
    pub critical: Option<CriticalError>,
}

/// What `commit` decided.
#[derive(Debug)]
pub enum CommitOutcome {
    Committed(DiffReport),
    Reconciled(DiffReport),
    Discarded(DiffReport),
}

impl CommitOutcome {
    pub fn report(&self) -> &DiffReport {
        match self {
            CommitOutcome::Committed(r)
            | CommitOutcome::Reconciled(r)
            | CommitOutcome::Discarded(r) => r,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_) | CommitOutcome::Reconciled(_))
    }
}

#[derive(Debug, Default)]
struct StagedPosition {
    qty_delta: Decimal,
    entry_price: Option<Decimal>,
    mark: Option<Decimal>,
    strategy: Option<String>,
}

#[derive(Debug, PartialEq)]
enum TxState {
    Open,
    Committed,
    Discarded,
}

/// One decision's worth of staged portfolio mutations.
pub struct PortfolioTransaction {
    session_id: String,
    snapshot_id: u64,
    base_epsilon: Decimal,
    previous: CashEquityRow,
    current_positions: Vec<PositionRecord>,
    lot_book: LotBook,
    lot_symbols_touched: HashSet<String>,
    staged_cash_delta: Decimal,
    staged_fees: Decimal,
    staged_slippage: Decimal,
    staged_realized_delta: Decimal,
    staged_positions: HashMap<String, StagedPosition>,
    staged_trades: Vec<TradeRecord>,
    state: TxState,
}

impl PortfolioTransaction {
    /// Open a transaction against the session's latest committed state.
    pub async fn begin(
        ledger: &StateLedger,
        session_id: &str,
        snapshot_id: u64,
        base_epsilon: Decimal,
    ) -> Result<Self, TransactionError> {
        let previous = ledger
            .latest_cash_equity(session_id)
            .await?
            .ok_or_else(|| TransactionError::MissingCashRow(session_id.to_string()))?;
        let current_positions = ledger.positions(session_id).await?;
        let lot_book = LotBook::from_rows(&ledger.all_lots(session_id).await?);

        debug!(
            session_id = %session_id,
            snapshot_id,
            previous_equity = %previous.total_equity,
            "Portfolio transaction opened"
        );

        Ok(Self {
            session_id: session_id.to_string(),
            snapshot_id,
            base_epsilon,
            previous,
            current_positions,
            lot_book,
            lot_symbols_touched: HashSet::new(),
            staged_cash_delta: Decimal::ZERO,
            staged_fees: Decimal::ZERO,
            staged_slippage: Decimal::ZERO,
            staged_realized_delta: Decimal::ZERO,
            staged_positions: HashMap::new(),
            staged_trades: Vec::new(),
            state: TxState::Open,
        })
    }

    pub fn previous_equity(&self) -> Decimal {
        self.previous.total_equity
    }

    pub fn previous_cash(&self) -> Decimal {
        self.previous.cash_balance
    }

    /// Current + staged quantity for a symbol.
    pub fn staged_qty(&self, symbol: &str) -> Decimal {
        let current = self
            .current_positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        current
            + self
                .staged_positions
                .get(symbol)
                .map(|s| s.qty_delta)
                .unwrap_or(Decimal::ZERO)
    }

    /// The working lot book (current state plus staged lot operations).
    pub fn lot_book(&self) -> &LotBook {
        &self.lot_book
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Stage a cash change. `delta` excludes fees; both reduce cash.
    pub fn stage_cash_delta(&mut self, delta: Decimal, fees: Decimal) {
        self.staged_cash_delta += delta;
        self.staged_fees += fees;
        debug!(delta = %delta, fees = %fees, "Staged cash delta");
    }

    /// Stage the adverse slippage cost of a fill. Feeds expected-equity
    /// computation: slippage, like fees, is a legitimate equity loss.
    pub fn stage_slippage_cost(&mut self, cost: Decimal) {
        self.staged_slippage += cost;
    }

    /// Stage a position quantity change.
    pub fn stage_position_delta(
        &mut self,
        symbol: &str,
        qty_delta: Decimal,
        entry_price: Option<Decimal>,
        mark: Decimal,
        strategy: Option<&str>,
    ) {
        let staged = self.staged_positions.entry(symbol.to_string()).or_default();
        staged.qty_delta += qty_delta;
        if entry_price.is_some() {
            staged.entry_price = entry_price;
        }
        staged.mark = Some(mark);
        if let Some(strategy) = strategy {
            staged.strategy = Some(strategy.to_string());
        }
        debug!(symbol = %symbol, qty_delta = %qty_delta, "Staged position delta");
    }

    /// Stage a lot addition (entry fill).
    pub fn stage_lot_addition(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        entry_fee: Decimal,
    ) -> Result<String, TransactionError> {
        self.lot_symbols_touched.insert(symbol.to_string());
        Ok(self
            .lot_book
            .add_lot(symbol, quantity, price, entry_fee, Utc::now())?)
    }

    /// Stage a FIFO lot consumption (exit fill). Returns the realized P&L
    /// breakdown; the caller stages the realized delta explicitly.
    pub fn stage_lot_consumption(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        fill_price: Decimal,
        exit_fee: Decimal,
        side: PositionSide,
    ) -> Result<ConsumeResult, TransactionError> {
        self.lot_symbols_touched.insert(symbol.to_string());
        Ok(self
            .lot_book
            .consume(symbol, quantity, fill_price, exit_fee, side)?)
    }

    /// Stage a realized P&L change.
    pub fn stage_realized_pnl_delta(&mut self, delta: Decimal) {
        self.staged_realized_delta += delta;
    }

    /// Stage an immutable trade record to append on commit.
    pub fn stage_trade(&mut self, trade: TradeRecord) {
        self.staged_trades.push(trade);
    }

    /// Whether anything has been staged.
    pub fn is_dirty(&self) -> bool {
        self.staged_cash_delta != Decimal::ZERO
            || self.staged_fees != Decimal::ZERO
            || !self.staged_positions.is_empty()
            || !self.staged_trades.is_empty()
            || !self.lot_symbols_touched.is_empty()
    }

    /// Explicitly discard all staged changes. The ledger is untouched.
    pub fn discard(&mut self, reason: &str) {
        if self.state == TxState::Open {
            info!(
                session_id = %self.session_id,
                snapshot_id = self.snapshot_id,
                reason = %reason,
                "Portfolio transaction discarded before commit"
            );
            self.state = TxState::Discarded;
        }
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Validate the final staged state and commit, reconcile, or discard.
    ///
    /// `final_marks` must come from the same pricing snapshot the decisions
    /// used; the snapshot id is carried into the commit log.
    pub async fn commit(
        mut self,
        ledger: &StateLedger,
        final_marks: &HashMap<String, Decimal>,
    ) -> Result<CommitOutcome, TransactionError> {
        if self.state != TxState::Open {
            return Err(TransactionError::AlreadyFinished);
        }

        let staged_cash = self.previous.cash_balance + self.staged_cash_delta - self.staged_fees;

        // Final staged quantity and valuation per symbol (union of current
        // positions and staged deltas).
        let mut symbols: Vec<String> = self
            .current_positions
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        for symbol in self.staged_positions.keys() {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }

        let mut per_symbol = Vec::new();
        let mut staged_positions_value = Decimal::ZERO;
        let mut staged_unrealized = Decimal::ZERO;
        let mut position_writes = Vec::new();
        let mut max_qty = Decimal::ZERO;
        let mut max_tick = Decimal::ZERO;
        let mut leak_residual = self.staged_cash_delta + self.staged_slippage;

        for symbol in &symbols {
            let current = self.current_positions.iter().find(|p| &p.symbol == symbol);
            let qty_before = current.map(|p| p.quantity).unwrap_or(Decimal::ZERO);
            let staged = self.staged_positions.get(symbol);
            let qty_after = qty_before + staged.map(|s| s.qty_delta).unwrap_or(Decimal::ZERO);

            let mark = final_marks
                .get(symbol)
                .copied()
                .or(staged.and_then(|s| s.mark))
                .or(current.map(|p| p.current_price))
                .unwrap_or(Decimal::ZERO);

            staged_positions_value += qty_after * mark;
            leak_residual += (qty_after - qty_before) * mark;
            max_qty = max_qty.max(qty_after.abs()).max(qty_before.abs());
            max_tick = max_tick.max(venue_rules_for(symbol).price_tick);

            // Entry price: weighted on adds, preserved on reductions.
            let entry = match (current, staged.and_then(|s| s.entry_price)) {
                (None, Some(staged_entry)) => staged_entry,
                (Some(pos), Some(staged_entry)) => {
                    let delta = qty_after - qty_before;
                    let increases =
                        delta.signum() == pos.quantity.signum() || pos.quantity.abs() <= QTY_DUST;
                    if increases && qty_after.abs() > QTY_DUST {
                        (pos.entry_price * pos.quantity + staged_entry * delta) / qty_after
                    } else {
                        pos.entry_price
                    }
                }
                (Some(pos), None) => pos.entry_price,
                (None, None) => mark,
            };
            staged_unrealized += (mark - entry) * qty_after;

            per_symbol.push(SymbolDiff {
                symbol: symbol.clone(),
                qty_before,
                qty_after,
                mark,
                value_delta: (qty_after - qty_before) * mark,
            });

            if staged.is_some() {
                position_writes.push(PositionWrite {
                    symbol: symbol.clone(),
                    quantity: qty_after,
                    entry_price: entry,
                    current_price: mark,
                    strategy: staged
                        .and_then(|s| s.strategy.clone())
                        .or_else(|| current.map(|p| p.strategy.clone()))
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
        }

        let staged_equity = staged_cash + staged_positions_value;
        let expected_equity =
            self.previous.total_equity - self.staged_fees - self.staged_slippage;
        let epsilon = self
            .base_epsilon
            .max(dec!(3) * max_tick * max_qty)
            .max(dec!(0.0001) * self.previous.total_equity);
        let delta = (staged_equity - expected_equity).abs();

        let critical = self.detect_critical(staged_cash, staged_equity, leak_residual);

        let report = DiffReport {
            session_id: self.session_id.clone(),
            snapshot_id: self.snapshot_id,
            cash_before: self.previous.cash_balance,
            cash_after: staged_cash,
            fees: self.staged_fees,
            slippage_cost: self.staged_slippage,
            realized_delta: self.staged_realized_delta,
            per_symbol,
            staged_equity,
            expected_equity,
            delta,
            epsilon,
            rounding_residual: leak_residual,
            critical: critical.clone(),
        };

        if let Some(critical) = critical {
            self.state = TxState::Discarded;
            error!(
                session_id = %self.session_id,
                snapshot_id = self.snapshot_id,
                category = critical.category(),
                diff = %serde_json::to_string(&report).unwrap_or_default(),
                "PORTFOLIO_DISCARD"
            );
            return Ok(CommitOutcome::Discarded(report));
        }

        let reconcile_limit = RECONCILE_LIMIT * self.previous.total_equity;
        if delta <= epsilon {
            self.apply(ledger, staged_cash, staged_equity, staged_unrealized, position_writes)
                .await?;
            info!(
                session_id = %self.session_id,
                snapshot = self.snapshot_id,
                equity = %staged_equity,
                delta = %delta,
                epsilon = %epsilon,
                "PORTFOLIO_COMMITTED"
            );
            Ok(CommitOutcome::Committed(report))
        } else if delta <= reconcile_limit {
            self.apply(ledger, staged_cash, staged_equity, staged_unrealized, position_writes)
                .await?;
            warn!(
                session_id = %self.session_id,
                snapshot = self.snapshot_id,
                delta = %delta,
                epsilon = %epsilon,
                diff = %serde_json::to_string(&report).unwrap_or_default(),
                "RECONCILED"
            );
            Ok(CommitOutcome::Reconciled(report))
        } else {
            self.state = TxState::Discarded;
            warn!(
                session_id = %self.session_id,
                snapshot = self.snapshot_id,
                delta = %delta,
                epsilon = %epsilon,
                diff = %serde_json::to_string(&report).unwrap_or_default(),
                "PORTFOLIO_DISCARD"
            );
            Ok(CommitOutcome::Discarded(report))
        }
    }

    fn detect_critical(
        &self,
        staged_cash: Decimal,
        staged_equity: Decimal,
        leak_residual: Decimal,
    ) -> Option<CriticalError> {
        if staged_cash < Decimal::ZERO {
            return Some(CriticalError::NegativeCash { staged_cash });
        }
        if staged_equity < Decimal::ZERO {
            return Some(CriticalError::NegativeEquity { staged_equity });
        }

        let leak_limit = LEAK_LIMIT * self.previous.total_equity;
        if leak_residual.abs() > leak_limit && leak_limit > Decimal::ZERO {
            return Some(CriticalError::QuantityLeak {
                residual: leak_residual,
                limit: leak_limit,
            });
        }

        for symbol in &self.lot_symbols_touched {
            let lots_qty = self.lot_book.available_qty(symbol);
            let position_qty = self.staged_qty(symbol).abs();
            if (lots_qty - position_qty).abs() > QTY_DUST {
                return Some(CriticalError::LotMismatch {
                    symbol: symbol.clone(),
                    lots_qty,
                    position_qty,
                });
            }
        }
        None
    }

    async fn apply(
        &mut self,
        ledger: &StateLedger,
        staged_cash: Decimal,
        staged_equity: Decimal,
        staged_unrealized: Decimal,
        position_writes: Vec<PositionWrite>,
    ) -> Result<(), TransactionError> {
        let commit = LedgerCommit {
            session_id: self.session_id.clone(),
            cash_row: Some(CashEquityRow {
                session_id: self.session_id.clone(),
                cash_balance: staged_cash,
                total_equity: staged_equity,
                total_fees: self.previous.total_fees + self.staged_fees,
                total_realized_pnl: self.previous.total_realized_pnl + self.staged_realized_delta,
                total_unrealized_pnl: staged_unrealized,
                updated_at: Utc::now(),
            }),
            positions: position_writes,
            lots: self
                .lot_symbols_touched
                .iter()
                .map(|symbol| (symbol.clone(), self.lot_book.to_rows(symbol)))
                .collect(),
            trades: std::mem::take(&mut self.staged_trades),
        };
        ledger.apply_commit(&commit).await?;
        self.state = TxState::Committed;
        Ok(())
    }
}

impl Drop for PortfolioTransaction {
    fn drop(&mut self) {
        if self.state == TxState::Open && self.is_dirty() {
            debug!(
                session_id = %self.session_id,
                snapshot_id = self.snapshot_id,
                "Transaction dropped without commit; staged changes released"
            );
        }
    }
}
