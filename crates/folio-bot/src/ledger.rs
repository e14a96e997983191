//! Durable single-writer state ledger.
//!
//! The `StateLedger` is the only component that touches the SQLite store.
//! It holds sessions, an append-only cash/equity log, positions (one row per
//! symbol and session), FIFO lot rows, and an append-only trade log.
//!
//! Two rules are load-bearing:
//!
//! 1. Every cash-mutating operation recomputes `total_equity = new_cash +
//!    positions_value` and persists it. A stale equity field carried across a
//!    cash write is exactly the drift bug this module exists to prevent.
//! 2. Multi-row operations run inside one SQL transaction. Either every
//!    sub-write lands or none does.
//!
//! Legacy databases may contain duplicate position rows per (symbol, session)
//! from an older (symbol, strategy, session) uniqueness scheme. The read path
//! consolidates them transparently; the write path always collapses to the
//! single-row form.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, warn};

use folio_common::Side;

/// Quantities below this are treated as zero when collapsing positions.
const DUST_QTY: Decimal = dec!(0.00000001);

/// Errors from the state ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Trade log must be monotonic: {trade_id} at {executed_at} precedes last trade at {last}")]
    NonMonotonicTrade {
        trade_id: String,
        executed_at: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("Corrupt decimal in column {column}: {value:?}")]
    CorruptDecimal { column: String, value: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Terminal status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => SessionStatus::Completed,
            "aborted" => SessionStatus::Aborted,
            _ => SessionStatus::Active,
        }
    }
}

/// One trading session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub initial_capital: Decimal,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only cash/equity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashEquityRow {
    pub session_id: String,
    pub cash_balance: Decimal,
    pub total_equity: Decimal,
    pub total_fees: Decimal,
    pub total_realized_pnl: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// A position as seen by callers, after consolidation.
///
/// `quantity` is signed: positive long, negative short. `value` and
/// `unrealized_pnl` are derived from the stored quantity and prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub value: Decimal,
    pub unrealized_pnl: Decimal,
    pub strategy: String,
    pub session_id: String,
}

impl PositionRecord {
    fn derive(
        symbol: String,
        quantity: Decimal,
        entry_price: Decimal,
        current_price: Decimal,
        strategy: String,
        session_id: String,
    ) -> Self {
        Self {
            value: quantity * current_price,
            unrealized_pnl: (current_price - entry_price) * quantity,
            symbol,
            quantity,
            entry_price,
            current_price,
            strategy,
            session_id,
        }
    }
}

/// One persisted FIFO lot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotRow {
    pub lot_id: String,
    pub symbol: String,
    /// FIFO ordering key within (symbol, session).
    pub seq: i64,
    pub entry_price: Decimal,
    pub entry_fee: Decimal,
    pub quantity_remaining: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// One immutable fill record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub session_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub mark_price: Decimal,
    pub effective_fill_price: Decimal,
    pub slippage_bps: Decimal,
    pub fee_bps: Decimal,
    pub fees: Decimal,
    pub notional: Decimal,
    pub strategy: String,
    pub exit_reason: Option<String>,
    pub realized_pnl: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
}

/// A position write staged for an atomic batch commit.
#[derive(Debug, Clone)]
pub struct PositionWrite {
    pub symbol: String,
    /// Signed final quantity. Zero (within dust) deletes the row.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub strategy: String,
}

/// All writes from one committed portfolio transaction, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct LedgerCommit {
    pub session_id: String,
    pub cash_row: Option<CashEquityRow>,
    pub positions: Vec<PositionWrite>,
    /// Full replacement lot books per symbol.
    pub lots: Vec<(String, Vec<LotRow>)>,
    pub trades: Vec<TradeRecord>,
}

/// Durable single-writer store of authoritative state per session.
#[derive(Debug, Clone)]
pub struct StateLedger {
    pool: SqlitePool,
}

fn dec_text(value: Decimal) -> String {
    value.to_string()
}

fn parse_dec(column: &str, value: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(value).map_err(|_| LedgerError::CorruptDecimal {
        column: column.to_string(),
        value: value.to_string(),
    })
}

fn dec_col(row: &SqliteRow, column: &str) -> Result<Decimal, LedgerError> {
    let raw: String = row.try_get(column)?;
    parse_dec(column, &raw)
}

fn opt_dec_col(row: &SqliteRow, column: &str) -> Result<Option<Decimal>, LedgerError> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|v| parse_dec(column, &v)).transpose()
}

impl StateLedger {
    /// Open (and create if missing) the ledger database at `db_path`.
    ///
    /// `":memory:"` opens an ephemeral in-memory database, used by tests and
    /// `--once` dry runs.
    pub async fn connect(db_path: &str) -> Result<Self, LedgerError> {
        let options = if db_path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
        };

        // Single connection: the ledger is single-writer by design, and an
        // in-memory database must not be split across pooled connections.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        info!(db_path = %db_path, "State ledger ready");
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                initial_capital TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cash_equity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                cash_balance TEXT NOT NULL,
                total_equity TEXT NOT NULL,
                total_fees TEXT NOT NULL,
                total_realized_pnl TEXT NOT NULL,
                total_unrealized_pnl TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                current_price TEXT NOT NULL,
                strategy TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS lots (
                lot_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                seq INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                entry_fee TEXT NOT NULL,
                quantity_remaining TEXT NOT NULL,
                opened_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                mark_price TEXT NOT NULL,
                effective_fill_price TEXT NOT NULL,
                slippage_bps TEXT NOT NULL,
                fee_bps TEXT NOT NULL,
                fees TEXT NOT NULL,
                notional TEXT NOT NULL,
                strategy TEXT NOT NULL,
                exit_reason TEXT,
                realized_pnl TEXT,
                executed_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_cash_equity_session ON cash_equity(session_id, id)",
            "CREATE INDEX IF NOT EXISTS idx_positions_session ON positions(session_id, symbol)",
            "CREATE INDEX IF NOT EXISTS idx_lots_session ON lots(session_id, symbol, seq)",
            "CREATE INDEX IF NOT EXISTS idx_trades_session ON trades(session_id, executed_at)",
        ];
        for stmt in ddl {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create a new session with its initial cash/equity row.
    ///
    /// Fails with `SessionExists` if the id is already present.
    pub async fn open_session(
        &self,
        session_id: &str,
        initial_capital: Decimal,
    ) -> Result<SessionRecord, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT session_id FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(LedgerError::SessionExists(session_id.to_string()));
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (session_id, initial_capital, status, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(session_id)
        .bind(dec_text(initial_capital))
        .bind(SessionStatus::Active.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO cash_equity
                (session_id, cash_balance, total_equity, total_fees, total_realized_pnl, total_unrealized_pnl, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(session_id)
        .bind(dec_text(initial_capital))
        .bind(dec_text(initial_capital))
        .bind(dec_text(Decimal::ZERO))
        .bind(dec_text(Decimal::ZERO))
        .bind(dec_text(Decimal::ZERO))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(session_id = %session_id, initial_capital = %initial_capital, "Session opened");

        Ok(SessionRecord {
            session_id: session_id.to_string(),
            initial_capital,
            status: SessionStatus::Active,
            created_at: now,
        })
    }

    /// Fetch a session by id.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, LedgerError> {
        let row = sqlx::query(
            "SELECT session_id, initial_capital, status, created_at FROM sessions WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SessionRecord {
                session_id: row.try_get("session_id")?,
                initial_capital: dec_col(&row, "initial_capital")?,
                status: SessionStatus::parse(&row.try_get::<String, _>("status")?),
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    /// Set a session's terminal status.
    pub async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE sessions SET status = ?1 WHERE session_id = ?2")
            .bind(status.as_str())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Cash / equity
    // =========================================================================

    /// Latest cash/equity row for a session, if any.
    pub async fn latest_cash_equity(
        &self,
        session_id: &str,
    ) -> Result<Option<CashEquityRow>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, cash_balance, total_equity, total_fees,
                   total_realized_pnl, total_unrealized_pnl, updated_at
            FROM cash_equity WHERE session_id = ?1 ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_cash_equity(&row)).transpose()
    }

    fn row_to_cash_equity(&self, row: &SqliteRow) -> Result<CashEquityRow, LedgerError> {
        Ok(CashEquityRow {
            session_id: row.try_get("session_id")?,
            cash_balance: dec_col(row, "cash_balance")?,
            total_equity: dec_col(row, "total_equity")?,
            total_fees: dec_col(row, "total_fees")?,
            total_realized_pnl: dec_col(row, "total_realized_pnl")?,
            total_unrealized_pnl: dec_col(row, "total_unrealized_pnl")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Authoritative cash for a session.
    ///
    /// Prefers the latest cash/equity row. When the log is missing (legacy or
    /// partially migrated databases) the balance is recomputed from first
    /// principles: `initial − Σ(buy notional + fees) + Σ(sell notional − fees)`.
    pub async fn get_session_cash(&self, session_id: &str) -> Result<Decimal, LedgerError> {
        if let Some(row) = self.latest_cash_equity(session_id).await? {
            return Ok(row.cash_balance);
        }

        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| LedgerError::SessionNotFound(session_id.to_string()))?;

        let mut cash = session.initial_capital;
        for trade in self.trades(session_id).await? {
            match trade.side {
                Side::Buy => cash -= trade.notional + trade.fees,
                Side::Sell => cash += trade.notional - trade.fees,
            }
        }
        warn!(
            session_id = %session_id,
            cash = %cash,
            "Cash recomputed from trade log (no cash_equity rows)"
        );
        Ok(cash)
    }

    /// Append a cash/equity row. Previous rows are retained for audit.
    pub async fn save_cash_equity(&self, row: &CashEquityRow) -> Result<(), LedgerError> {
        self.insert_cash_equity(&self.pool, row).await
    }

    async fn insert_cash_equity<'e, E>(&self, executor: E, row: &CashEquityRow) -> Result<(), LedgerError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO cash_equity
                (session_id, cash_balance, total_equity, total_fees, total_realized_pnl, total_unrealized_pnl, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&row.session_id)
        .bind(dec_text(row.cash_balance))
        .bind(dec_text(row.total_equity))
        .bind(dec_text(row.total_fees))
        .bind(dec_text(row.total_realized_pnl))
        .bind(dec_text(row.total_unrealized_pnl))
        .bind(row.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Debit cash and append a fresh cash/equity row.
    ///
    /// Equity is recomputed as `new_cash + positions_value` from current
    /// position rows. Never carries the prior equity forward.
    pub async fn debit_cash(
        &self,
        session_id: &str,
        amount: Decimal,
        fees_portion: Decimal,
    ) -> Result<Decimal, LedgerError> {
        self.adjust_cash(session_id, -amount, fees_portion).await
    }

    /// Credit cash and append a fresh cash/equity row. Symmetric to `debit_cash`.
    pub async fn credit_cash(
        &self,
        session_id: &str,
        amount: Decimal,
        fees_portion: Decimal,
    ) -> Result<Decimal, LedgerError> {
        self.adjust_cash(session_id, amount, fees_portion).await
    }

    async fn adjust_cash(
        &self,
        session_id: &str,
        signed_amount: Decimal,
        fees_portion: Decimal,
    ) -> Result<Decimal, LedgerError> {
        let previous = self.latest_cash_equity(session_id).await?;
        let old_cash = match &previous {
            Some(row) => row.cash_balance,
            None => self.get_session_cash(session_id).await?,
        };
        let new_cash = old_cash + signed_amount;
        let positions_value = self.positions_value(session_id).await?;
        let unrealized = self.unrealized_pnl_total(session_id).await?;

        let row = CashEquityRow {
            session_id: session_id.to_string(),
            cash_balance: new_cash,
            total_equity: new_cash + positions_value,
            total_fees: previous.as_ref().map(|r| r.total_fees).unwrap_or(Decimal::ZERO)
                + fees_portion,
            total_realized_pnl: previous
                .as_ref()
                .map(|r| r.total_realized_pnl)
                .unwrap_or(Decimal::ZERO),
            total_unrealized_pnl: unrealized,
            updated_at: Utc::now(),
        };
        self.save_cash_equity(&row).await?;

        debug!(
            session_id = %session_id,
            delta = %signed_amount,
            new_cash = %new_cash,
            equity = %row.total_equity,
            "Cash adjusted, equity recomputed"
        );
        Ok(new_cash)
    }

    /// Re-mark open positions from a price map and append a recomputed
    /// cash/equity row.
    ///
    /// Cash, fees, and realized P&L carry forward; equity and unrealized P&L
    /// are recomputed from the new marks. Symbols absent from the map keep
    /// their previous mark.
    pub async fn mark_to_market(
        &self,
        session_id: &str,
        marks: &std::collections::HashMap<String, Decimal>,
    ) -> Result<CashEquityRow, LedgerError> {
        for position in self.positions(session_id).await? {
            if let Some(price) = marks.get(&position.symbol) {
                self.update_position_price(session_id, &position.symbol, *price)
                    .await?;
            }
        }

        let previous = self.latest_cash_equity(session_id).await?;
        let cash = match &previous {
            Some(row) => row.cash_balance,
            None => self.get_session_cash(session_id).await?,
        };
        let positions_value = self.positions_value(session_id).await?;
        let unrealized = self.unrealized_pnl_total(session_id).await?;

        let row = CashEquityRow {
            session_id: session_id.to_string(),
            cash_balance: cash,
            total_equity: cash + positions_value,
            total_fees: previous
                .as_ref()
                .map(|r| r.total_fees)
                .unwrap_or(Decimal::ZERO),
            total_realized_pnl: previous
                .as_ref()
                .map(|r| r.total_realized_pnl)
                .unwrap_or(Decimal::ZERO),
            total_unrealized_pnl: unrealized,
            updated_at: Utc::now(),
        };
        self.save_cash_equity(&row).await?;
        Ok(row)
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// Sum of `quantity * current_price` over current position rows.
    pub async fn positions_value(&self, session_id: &str) -> Result<Decimal, LedgerError> {
        Ok(self
            .positions(session_id)
            .await?
            .iter()
            .map(|p| p.value)
            .sum())
    }

    async fn unrealized_pnl_total(&self, session_id: &str) -> Result<Decimal, LedgerError> {
        Ok(self
            .positions(session_id)
            .await?
            .iter()
            .map(|p| p.unrealized_pnl)
            .sum())
    }

    /// All positions for a session, with legacy duplicates consolidated.
    ///
    /// Consolidation sums quantities, computes the quantity-weighted entry,
    /// and merges the strategy tag to "consolidated". This is a compatibility
    /// shim for old (symbol, strategy)-keyed rows; writes always produce the
    /// single-row form.
    pub async fn positions(&self, session_id: &str) -> Result<Vec<PositionRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, quantity, entry_price, current_price, strategy
            FROM positions WHERE session_id = ?1 ORDER BY symbol, id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut result: Vec<PositionRecord> = Vec::new();
        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let quantity = dec_col(&row, "quantity")?;
            let entry_price = dec_col(&row, "entry_price")?;
            let current_price = dec_col(&row, "current_price")?;
            let strategy: String = row.try_get("strategy")?;

            match result.iter_mut().find(|p| p.symbol == symbol) {
                None => result.push(PositionRecord::derive(
                    symbol,
                    quantity,
                    entry_price,
                    current_price,
                    strategy,
                    session_id.to_string(),
                )),
                Some(existing) => {
                    // Legacy duplicate row: merge on read.
                    let merged_qty = existing.quantity + quantity;
                    let merged_entry = if merged_qty.abs() > DUST_QTY {
                        (existing.entry_price * existing.quantity + entry_price * quantity)
                            / merged_qty
                    } else {
                        existing.entry_price
                    };
                    warn!(
                        session_id = %session_id,
                        symbol = %existing.symbol,
                        "Consolidating duplicate position rows"
                    );
                    *existing = PositionRecord::derive(
                        existing.symbol.clone(),
                        merged_qty,
                        merged_entry,
                        current_price,
                        "consolidated".to_string(),
                        session_id.to_string(),
                    );
                }
            }
        }
        result.retain(|p| p.quantity.abs() > DUST_QTY);
        Ok(result)
    }

    /// A single position by symbol, consolidated.
    pub async fn position(
        &self,
        session_id: &str,
        symbol: &str,
    ) -> Result<Option<PositionRecord>, LedgerError> {
        Ok(self
            .positions(session_id)
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }

    /// Merge a quantity delta into the position for (symbol, session).
    ///
    /// Merges regardless of strategy; strategy is metadata, never a
    /// discriminator. Entry price is quantity-weighted on increases and kept
    /// on reductions. A final quantity within dust removes the row.
    pub async fn upsert_position(
        &self,
        session_id: &str,
        symbol: &str,
        qty_delta: Decimal,
        entry_price: Decimal,
        current_price: Decimal,
        strategy: &str,
    ) -> Result<(), LedgerError> {
        let existing = self.position(session_id, symbol).await?;
        let mut tx = self.pool.begin().await?;

        let (new_qty, new_entry) = match &existing {
            None => (qty_delta, entry_price),
            Some(pos) => {
                let new_qty = pos.quantity + qty_delta;
                let increases = qty_delta.signum() == pos.quantity.signum()
                    || pos.quantity.abs() <= DUST_QTY;
                let new_entry = if increases && new_qty.abs() > DUST_QTY {
                    (pos.entry_price * pos.quantity + entry_price * qty_delta) / new_qty
                } else {
                    pos.entry_price
                };
                (new_qty, new_entry)
            }
        };

        write_position(
            &mut tx,
            session_id,
            symbol,
            new_qty,
            new_entry,
            current_price,
            strategy,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Update a position's mark; value and unrealized P&L follow on read.
    pub async fn update_position_price(
        &self,
        session_id: &str,
        symbol: &str,
        price: Decimal,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE positions SET current_price = ?1, updated_at = ?2 WHERE session_id = ?3 AND symbol = ?4",
        )
        .bind(dec_text(price))
        .bind(Utc::now())
        .bind(session_id)
        .bind(symbol)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete the position row(s) for a symbol.
    pub async fn remove_position(&self, session_id: &str, symbol: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM positions WHERE session_id = ?1 AND symbol = ?2")
            .bind(session_id)
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Lots
    // =========================================================================

    /// FIFO lots for a symbol, oldest first.
    pub async fn lots(&self, session_id: &str, symbol: &str) -> Result<Vec<LotRow>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT lot_id, symbol, seq, entry_price, entry_fee, quantity_remaining, opened_at
            FROM lots WHERE session_id = ?1 AND symbol = ?2 ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(LotRow {
                    lot_id: row.try_get("lot_id")?,
                    symbol: row.try_get("symbol")?,
                    seq: row.try_get("seq")?,
                    entry_price: dec_col(row, "entry_price")?,
                    entry_fee: dec_col(row, "entry_fee")?,
                    quantity_remaining: dec_col(row, "quantity_remaining")?,
                    opened_at: row.try_get("opened_at")?,
                })
            })
            .collect()
    }

    /// All lots for a session keyed by symbol.
    pub async fn all_lots(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, Vec<LotRow>)>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT lot_id, symbol, seq, entry_price, entry_fee, quantity_remaining, opened_at
            FROM lots WHERE session_id = ?1 ORDER BY symbol, seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut result: Vec<(String, Vec<LotRow>)> = Vec::new();
        for row in rows {
            let lot = LotRow {
                lot_id: row.try_get("lot_id")?,
                symbol: row.try_get("symbol")?,
                seq: row.try_get("seq")?,
                entry_price: dec_col(&row, "entry_price")?,
                entry_fee: dec_col(&row, "entry_fee")?,
                quantity_remaining: dec_col(&row, "quantity_remaining")?,
                opened_at: row.try_get("opened_at")?,
            };
            match result.last_mut() {
                Some((symbol, lots)) if *symbol == lot.symbol => lots.push(lot),
                _ => result.push((lot.symbol.clone(), vec![lot])),
            }
        }
        Ok(result)
    }

    // =========================================================================
    // Trades
    // =========================================================================

    /// Append one immutable trade record.
    ///
    /// Rejects records that would make the trade log non-monotonic in
    /// `executed_at`; that indicates a bug in the caller, not recoverable data.
    pub async fn append_trade(&self, trade: &TradeRecord) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        check_trade_monotonic(&mut tx, trade).await?;
        insert_trade(&mut tx, trade).await?;
        tx.commit().await?;
        Ok(())
    }

    /// All trades for a session in commit order.
    pub async fn trades(&self, session_id: &str) -> Result<Vec<TradeRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, session_id, symbol, side, quantity, mark_price,
                   effective_fill_price, slippage_bps, fee_bps, fees, notional,
                   strategy, exit_reason, realized_pnl, executed_at
            FROM trades WHERE session_id = ?1 ORDER BY executed_at ASC, trade_id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let side_raw: String = row.try_get("side")?;
                Ok(TradeRecord {
                    trade_id: row.try_get("trade_id")?,
                    session_id: row.try_get("session_id")?,
                    symbol: row.try_get("symbol")?,
                    side: side_raw.parse().unwrap_or(Side::Buy),
                    quantity: dec_col(row, "quantity")?,
                    mark_price: dec_col(row, "mark_price")?,
                    effective_fill_price: dec_col(row, "effective_fill_price")?,
                    slippage_bps: dec_col(row, "slippage_bps")?,
                    fee_bps: dec_col(row, "fee_bps")?,
                    fees: dec_col(row, "fees")?,
                    notional: dec_col(row, "notional")?,
                    strategy: row.try_get("strategy")?,
                    exit_reason: row.try_get("exit_reason")?,
                    realized_pnl: opt_dec_col(row, "realized_pnl")?,
                    executed_at: row.try_get("executed_at")?,
                })
            })
            .collect()
    }

    // =========================================================================
    // Atomic batch commit
    // =========================================================================

    /// Apply a committed portfolio transaction in one SQL transaction.
    ///
    /// Cash row, position writes, lot replacements, and trade appends all
    /// land together or not at all.
    pub async fn apply_commit(&self, commit: &LedgerCommit) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        if let Some(row) = &commit.cash_row {
            sqlx::query(
                r#"
                INSERT INTO cash_equity
                    (session_id, cash_balance, total_equity, total_fees, total_realized_pnl, total_unrealized_pnl, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&row.session_id)
            .bind(dec_text(row.cash_balance))
            .bind(dec_text(row.total_equity))
            .bind(dec_text(row.total_fees))
            .bind(dec_text(row.total_realized_pnl))
            .bind(dec_text(row.total_unrealized_pnl))
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for write in &commit.positions {
            write_position(
                &mut tx,
                &commit.session_id,
                &write.symbol,
                write.quantity,
                write.entry_price,
                write.current_price,
                &write.strategy,
            )
            .await?;
        }

        for (symbol, lots) in &commit.lots {
            sqlx::query("DELETE FROM lots WHERE session_id = ?1 AND symbol = ?2")
                .bind(&commit.session_id)
                .bind(symbol)
                .execute(&mut *tx)
                .await?;
            for lot in lots {
                sqlx::query(
                    r#"
                    INSERT INTO lots
                        (lot_id, session_id, symbol, seq, entry_price, entry_fee, quantity_remaining, opened_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )
                .bind(&lot.lot_id)
                .bind(&commit.session_id)
                .bind(symbol)
                .bind(lot.seq)
                .bind(dec_text(lot.entry_price))
                .bind(dec_text(lot.entry_fee))
                .bind(dec_text(lot.quantity_remaining))
                .bind(lot.opened_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        for trade in &commit.trades {
            check_trade_monotonic(&mut tx, trade).await?;
            insert_trade(&mut tx, trade).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn write_position(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
    symbol: &str,
    quantity: Decimal,
    entry_price: Decimal,
    current_price: Decimal,
    strategy: &str,
) -> Result<(), LedgerError> {
    // Collapse to the single-row form: clear all rows for the key, then
    // insert the one survivor if the quantity is meaningful.
    sqlx::query("DELETE FROM positions WHERE session_id = ?1 AND symbol = ?2")
        .bind(session_id)
        .bind(symbol)
        .execute(&mut **tx)
        .await?;

    if quantity.abs() > DUST_QTY {
        sqlx::query(
            r#"
            INSERT INTO positions
                (session_id, symbol, quantity, entry_price, current_price, strategy, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(session_id)
        .bind(symbol)
        .bind(dec_text(quantity))
        .bind(dec_text(entry_price))
        .bind(dec_text(current_price))
        .bind(strategy)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn check_trade_monotonic(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    trade: &TradeRecord,
) -> Result<(), LedgerError> {
    let last: Option<DateTime<Utc>> =
        sqlx::query("SELECT executed_at FROM trades WHERE session_id = ?1 ORDER BY executed_at DESC LIMIT 1")
            .bind(&trade.session_id)
            .fetch_optional(&mut **tx)
            .await?
            .map(|row| row.try_get("executed_at"))
            .transpose()?;

    if let Some(last) = last {
        if trade.executed_at < last {
            return Err(LedgerError::NonMonotonicTrade {
                trade_id: trade.trade_id.clone(),
                executed_at: trade.executed_at,
                last,
            });
        }
    }
    Ok(())
}

async fn insert_trade(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    trade: &TradeRecord,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO trades
            (trade_id, session_id, symbol, side, quantity, mark_price, effective_fill_price,
             slippage_bps, fee_bps, fees, notional, strategy, exit_reason, realized_pnl, executed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
    )
    .bind(&trade.trade_id)
    .bind(&trade.session_id)
    .bind(&trade.symbol)
    .bind(trade.side.to_string())
    .bind(dec_text(trade.quantity))
    .bind(dec_text(trade.mark_price))
    .bind(dec_text(trade.effective_fill_price))
    .bind(dec_text(trade.slippage_bps))
    .bind(dec_text(trade.fee_bps))
    .bind(dec_text(trade.fees))
    .bind(dec_text(trade.notional))
    .bind(&trade.strategy)
    .bind(&trade.exit_reason)
    .bind(trade.realized_pnl.map(dec_text))
    .bind(trade.executed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
