//! Folio: portfolio state core for a crypto paper-trading system.
//!
//! This crate maintains cash, positions, FIFO lot books, and equity under
//! simulated fills, exit brackets, and per-cycle price snapshots, while
//! preserving strict accounting invariants at every commit.
//!
//! ## Architecture
//!
//! - **Single-writer ledger**: all durable state flows through `StateLedger`;
//!   only the cycle engine mutates it.
//! - **Frozen pricing**: one immutable `PricingSnapshot` per cycle; every
//!   valuation in the cycle reads the same snapshot id.
//! - **Staged commits**: a `PortfolioTransaction` stages cash/position/lot
//!   deltas and validates only the final state before an atomic batch write.
//!
//! ## Modules
//!
//! - `config`: TOML configuration with typed decimal values and validation
//! - `ledger`: durable SQLite-backed store (sessions, cash/equity, positions, lots, trades)
//! - `pricing`: snapshot service with retries, staleness, and provenance locks
//! - `portfolio`: transactional staging and the FIFO lot book
//! - `decision`: gate pipeline and the deterministic action router
//! - `sizing`: ATR-normalized sizing and exchange quantization
//! - `brackets`: stop-loss / take-profit ladder engine with OCO linking
//! - `fills`: fee and slippage simulation
//! - `budget`: exploration budget isolated from normal trading
//! - `engine`: the per-cycle orchestrator

pub mod brackets;
pub mod budget;
pub mod config;
pub mod decision;
pub mod engine;
pub mod fills;
pub mod ledger;
pub mod portfolio;
pub mod pricing;
pub mod sizing;
pub mod stats;

pub use brackets::{Bracket, BracketEngine, BracketState, ExitInstruction, ExitKind};
pub use budget::{BudgetRejection, ExplorationBudget};
pub use config::BotConfig;
pub use decision::router::{route_action, OrderIntent, RoutedSide};
pub use decision::{Decision, DecisionPipeline, DecisionTrace, RoutedOrder, ScoredCandidate};
pub use engine::{CycleEngine, CycleReport};
pub use fills::{Fill, FillParams, FillSimulator};
pub use ledger::{
    CashEquityRow, LedgerCommit, LedgerError, LotRow, PositionRecord, SessionRecord, SessionStatus,
    StateLedger, TradeRecord,
};
pub use portfolio::lots::{ConsumeResult, Lot, LotBook};
pub use portfolio::transaction::{
    CommitOutcome, CriticalError, DiffReport, PortfolioTransaction, TransactionError,
};
pub use pricing::source::{MarketDataSource, ReplayDataSource};
pub use pricing::{PriceData, PricingSnapshot, SnapshotService};
pub use sizing::atr::AtrService;
pub use sizing::{PositionSizer, SizedOrder, SizingError};
pub use stats::{SessionStats, StatsSummary};
