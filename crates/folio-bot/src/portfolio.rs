//! Transactional portfolio mutations and FIFO lot accounting.
//!
//! `LotBook` tracks entry lots per symbol and computes realized P&L on FIFO
//! consumption. `PortfolioTransaction` stages one decision's worth of cash,
//! position, lot, and realized-P&L deltas, validates only the final staged
//! state, and commits through the ledger atomically or discards cleanly.

pub mod lots;
pub mod transaction;

pub use lots::{ConsumeResult, Lot, LotBook, LotError};
pub use transaction::{
    CommitOutcome, CriticalError, DiffReport, PortfolioTransaction, SymbolDiff, TransactionError,
};
