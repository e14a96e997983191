//! Session statistics: counters and a summary for end-of-session logging.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// Running counters for one session.
#[derive(Debug)]
pub struct SessionStats {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    cycles: u64,
    decisions: u64,
    skips: u64,
    trades_executed: u64,
    trades_discarded: u64,
    commits: u64,
    reconciles: u64,
    discards: u64,
    wins: u64,
    losses: u64,
    fees_paid: Decimal,
    realized_pnl: Decimal,
    max_equity: Decimal,
    max_drawdown: Decimal,
}

impl SessionStats {
    pub fn new(starting_equity: Decimal) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            cycles: 0,
            decisions: 0,
            skips: 0,
            trades_executed: 0,
            trades_discarded: 0,
            commits: 0,
            reconciles: 0,
            discards: 0,
            wins: 0,
            losses: 0,
            fees_paid: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            max_equity: starting_equity,
            max_drawdown: Decimal::ZERO,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record_cycle(&mut self) {
        self.cycles += 1;
    }

    pub fn record_decision(&mut self) {
        self.decisions += 1;
    }

    pub fn record_skip(&mut self) {
        self.skips += 1;
    }

    pub fn record_trades(&mut self, count: u64) {
        self.trades_executed += count;
    }

    /// Record an applied commit. The sign of the cycle's realized P&L feeds
    /// win/loss tracking; a cycle with no realized outcome counts as neither.
    pub fn record_commit(&mut self, fees: Decimal, realized: Decimal) {
        self.commits += 1;
        self.fees_paid += fees;
        self.realized_pnl += realized;
        if realized > Decimal::ZERO {
            self.wins += 1;
        } else if realized < Decimal::ZERO {
            self.losses += 1;
        }
    }

    pub fn record_reconcile(&mut self) {
        self.reconciles += 1;
    }

    pub fn record_discard(&mut self, dropped_trades: u64) {
        self.discards += 1;
        self.trades_discarded += dropped_trades;
    }

    /// Track equity high-water mark and drawdown.
    pub fn observe_equity(&mut self, equity: Decimal) {
        if equity > self.max_equity {
            self.max_equity = equity;
        }
        let drawdown = self.max_equity - equity;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            cycles: self.cycles,
            decisions: self.decisions,
            skips: self.skips,
            trades_executed: self.trades_executed,
            trades_discarded: self.trades_discarded,
            commits: self.commits,
            reconciles: self.reconciles,
            discards: self.discards,
            wins: self.wins,
            losses: self.losses,
            fees_paid: self.fees_paid,
            realized_pnl: self.realized_pnl,
            max_equity: self.max_equity,
            max_drawdown: self.max_drawdown,
        }
    }

    /// Log the end-of-session summary.
    pub fn log_summary(&self) {
        let summary = self.summary();
        info!(
            run_id = %summary.run_id,
            cycles = summary.cycles,
            decisions = summary.decisions,
            skips = summary.skips,
            trades = summary.trades_executed,
            commits = summary.commits,
            reconciles = summary.reconciles,
            discards = summary.discards,
            wins = summary.wins,
            losses = summary.losses,
            win_rate = %summary.win_rate(),
            fees = %summary.fees_paid,
            realized_pnl = %summary.realized_pnl,
            max_drawdown = %summary.max_drawdown,
            "Session summary"
        );
    }
}

/// Immutable snapshot of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cycles: u64,
    pub decisions: u64,
    pub skips: u64,
    pub trades_executed: u64,
    pub trades_discarded: u64,
    pub commits: u64,
    pub reconciles: u64,
    pub discards: u64,
    pub wins: u64,
    pub losses: u64,
    pub fees_paid: Decimal,
    pub realized_pnl: Decimal,
    pub max_equity: Decimal,
    pub max_drawdown: Decimal,
}

impl StatsSummary {
    /// Percentage of decided outcomes that were wins. Zero with no outcomes.
    pub fn win_rate(&self) -> Decimal {
        let total = self.wins + self.losses;
        if total == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(total) * Decimal::ONE_HUNDRED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counters() {
        let mut stats = SessionStats::new(dec!(10000));
        stats.record_cycle();
        stats.record_decision();
        stats.record_skip();
        stats.record_trades(2);
        stats.record_commit(dec!(1.25), dec!(10));
        stats.record_reconcile();
        stats.record_discard(1);

        let summary = stats.summary();
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.trades_executed, 2);
        assert_eq!(summary.trades_discarded, 1);
        assert_eq!(summary.fees_paid, dec!(1.25));
        assert_eq!(summary.realized_pnl, dec!(10));
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.losses, 0);
    }

    #[test]
    fn test_win_rate() {
        let mut stats = SessionStats::new(dec!(10000));
        // No outcomes yet: rate is zero, not a division error.
        assert_eq!(stats.summary().win_rate(), Decimal::ZERO);

        stats.record_commit(dec!(1), dec!(25));
        stats.record_commit(dec!(1), dec!(-10));
        stats.record_commit(dec!(1), dec!(5));
        // A commit with no realized outcome counts as neither win nor loss.
        stats.record_commit(dec!(1), Decimal::ZERO);

        let summary = stats.summary();
        assert_eq!(summary.wins, 2);
        assert_eq!(summary.losses, 1);
        // 2 wins out of 3 decided outcomes.
        assert!((summary.win_rate() - dec!(66.67)).abs() < dec!(0.01));
        assert_eq!(summary.realized_pnl, dec!(20));
    }

    #[test]
    fn test_drawdown_tracking() {
        let mut stats = SessionStats::new(dec!(10000));
        stats.observe_equity(dec!(10500));
        stats.observe_equity(dec!(10200));
        stats.observe_equity(dec!(10600));
        stats.observe_equity(dec!(10100));

        let summary = stats.summary();
        assert_eq!(summary.max_equity, dec!(10600));
        assert_eq!(summary.max_drawdown, dec!(500));
    }
}
