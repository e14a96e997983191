//! Exploration budget: a side channel for PILOT/EXPLORE entries.
//!
//! Per-UTC-day USD budget (a fraction of equity), a per-day count cap, a
//! minimum score, and a size multiplier. Strictly isolated from normal
//! trading: NORMAL, EXIT, and RISK_MANAGEMENT intents never consult or
//! deplete it, so a drained budget can never block a normal trade.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ExplorationConfig;
use crate::decision::router::OrderIntent;

/// Why an exploration reservation was refused.
#[derive(Debug, Error, PartialEq)]
pub enum BudgetRejection {
    #[error("Exploration budget exhausted: spent ${spent} of ${budget} today")]
    BudgetExhausted { spent: Decimal, budget: Decimal },

    #[error("Exploration count cap reached: {count} of {cap} today")]
    CountExhausted { count: u32, cap: u32 },

    #[error("Score {score} below exploration minimum {min_score}")]
    ScoreTooLow { score: Decimal, min_score: Decimal },
}

/// Daily exploration budget accounting.
#[derive(Debug)]
pub struct ExplorationBudget {
    config: ExplorationConfig,
    day: NaiveDate,
    spent_usd: Decimal,
    count: u32,
}

impl ExplorationBudget {
    pub fn new(config: ExplorationConfig) -> Self {
        Self {
            config,
            day: Utc::now().date_naive(),
            spent_usd: Decimal::ZERO,
            count: 0,
        }
    }

    /// Size multiplier exploration orders carry into the sizer.
    pub fn size_mult(&self) -> Decimal {
        self.config.size_mult_vs_normal
    }

    /// USD spent today.
    pub fn spent_today(&self) -> Decimal {
        self.spent_usd
    }

    /// Entries taken today.
    pub fn count_today(&self) -> u32 {
        self.count
    }

    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            debug!(day = %today, "Exploration budget reset for new day");
            self.day = today;
            self.spent_usd = Decimal::ZERO;
            self.count = 0;
        }
    }

    /// Check whether an exploration entry may proceed.
    ///
    /// Non-exploration intents pass unconditionally and without side
    /// effects; the budget is invisible to them.
    pub fn check(
        &mut self,
        intent: OrderIntent,
        score: Decimal,
        notional: Decimal,
        equity: Decimal,
    ) -> Result<(), BudgetRejection> {
        if !intent.uses_exploration_budget() {
            return Ok(());
        }
        self.roll_day();

        if score < self.config.min_score {
            return Err(BudgetRejection::ScoreTooLow {
                score,
                min_score: self.config.min_score,
            });
        }
        if self.count >= self.config.max_forced_per_day {
            return Err(BudgetRejection::CountExhausted {
                count: self.count,
                cap: self.config.max_forced_per_day,
            });
        }
        let budget = self.config.budget_pct * equity;
        if self.spent_usd + notional > budget {
            return Err(BudgetRejection::BudgetExhausted {
                spent: self.spent_usd,
                budget,
            });
        }
        Ok(())
    }

    /// Record a filled exploration entry. No-op for other intents.
    pub fn record_spend(&mut self, intent: OrderIntent, notional: Decimal) {
        if !intent.uses_exploration_budget() {
            return;
        }
        self.roll_day();
        self.spent_usd += notional;
        self.count += 1;
        info!(
            spent = %self.spent_usd,
            count = self.count,
            "Exploration budget spend recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> ExplorationConfig {
        ExplorationConfig {
            budget_pct: dec!(0.02),
            max_forced_per_day: 2,
            min_score: dec!(0.40),
            size_mult_vs_normal: dec!(0.5),
        }
    }

    #[test]
    fn test_normal_intents_bypass() {
        let mut budget = ExplorationBudget::new(config());
        // Exhaust the exploration side completely.
        budget.record_spend(OrderIntent::Explore, dec!(10000));
        budget.record_spend(OrderIntent::Explore, dec!(10000));

        // Normal, exit, and risk intents still pass and record nothing.
        for intent in [OrderIntent::Normal, OrderIntent::Exit, OrderIntent::RiskManagement] {
            assert!(budget.check(intent, dec!(0.0), dec!(1000000), dec!(1)).is_ok());
            budget.record_spend(intent, dec!(1000000));
        }
        assert_eq!(budget.count_today(), 2);
        assert_eq!(budget.spent_today(), dec!(20000));
    }

    #[test]
    fn test_score_gate() {
        let mut budget = ExplorationBudget::new(config());
        let err = budget
            .check(OrderIntent::Explore, dec!(0.30), dec!(100), dec!(10000))
            .unwrap_err();
        assert!(matches!(err, BudgetRejection::ScoreTooLow { .. }));
    }

    #[test]
    fn test_usd_budget_gate() {
        let mut budget = ExplorationBudget::new(config());
        // 2% of $10,000 = $200 budget.
        assert!(budget
            .check(OrderIntent::Explore, dec!(0.5), dec!(150), dec!(10000))
            .is_ok());
        budget.record_spend(OrderIntent::Explore, dec!(150));

        let err = budget
            .check(OrderIntent::Explore, dec!(0.5), dec!(100), dec!(10000))
            .unwrap_err();
        assert!(matches!(err, BudgetRejection::BudgetExhausted { .. }));
    }

    #[test]
    fn test_count_gate() {
        let mut budget = ExplorationBudget::new(config());
        budget.record_spend(OrderIntent::Pilot, dec!(10));
        budget.record_spend(OrderIntent::Pilot, dec!(10));

        let err = budget
            .check(OrderIntent::Pilot, dec!(0.5), dec!(10), dec!(1000000))
            .unwrap_err();
        assert!(matches!(err, BudgetRejection::CountExhausted { .. }));
    }

    #[test]
    fn test_pilot_uses_budget() {
        let mut budget = ExplorationBudget::new(config());
        assert!(budget
            .check(OrderIntent::Pilot, dec!(0.5), dec!(100), dec!(10000))
            .is_ok());
        budget.record_spend(OrderIntent::Pilot, dec!(100));
        assert_eq!(budget.count_today(), 1);
    }
}
