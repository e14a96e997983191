//! Bracket engine: stop-loss, take-profit ladder, OCO linking, time stop.
//!
//! Every entry fill gets a bracket: one stop-loss plus a take-profit ladder
//! (default rungs at [0.6, 1.2, 2.0] R closing [40%, 40%, 20%] of the
//! position), all linked in one OCO group keyed by symbol. Transitions:
//!
//! - TP1 fills: stop moves to breakeven (entry price)
//! - TP2 fills: stop trails to entry +/- 0.5 R
//! - TP3 or stop fills: position flat, remaining orders cancelled
//! - Time stop: `max_bars_in_trade` bars without TP1 cancels everything and
//!   market-closes the remainder
//!
//! OCO invariant: the sum of active reduce-only quantities never exceeds the
//! remaining position quantity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use folio_common::{quantize_price, quantize_qty, venue_rules_for, PositionSide, Side};

use crate::config::{ExecutionConfig, RealizationConfig, TpRung};

const QTY_DUST: Decimal = dec!(0.00000001);

/// Lifecycle of one bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketState {
    Open,
    Tp1Filled,
    Tp2Filled,
    Closed,
    TimedOut,
}

/// Which exit order produced a fill or instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    StopLoss,
    /// 1-based rung index into the TP ladder.
    TakeProfit(u8),
    TimeStop,
}

impl ExitKind {
    pub fn reason(&self) -> &'static str {
        match self {
            ExitKind::StopLoss => "stop_loss",
            ExitKind::TakeProfit(1) => "take_profit_1",
            ExitKind::TakeProfit(2) => "take_profit_2",
            ExitKind::TakeProfit(_) => "take_profit_3",
            ExitKind::TimeStop => "time_stop",
        }
    }
}

/// One resting exit order inside a bracket.
#[derive(Debug, Clone)]
pub struct ExitOrder {
    pub order_id: String,
    pub kind: ExitKind,
    pub price: Decimal,
    pub quantity: Decimal,
    pub active: bool,
}

/// A bracket attached to an entry fill.
#[derive(Debug, Clone)]
pub struct Bracket {
    pub entry_fill_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub risk_unit: Decimal,
    pub stop: ExitOrder,
    pub tps: Vec<ExitOrder>,
    pub oco_group_id: String,
    pub state: BracketState,
    pub bars_since_entry: u64,
    pub opened_at: DateTime<Utc>,
    /// Quantity still held against this bracket.
    remaining_qty: Decimal,
}

impl Bracket {
    /// Quantity still protected by this bracket.
    pub fn remaining_qty(&self) -> Decimal {
        self.remaining_qty
    }

    /// Sum of active reduce-only quantities in the OCO group.
    pub fn open_reduce_qty(&self) -> Decimal {
        let tp_qty: Decimal = self
            .tps
            .iter()
            .filter(|tp| tp.active)
            .map(|tp| tp.quantity)
            .sum();
        let sl_qty = if self.stop.active {
            self.stop.quantity
        } else {
            Decimal::ZERO
        };
        // The stop covers the whole remainder and the TPs slice it; the OCO
        // invariant is on each order class, not their sum.
        tp_qty.max(sl_qty)
    }

    /// The order side that reduces this bracket's position.
    pub fn exit_side(&self) -> Side {
        self.side.closing_side()
    }

    fn tp1_filled(&self) -> bool {
        !matches!(self.state, BracketState::Open)
    }
}

/// An exit the engine wants simulated this cycle.
#[derive(Debug, Clone)]
pub struct ExitInstruction {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    /// Limit price for TP/SL exits; `None` means market close.
    pub limit_price: Option<Decimal>,
    pub kind: ExitKind,
    pub reason: &'static str,
}

/// How an entry should execute under post-only routing.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPlan {
    Execute {
        price: Decimal,
        is_maker: bool,
        is_market: bool,
    },
    GiveUp {
        reason: &'static str,
    },
}

/// Route an entry through the post-only policy.
///
/// Post-only entries rest at the passive side of the book (bid for buys, ask
/// for sells) and fill as maker. With a locked or crossed book the passive
/// price does not exist; fall back to taker only when configured, otherwise
/// give up for this cycle. A post-only order is never silently promoted.
pub fn route_entry(
    side: Side,
    bid: Option<Decimal>,
    ask: Option<Decimal>,
    mark: Decimal,
    config: &ExecutionConfig,
) -> EntryPlan {
    if !config.post_only {
        return EntryPlan::Execute {
            price: mark,
            is_maker: false,
            is_market: true,
        };
    }

    let passive = match side {
        Side::Buy => bid,
        Side::Sell => ask,
    };
    let book_ok = matches!((bid, ask), (Some(b), Some(a)) if b > Decimal::ZERO && a > b);

    match passive {
        Some(price) if book_ok => EntryPlan::Execute {
            price,
            is_maker: true,
            is_market: false,
        },
        _ => {
            if config.allow_taker_fallback {
                EntryPlan::Execute {
                    price: mark,
                    is_maker: false,
                    is_market: true,
                }
            } else {
                EntryPlan::GiveUp {
                    reason: "post_only_timeout",
                }
            }
        }
    }
}

/// Manages every active bracket, one per symbol.
#[derive(Debug)]
pub struct BracketEngine {
    ladder: Vec<TpRung>,
    risk_pct: Decimal,
    max_bars_in_trade: u64,
    /// Wall-clock backstop for slow bar cadences.
    time_stop_hours: u64,
    brackets: HashMap<String, Bracket>,
}

impl BracketEngine {
    pub fn new(realization: &RealizationConfig, risk_pct: Decimal) -> Self {
        Self {
            ladder: realization.take_profit_ladder.clone(),
            risk_pct,
            max_bars_in_trade: realization.max_bars_in_trade,
            time_stop_hours: realization.time_stop_hours,
            brackets: HashMap::new(),
        }
    }

    pub fn bracket(&self, symbol: &str) -> Option<&Bracket> {
        self.brackets.get(symbol)
    }

    pub fn has_bracket(&self, symbol: &str) -> bool {
        self.brackets.contains_key(symbol)
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.brackets.keys().cloned().collect()
    }

    /// Attach a bracket to an entry fill.
    ///
    /// Prices are quantized to the venue tick. TP quantities are step-rounded
    /// down, with the final rung absorbing the remainder so the ladder closes
    /// exactly the position quantity.
    pub fn attach_on_entry(
        &mut self,
        entry_fill_id: &str,
        symbol: &str,
        side: PositionSide,
        entry_price: Decimal,
        quantity: Decimal,
    ) -> &Bracket {
        let rules = venue_rules_for(symbol);
        let risk_unit = entry_price * self.risk_pct;

        let stop_price = match side {
            PositionSide::Long => entry_price - risk_unit,
            PositionSide::Short => entry_price + risk_unit,
        };

        let mut tps = Vec::with_capacity(self.ladder.len());
        let mut allocated = Decimal::ZERO;
        for (i, rung) in self.ladder.iter().enumerate() {
            let price = match side {
                PositionSide::Long => entry_price + rung.r * risk_unit,
                PositionSide::Short => entry_price - rung.r * risk_unit,
            };
            let qty = if i + 1 == self.ladder.len() {
                quantity - allocated
            } else {
                quantize_qty(rung.pct * quantity, &rules)
            };
            allocated += qty;
            tps.push(ExitOrder {
                order_id: format!("{}_TP{}", entry_fill_id, i + 1),
                kind: ExitKind::TakeProfit(i as u8 + 1),
                price: quantize_price(price, &rules),
                quantity: qty,
                active: qty > QTY_DUST,
            });
        }

        let bracket = Bracket {
            entry_fill_id: entry_fill_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            risk_unit,
            stop: ExitOrder {
                order_id: format!("{}_SL", entry_fill_id),
                kind: ExitKind::StopLoss,
                price: quantize_price(stop_price, &rules),
                quantity,
                active: true,
            },
            tps,
            oco_group_id: Uuid::new_v4().to_string(),
            state: BracketState::Open,
            bars_since_entry: 0,
            opened_at: Utc::now(),
            remaining_qty: quantity,
        };

        info!(
            symbol = %symbol,
            entry = %bracket.entry_price,
            stop = %bracket.stop.price,
            tp1 = %bracket.tps.first().map(|t| t.price).unwrap_or_default(),
            risk_unit = %risk_unit,
            oco_group = %bracket.oco_group_id,
            "Bracket attached"
        );

        self.brackets.insert(symbol.to_string(), bracket);
        self.brackets.get(symbol).expect("bracket just inserted")
    }

    /// Advance one bar and collect exits triggered by the cycle's mark.
    ///
    /// Triggered orders deactivate immediately (they are considered sent);
    /// the caller simulates their fills and reports back through
    /// `on_exit_filled`. The adverse case wins when a bar straddles both the
    /// stop and a take profit.
    pub fn tick(&mut self, symbol: &str, mark: Decimal) -> Vec<ExitInstruction> {
        let bracket = match self.brackets.get_mut(symbol) {
            Some(bracket) => bracket,
            None => return Vec::new(),
        };
        bracket.bars_since_entry += 1;

        let mut instructions = Vec::new();
        let exit_side = bracket.exit_side();

        let stop_hit = bracket.stop.active
            && match bracket.side {
                PositionSide::Long => mark <= bracket.stop.price,
                PositionSide::Short => mark >= bracket.stop.price,
            };
        if stop_hit {
            bracket.stop.active = false;
            instructions.push(ExitInstruction {
                symbol: symbol.to_string(),
                side: exit_side,
                quantity: bracket.remaining_qty,
                limit_price: Some(bracket.stop.price),
                kind: ExitKind::StopLoss,
                reason: ExitKind::StopLoss.reason(),
            });
            // Stop closes everything; nothing else can trigger.
            return instructions;
        }

        for tp in bracket.tps.iter_mut() {
            if !tp.active {
                continue;
            }
            let hit = match bracket.side {
                PositionSide::Long => mark >= tp.price,
                PositionSide::Short => mark <= tp.price,
            };
            if hit {
                tp.active = false;
                instructions.push(ExitInstruction {
                    symbol: symbol.to_string(),
                    side: exit_side,
                    quantity: tp.quantity,
                    limit_price: Some(tp.price),
                    kind: tp.kind,
                    reason: tp.kind.reason(),
                });
            }
        }

        // Time stop: no TP1 after the bar budget (or the wall-clock backstop
        // for slow bar cadences) cancels the bracket and market-closes the
        // remainder.
        let wall_clock_expired = self.time_stop_hours > 0
            && (Utc::now() - bracket.opened_at).num_hours() >= self.time_stop_hours as i64;
        if instructions.is_empty()
            && !bracket.tp1_filled()
            && (bracket.bars_since_entry >= self.max_bars_in_trade || wall_clock_expired)
        {
            let quantity = bracket.remaining_qty;
            bracket.stop.active = false;
            for tp in bracket.tps.iter_mut() {
                tp.active = false;
            }
            warn!(
                symbol = %symbol,
                bars = bracket.bars_since_entry,
                "Time stop: closing position at market"
            );
            instructions.push(ExitInstruction {
                symbol: symbol.to_string(),
                side: exit_side,
                quantity,
                limit_price: None,
                kind: ExitKind::TimeStop,
                reason: ExitKind::TimeStop.reason(),
            });
        }

        instructions
    }

    /// Apply a confirmed exit fill and run the state machine.
    pub fn on_exit_filled(&mut self, symbol: &str, kind: ExitKind, quantity: Decimal) {
        let bracket = match self.brackets.get_mut(symbol) {
            Some(bracket) => bracket,
            None => return,
        };
        bracket.remaining_qty = (bracket.remaining_qty - quantity).max(Decimal::ZERO);
        bracket.stop.quantity = bracket.remaining_qty;
        clamp_tp_quantities(bracket);

        match kind {
            ExitKind::TakeProfit(1) => {
                bracket.state = BracketState::Tp1Filled;
                // Risk after TP1 is zero: stop to breakeven.
                bracket.stop.price = quantize_price(
                    bracket.entry_price,
                    &venue_rules_for(symbol),
                );
                info!(
                    symbol = %symbol,
                    stop = %bracket.stop.price,
                    "TP1 filled; stop moved to breakeven"
                );
            }
            ExitKind::TakeProfit(2) => {
                bracket.state = BracketState::Tp2Filled;
                let offset = dec!(0.5) * bracket.risk_unit;
                let trailed = match bracket.side {
                    PositionSide::Long => bracket.entry_price + offset,
                    PositionSide::Short => bracket.entry_price - offset,
                };
                bracket.stop.price = quantize_price(trailed, &venue_rules_for(symbol));
                info!(
                    symbol = %symbol,
                    stop = %bracket.stop.price,
                    "TP2 filled; stop trailed to lock profit"
                );
            }
            ExitKind::TakeProfit(_) => {
                self.close_bracket(symbol, BracketState::Closed);
                return;
            }
            ExitKind::StopLoss => {
                self.close_bracket(symbol, BracketState::Closed);
                return;
            }
            ExitKind::TimeStop => {
                self.close_bracket(symbol, BracketState::TimedOut);
                return;
            }
        }

        if bracket.remaining_qty <= QTY_DUST {
            self.close_bracket(symbol, BracketState::Closed);
        }
    }

    /// The position shrank outside the bracket (strategy exit). Shrink the
    /// OCO group to match; a flat position drops the bracket entirely.
    pub fn on_external_reduction(&mut self, symbol: &str, new_position_qty: Decimal) {
        let bracket = match self.brackets.get_mut(symbol) {
            Some(bracket) => bracket,
            None => return,
        };
        let new_abs = new_position_qty.abs();
        if new_abs <= QTY_DUST {
            self.cancel_bracket(symbol, "position_closed_externally");
            return;
        }
        if new_abs < bracket.remaining_qty {
            bracket.remaining_qty = new_abs;
            bracket.stop.quantity = new_abs;
            clamp_tp_quantities(bracket);
            debug!(symbol = %symbol, remaining = %new_abs, "OCO group shrunk to position");
        }
    }

    /// Cancel every order in the bracket and drop it.
    pub fn cancel_bracket(&mut self, symbol: &str, reason: &str) {
        if let Some(bracket) = self.brackets.remove(symbol) {
            info!(
                symbol = %symbol,
                oco_group = %bracket.oco_group_id,
                reason = %reason,
                "Bracket cancelled"
            );
        }
    }

    fn close_bracket(&mut self, symbol: &str, state: BracketState) {
        if let Some(mut bracket) = self.brackets.remove(symbol) {
            bracket.state = state;
            info!(
                symbol = %symbol,
                state = ?state,
                oco_group = %bracket.oco_group_id,
                "Bracket closed; remaining OCO orders cancelled"
            );
        }
    }
}

/// Keep the sum of active TP quantities within the remaining position.
fn clamp_tp_quantities(bracket: &mut Bracket) {
    let mut budget = bracket.remaining_qty;
    for tp in bracket.tps.iter_mut() {
        if !tp.active {
            continue;
        }
        if tp.quantity > budget {
            if budget <= QTY_DUST {
                tp.active = false;
                tp.quantity = Decimal::ZERO;
            } else {
                tp.quantity = budget;
            }
        }
        budget -= tp.quantity.min(budget);
    }
}
