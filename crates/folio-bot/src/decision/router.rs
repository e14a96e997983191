//! Deterministic mapping of final action to order side and intent.
//!
//! `(final_action, has_position, position_side, shorting_allowed, is_pilot,
//! is_exploration)` fully determines `(side, intent, reason)`. A SELL is
//! never silently promoted to a BUY, and shorting requires both the global
//! switch and the per-symbol permission, resolved by the caller.

use serde::Serialize;

use folio_common::{FinalAction, PositionSide, Side};

/// Order intent classification.
///
/// Budget checks apply only to `Pilot` and `Explore`; `Normal`, `Exit`, and
/// `RiskManagement` bypass the exploration budget entirely. Normal trades
/// must never be blocked by exploration budget exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIntent {
    Normal,
    Pilot,
    Explore,
    Exit,
    RiskManagement,
}

impl OrderIntent {
    /// Whether this intent draws from the exploration budget.
    pub fn uses_exploration_budget(&self) -> bool {
        matches!(self, OrderIntent::Pilot | OrderIntent::Explore)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderIntent::Normal => "normal",
            OrderIntent::Pilot => "pilot",
            OrderIntent::Explore => "explore",
            OrderIntent::Exit => "exit",
            OrderIntent::RiskManagement => "risk",
        }
    }
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Routed side: a concrete order side or an explicit skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutedSide {
    Order(Side),
    Skip,
}

/// Routing inputs.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext {
    pub has_position: bool,
    pub position_side: Option<PositionSide>,
    pub shorting_allowed: bool,
    pub is_pilot: bool,
    pub is_exploration: bool,
}

fn base_intent(ctx: &RouteContext) -> OrderIntent {
    if ctx.is_exploration {
        OrderIntent::Explore
    } else if ctx.is_pilot {
        OrderIntent::Pilot
    } else {
        OrderIntent::Normal
    }
}

/// Route a final action deterministically.
///
/// Returns `(side, intent, reason)`. Every (input, output) pair is explicit;
/// there is no fallthrough.
pub fn route_action(
    action: FinalAction,
    ctx: &RouteContext,
) -> (RoutedSide, OrderIntent, &'static str) {
    let intent = base_intent(ctx);

    match action {
        FinalAction::Buy => match (ctx.has_position, ctx.position_side) {
            (true, Some(PositionSide::Short)) => {
                (RoutedSide::Order(Side::Buy), OrderIntent::Exit, "close_short")
            }
            (true, Some(PositionSide::Long)) => {
                (RoutedSide::Skip, intent, "already_long_no_pyramid")
            }
            _ => (RoutedSide::Order(Side::Buy), intent, "open_long"),
        },
        FinalAction::Sell => match (ctx.has_position, ctx.position_side) {
            (true, Some(PositionSide::Long)) => {
                // Closing a long is always allowed regardless of shorting.
                (RoutedSide::Order(Side::Sell), OrderIntent::Exit, "close_long")
            }
            (true, Some(PositionSide::Short)) => {
                (RoutedSide::Skip, intent, "already_short_no_pyramid")
            }
            _ => {
                if ctx.shorting_allowed {
                    (RoutedSide::Order(Side::Sell), intent, "open_short")
                } else {
                    (RoutedSide::Skip, intent, "shorting_disabled")
                }
            }
        },
        FinalAction::Close => match (ctx.has_position, ctx.position_side) {
            (true, Some(PositionSide::Long)) => {
                (RoutedSide::Order(Side::Sell), OrderIntent::Exit, "close_long")
            }
            (true, Some(PositionSide::Short)) => {
                (RoutedSide::Order(Side::Buy), OrderIntent::Exit, "close_short")
            }
            _ => (RoutedSide::Skip, intent, "no_position_to_close"),
        },
        FinalAction::Hold => (RoutedSide::Skip, intent, "hold_signal"),
        FinalAction::Skip => (RoutedSide::Skip, intent, "skip_signal"),
    }
}
