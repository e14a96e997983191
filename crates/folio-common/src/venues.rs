//! Static venue mapping and per-symbol exchange rules.
//!
//! Symbols outside this table are tagged `unsupported` by the pricing layer
//! and skipped by the decision pipeline; they are never mock-filled.

use rust_decimal_macros::dec;

use crate::money::VenueRules;
use crate::types::Venue;

/// One row of the static venue mapping table.
#[derive(Debug, Clone, Copy)]
pub struct VenueMapping {
    /// Canonical symbol as used throughout the system, e.g. "BTC/USDT".
    pub symbol: &'static str,
    /// Venue that quotes this symbol.
    pub venue: Venue,
    /// Venue-native symbol, e.g. "BTC-USDT".
    pub normalized: &'static str,
}

/// Supported symbols and where they execute.
pub static VENUE_MAP: &[VenueMapping] = &[
    VenueMapping {
        symbol: "BTC/USDT",
        venue: Venue::Coinbase,
        normalized: "BTC-USDT",
    },
    VenueMapping {
        symbol: "ETH/USDT",
        venue: Venue::Coinbase,
        normalized: "ETH-USDT",
    },
    VenueMapping {
        symbol: "SOL/USDT",
        venue: Venue::Coinbase,
        normalized: "SOL-USDT",
    },
    VenueMapping {
        symbol: "XRP/USDT",
        venue: Venue::Binance,
        normalized: "XRPUSDT",
    },
    VenueMapping {
        symbol: "DOGE/USDT",
        venue: Venue::Binance,
        normalized: "DOGEUSDT",
    },
];

/// Resolve a canonical symbol to its venue mapping.
pub fn resolve_venue(symbol: &str) -> Option<&'static VenueMapping> {
    VENUE_MAP.iter().find(|m| m.symbol == symbol)
}

/// Exchange precision rules for a symbol.
///
/// Unknown symbols get conservative defaults rather than an error; the
/// venue gate upstream already rejects symbols outside the mapping table.
pub fn venue_rules_for(symbol: &str) -> VenueRules {
    match symbol {
        "BTC/USDT" => VenueRules {
            price_tick: dec!(0.01),
            qty_step: dec!(0.00001),
            min_qty: dec!(0.00001),
            min_notional: dec!(10),
        },
        "ETH/USDT" => VenueRules {
            price_tick: dec!(0.01),
            qty_step: dec!(0.0001),
            min_qty: dec!(0.0001),
            min_notional: dec!(10),
        },
        "SOL/USDT" => VenueRules {
            price_tick: dec!(0.01),
            qty_step: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(5),
        },
        "XRP/USDT" => VenueRules {
            price_tick: dec!(0.0001),
            qty_step: dec!(0.1),
            min_qty: dec!(0.1),
            min_notional: dec!(5),
        },
        "DOGE/USDT" => VenueRules {
            price_tick: dec!(0.00001),
            qty_step: dec!(1),
            min_qty: dec!(1),
            min_notional: dec!(5),
        },
        _ => VenueRules::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_symbol() {
        let mapping = resolve_venue("BTC/USDT").unwrap();
        assert_eq!(mapping.venue, Venue::Coinbase);
        assert_eq!(mapping.normalized, "BTC-USDT");
    }

    #[test]
    fn test_resolve_unknown_symbol() {
        assert!(resolve_venue("SHIB/USDT").is_none());
    }

    #[test]
    fn test_rules_for_btc() {
        let rules = venue_rules_for("BTC/USDT");
        assert_eq!(rules.price_tick, dec!(0.01));
        assert_eq!(rules.qty_step, dec!(0.00001));
    }

    #[test]
    fn test_rules_default_for_unknown() {
        let rules = venue_rules_for("SHIB/USDT");
        assert_eq!(rules, VenueRules::default());
    }
}
