//! Shared types and utilities for the folio trading core.
//!
//! This crate contains:
//! - Common types (Side, Venue, DataQuality, TickerResult, Candle)
//! - Decimal money helpers and venue quantization rules
//! - The static venue mapping table

pub mod money;
pub mod types;
pub mod venues;

pub use money::{bps_of, mid_price, quantize_price, quantize_qty, spread_bps, to_decimal, VenueRules};
pub use types::*;
pub use venues::{resolve_venue, venue_rules_for, VenueMapping, VENUE_MAP};
