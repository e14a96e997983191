//! FIFO lot book for realized P&L on partial exits.
//!
//! Fee attribution: the entry fee is capitalized into each lot and consumed
//! proportionally; the exit fee is subtracted from proceeds. For a consumed
//! quantity `q` against a lot with cost basis `c`:
//!
//! `realized = (exit_price * q - exit_fee_portion) - (c * q + entry_fee_portion)`
//!
//! with the sign flipped for short lots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use folio_common::PositionSide;

use crate::ledger::LotRow;

/// Residual quantity below which a lot counts as fully consumed.
const LOT_DUST: Decimal = dec!(0.00000001);

/// Errors from lot book operations.
#[derive(Debug, Error)]
pub enum LotError {
    #[error("Lot quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("Lot price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("Lot fee cannot be negative, got {0}")]
    InvalidFee(Decimal),

    #[error("No lots available for {0}")]
    NoLots(String),

    #[error("Insufficient lots for {symbol}: requested {requested}, available {available}")]
    Insufficient {
        symbol: String,
        requested: Decimal,
        available: Decimal,
    },
}

/// A single entry lot. Quantity is unsigned; direction lives on the position.
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub lot_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Remaining entry fee carried in this lot's basis.
    pub fee: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// Result of one FIFO consumption.
#[derive(Debug, Clone)]
pub struct ConsumeResult {
    /// Realized P&L net of both entry-fee basis and the exit fee.
    pub realized_pnl: Decimal,
    /// Entry fees released from consumed lots.
    pub entry_fees_consumed: Decimal,
    /// Exit fee passed in by the caller.
    pub exit_fee: Decimal,
    /// (lot_id, consumed quantity) pairs, FIFO order.
    pub consumed: Vec<(String, Decimal)>,
}

/// FIFO-ordered lot books per symbol.
#[derive(Debug, Default, Clone)]
pub struct LotBook {
    lots: HashMap<String, Vec<Lot>>,
    next_seq: u64,
}

impl LotBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a book from persisted rows (already FIFO-ordered).
    pub fn from_rows(rows: &[(String, Vec<LotRow>)]) -> Self {
        let mut book = Self::new();
        for (symbol, lot_rows) in rows {
            let lots = lot_rows
                .iter()
                .map(|row| Lot {
                    lot_id: row.lot_id.clone(),
                    quantity: row.quantity_remaining,
                    price: row.entry_price,
                    fee: row.entry_fee,
                    opened_at: row.opened_at,
                })
                .collect();
            book.lots.insert(symbol.clone(), lots);
            book.next_seq += lot_rows.len() as u64;
        }
        book
    }

    /// Persistable rows for one symbol, FIFO order.
    pub fn to_rows(&self, symbol: &str) -> Vec<LotRow> {
        self.lots
            .get(symbol)
            .map(|lots| {
                lots.iter()
                    .enumerate()
                    .map(|(i, lot)| LotRow {
                        lot_id: lot.lot_id.clone(),
                        symbol: symbol.to_string(),
                        seq: i as i64 + 1,
                        entry_price: lot.price,
                        entry_fee: lot.fee,
                        quantity_remaining: lot.quantity,
                        opened_at: lot.opened_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add a new lot at the back of the FIFO queue. Returns the lot id.
    pub fn add_lot(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Result<String, LotError> {
        if quantity <= Decimal::ZERO {
            return Err(LotError::InvalidQuantity(quantity));
        }
        if price <= Decimal::ZERO {
            return Err(LotError::InvalidPrice(price));
        }
        if fee < Decimal::ZERO {
            return Err(LotError::InvalidFee(fee));
        }

        self.next_seq += 1;
        let lot_id = format!("{}-{}", symbol.replace('/', "_"), self.next_seq);
        self.lots.entry(symbol.to_string()).or_default().push(Lot {
            lot_id: lot_id.clone(),
            quantity,
            price,
            fee,
            opened_at,
        });

        debug!(symbol = %symbol, lot_id = %lot_id, quantity = %quantity, price = %price, fee = %fee, "Lot added");
        Ok(lot_id)
    }

    /// Consume lots FIFO and compute realized P&L.
    ///
    /// `side` orients the P&L: long lots realize `exit - entry`, short lots
    /// `entry - exit`. Entry fees come out of consumed lots proportionally;
    /// the exit fee is deducted once from the total.
    pub fn consume(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        fill_price: Decimal,
        exit_fee: Decimal,
        side: PositionSide,
    ) -> Result<ConsumeResult, LotError> {
        if quantity <= Decimal::ZERO {
            return Err(LotError::InvalidQuantity(quantity));
        }
        let lots = self
            .lots
            .get_mut(symbol)
            .filter(|lots| !lots.is_empty())
            .ok_or_else(|| LotError::NoLots(symbol.to_string()))?;

        let available: Decimal = lots.iter().map(|lot| lot.quantity).sum();
        if quantity > available + LOT_DUST {
            return Err(LotError::Insufficient {
                symbol: symbol.to_string(),
                requested: quantity,
                available,
            });
        }

        let mut remaining = quantity;
        let mut gross = Decimal::ZERO;
        let mut entry_fees_consumed = Decimal::ZERO;
        let mut consumed = Vec::new();

        for lot in lots.iter_mut() {
            if remaining <= LOT_DUST {
                break;
            }
            let take = remaining.min(lot.quantity);
            let fee_portion = if lot.quantity > Decimal::ZERO {
                lot.fee * take / lot.quantity
            } else {
                Decimal::ZERO
            };

            let lot_gross = match side {
                PositionSide::Long => (fill_price - lot.price) * take,
                PositionSide::Short => (lot.price - fill_price) * take,
            };
            gross += lot_gross - fee_portion;
            entry_fees_consumed += fee_portion;

            lot.quantity -= take;
            lot.fee -= fee_portion;
            remaining -= take;
            consumed.push((lot.lot_id.clone(), take));
        }

        lots.retain(|lot| lot.quantity > LOT_DUST);
        if lots.is_empty() {
            self.lots.remove(symbol);
        }

        let realized_pnl = gross - exit_fee;
        debug!(
            symbol = %symbol,
            quantity = %quantity,
            fill_price = %fill_price,
            realized_pnl = %realized_pnl,
            "Lots consumed"
        );

        Ok(ConsumeResult {
            realized_pnl,
            entry_fees_consumed,
            exit_fee,
            consumed,
        })
    }

    /// Total remaining quantity for a symbol.
    pub fn available_qty(&self, symbol: &str) -> Decimal {
        self.lots
            .get(symbol)
            .map(|lots| lots.iter().map(|lot| lot.quantity).sum())
            .unwrap_or(Decimal::ZERO)
    }

    /// Lots for a symbol, FIFO order.
    pub fn lots(&self, symbol: &str) -> &[Lot] {
        self.lots.get(symbol).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Symbols with at least one open lot.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.lots.keys().map(|s| s.as_str())
    }

    /// Total cost basis (price * qty + remaining fee) for a symbol.
    pub fn cost_basis(&self, symbol: &str) -> Decimal {
        self.lots
            .get(symbol)
            .map(|lots| {
                lots.iter()
                    .map(|lot| lot.price * lot.quantity + lot.fee)
                    .sum()
            })
            .unwrap_or(Decimal::ZERO)
    }

    /// Quantity-weighted average entry price for a symbol.
    pub fn weighted_avg_price(&self, symbol: &str) -> Decimal {
        let lots = match self.lots.get(symbol) {
            Some(lots) if !lots.is_empty() => lots,
            _ => return Decimal::ZERO,
        };
        let qty: Decimal = lots.iter().map(|lot| lot.quantity).sum();
        if qty <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        lots.iter().map(|lot| lot.price * lot.quantity).sum::<Decimal>() / qty
    }

    /// Drop all lots for a symbol. Returns how many were cleared.
    pub fn clear_symbol(&mut self, symbol: &str) -> usize {
        self.lots.remove(symbol).map(|lots| lots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with_lot(qty: Decimal, price: Decimal, fee: Decimal) -> LotBook {
        let mut book = LotBook::new();
        book.add_lot("BTC/USDT", qty, price, fee, Utc::now()).unwrap();
        book
    }

    #[test]
    fn test_add_lot_validation() {
        let mut book = LotBook::new();
        assert!(matches!(
            book.add_lot("BTC/USDT", Decimal::ZERO, dec!(100), Decimal::ZERO, Utc::now()),
            Err(LotError::InvalidQuantity(_))
        ));
        assert!(matches!(
            book.add_lot("BTC/USDT", dec!(1), Decimal::ZERO, Decimal::ZERO, Utc::now()),
            Err(LotError::InvalidPrice(_))
        ));
        assert!(matches!(
            book.add_lot("BTC/USDT", dec!(1), dec!(100), dec!(-1), Utc::now()),
            Err(LotError::InvalidFee(_))
        ));
    }

    #[test]
    fn test_round_trip_realized_pnl() {
        // Buy 1 @ 100 with fee 0.30, sell 1 @ 110 with fee 0.33.
        // realized = (110 - 100) * 1 - 0.30 - 0.33 = 9.37
        let mut book = book_with_lot(dec!(1), dec!(100), dec!(0.30));
        let result = book
            .consume("BTC/USDT", dec!(1), dec!(110), dec!(0.33), PositionSide::Long)
            .unwrap();
        assert_eq!(result.realized_pnl, dec!(9.37));
        assert_eq!(result.entry_fees_consumed, dec!(0.30));
        assert!(book.is_empty());
    }

    #[test]
    fn test_short_round_trip_flips_sign() {
        // Short entry 1 @ 100 (fee 0.30), buy back @ 90 (fee 0.27).
        // realized = (100 - 90) * 1 - 0.30 - 0.27 = 9.43
        let mut book = book_with_lot(dec!(1), dec!(100), dec!(0.30));
        let result = book
            .consume("BTC/USDT", dec!(1), dec!(90), dec!(0.27), PositionSide::Short)
            .unwrap();
        assert_eq!(result.realized_pnl, dec!(9.43));
    }

    #[test]
    fn test_partial_consume_proportional_fees() {
        // Lot of 2 with fee 1.00; consume half -> fee portion 0.50.
        let mut book = book_with_lot(dec!(2), dec!(100), dec!(1.00));
        let result = book
            .consume("BTC/USDT", dec!(1), dec!(105), Decimal::ZERO, PositionSide::Long)
            .unwrap();
        // (105 - 100) * 1 - 0.50 = 4.50
        assert_eq!(result.realized_pnl, dec!(4.50));
        assert_eq!(book.available_qty("BTC/USDT"), dec!(1));
        assert_eq!(book.lots("BTC/USDT")[0].fee, dec!(0.50));
    }

    #[test]
    fn test_fifo_order() {
        let mut book = LotBook::new();
        book.add_lot("BTC/USDT", dec!(1), dec!(100), Decimal::ZERO, Utc::now())
            .unwrap();
        book.add_lot("BTC/USDT", dec!(1), dec!(200), Decimal::ZERO, Utc::now())
            .unwrap();

        // Consuming 1.5 takes all of lot 1 and half of lot 2.
        let result = book
            .consume("BTC/USDT", dec!(1.5), dec!(200), Decimal::ZERO, PositionSide::Long)
            .unwrap();
        // (200-100)*1 + (200-200)*0.5 = 100
        assert_eq!(result.realized_pnl, dec!(100));
        assert_eq!(result.consumed.len(), 2);
        assert_eq!(book.available_qty("BTC/USDT"), dec!(0.5));
        assert_eq!(book.lots("BTC/USDT")[0].price, dec!(200));
    }

    #[test]
    fn test_insufficient_lots() {
        let mut book = book_with_lot(dec!(1), dec!(100), Decimal::ZERO);
        let err = book
            .consume("BTC/USDT", dec!(2), dec!(100), Decimal::ZERO, PositionSide::Long)
            .unwrap_err();
        assert!(matches!(err, LotError::Insufficient { .. }));
    }

    #[test]
    fn test_consume_missing_symbol() {
        let mut book = LotBook::new();
        assert!(matches!(
            book.consume("BTC/USDT", dec!(1), dec!(100), Decimal::ZERO, PositionSide::Long),
            Err(LotError::NoLots(_))
        ));
    }

    #[test]
    fn test_weighted_avg_and_basis() {
        let mut book = LotBook::new();
        book.add_lot("BTC/USDT", dec!(1), dec!(100), dec!(0.5), Utc::now())
            .unwrap();
        book.add_lot("BTC/USDT", dec!(3), dec!(120), dec!(1.5), Utc::now())
            .unwrap();

        // (100*1 + 120*3) / 4 = 115
        assert_eq!(book.weighted_avg_price("BTC/USDT"), dec!(115));
        // 100 + 360 + 2.0 fees = 462
        assert_eq!(book.cost_basis("BTC/USDT"), dec!(462));
    }

    #[test]
    fn test_rows_round_trip() {
        let mut book = LotBook::new();
        book.add_lot("BTC/USDT", dec!(1), dec!(100), dec!(0.5), Utc::now())
            .unwrap();
        book.add_lot("BTC/USDT", dec!(2), dec!(110), dec!(0.7), Utc::now())
            .unwrap();

        let rows = vec![("BTC/USDT".to_string(), book.to_rows("BTC/USDT"))];
        let rebuilt = LotBook::from_rows(&rows);
        assert_eq!(rebuilt.available_qty("BTC/USDT"), dec!(3));
        assert_eq!(rebuilt.weighted_avg_price("BTC/USDT"), book.weighted_avg_price("BTC/USDT"));
    }
}
