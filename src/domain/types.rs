//! Shared value types: sides, fills, orders, order books.
//!
//! `Side`/`OrderBook`/`Order`/`OrderStatus` generalize a live multi-venue
//! order book shape down to the plain two-sided binary-market shape this
//! engine needs; `Fill`'s validation rules match a minimal dataclass-style
//! value object.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

/// An executed trade against one leg. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub ts_ms: i64,
}

impl Fill {
    /// Constructs a fill after checking the invariants a caller must not
    /// violate: non-negative quantity and a price in `[0, 1]`.
    pub fn new(side: Side, qty: f64, price: f64, ts_ms: i64) -> Result<Self, crate::error::EngineError> {
        if qty < 0.0 {
            return Err(crate::error::EngineError::Validation(format!(
                "fill quantity must be >= 0, got {qty}"
            )));
        }
        if !(0.0..=1.0).contains(&price) {
            return Err(crate::error::EngineError::Validation(format!(
                "fill price must be in [0, 1], got {price}"
            )));
        }
        Ok(Self {
            side,
            qty,
            price,
            ts_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Placed,
    Matched,
    Mined,
    Confirmed,
    Rejected,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Rejected | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: String,
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    /// Quote-denominated order size.
    pub size: f64,
    pub status: OrderStatus,
    pub idempotency_key: String,
    pub created_at: i64,
    pub placed_at: Option<i64>,
    pub matched_at: Option<i64>,
    pub filled_size: f64,
    pub avg_fill_price: Option<f64>,
    pub reject_reason: Option<String>,
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        market_id: impl Into<String>,
        side: Side,
        price: f64,
        size: f64,
        idempotency_key: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            market_id: market_id.into(),
            side,
            price,
            size,
            status: OrderStatus::Pending,
            idempotency_key: idempotency_key.into(),
            created_at,
            placed_at: None,
            matched_at: None,
            filled_size: 0.0,
            avg_fill_price: None,
            reject_reason: None,
        }
    }
}

/// One price/size level in an order book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub price: f64,
    pub size: f64,
}

/// Order book for a single token (one side of a binary market).
///
/// `bids` is price-descending, `asks` price-ascending.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl OrderBook {
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask(), self.mid()) {
            (Some(b), Some(a), Some(mid)) if mid > 0.0 => Some((a - b) / mid * 10_000.0),
            _ => None,
        }
    }

    /// Walks the ask levels until `quote_amount` is exhausted, returning
    /// the volume-weighted fill price to acquire that much of this book's
    /// token, or `f64::INFINITY` if depth is insufficient to fill the
    /// whole amount. There is no sell-side walk: nothing in this engine
    /// ever sells a token back into its own book, so a `side` parameter
    /// would have no second behavior to select.
    pub fn effective_price_for_size(&self, quote_amount: f64) -> f64 {
        if quote_amount <= 0.0 {
            return 0.0;
        }

        let mut remaining_quote = quote_amount;
        let mut shares_acquired = 0.0;

        for level in &self.asks {
            if level.price <= 0.0 {
                continue;
            }
            let level_quote_capacity = level.size * level.price;
            if level_quote_capacity >= remaining_quote {
                shares_acquired += remaining_quote / level.price;
                remaining_quote = 0.0;
                break;
            }
            shares_acquired += level.size;
            remaining_quote -= level_quote_capacity;
        }

        if remaining_quote > 0.0 || shares_acquired <= 0.0 {
            f64::INFINITY
        } else {
            quote_amount / shares_acquired
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_rejects_out_of_range_price() {
        assert!(Fill::new(Side::Yes, 10.0, 1.5, 0).is_err());
        assert!(Fill::new(Side::Yes, -1.0, 0.5, 0).is_err());
        assert!(Fill::new(Side::Yes, 10.0, 0.5, 0).is_ok());
    }

    #[test]
    fn order_book_best_levels_and_mid() {
        let mut book = OrderBook::new("tok");
        book.bids.push(Level { price: 0.45, size: 100.0 });
        book.asks.push(Level { price: 0.48, size: 100.0 });
        assert_eq!(book.best_bid(), Some(0.45));
        assert_eq!(book.best_ask(), Some(0.48));
        assert!((book.mid().unwrap() - 0.465).abs() < 1e-9);
        assert!(book.is_ready());
    }

    #[test]
    fn effective_price_walks_levels() {
        let mut book = OrderBook::new("tok");
        book.asks.push(Level { price: 0.50, size: 10.0 });
        book.asks.push(Level { price: 0.55, size: 10.0 });

        // First level alone covers 5 quote units at 0.50 -> 10 shares.
        let price = book.effective_price_for_size(5.0);
        assert!((price - 0.50).abs() < 1e-9);

        // Exhausts both levels: 10*0.5 + 10*0.55 = 10.5 quote total.
        let price_full = book.effective_price_for_size(10.5);
        assert!(price_full.is_finite());
    }

    #[test]
    fn effective_price_is_infinite_when_depth_insufficient() {
        let mut book = OrderBook::new("tok");
        book.asks.push(Level { price: 0.50, size: 1.0 });
        assert_eq!(book.effective_price_for_size(100.0), f64::INFINITY);
    }
}
