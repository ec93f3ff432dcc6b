//! Matching Engine Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use uuid::Uuid;

use crate::models::{Order, OrderAction, OrderStatus, Side, Trade};

// ============================================================================
// Price Level
// ============================================================================

/// Price level with 8 decimal precision for exact comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceLevel(i64);

impl PriceLevel {
    /// Create a PriceLevel from a Decimal price
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = price * Decimal::from(100_000_000);
        let truncated = scaled.trunc();
        let value = truncated.mantissa() / 10i128.pow(truncated.scale());
        PriceLevel(value as i64)
    }

    /// Convert back to Decimal
    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(100_000_000)
    }
}

impl Ord for PriceLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Book Entries
// ============================================================================

/// A resting order as the book tracks it. Price and creation time are
/// immutable; only `filled_quantity` changes in place.
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub order_id: Uuid,
    pub user_id: String,
    pub side: Side,
    pub action: OrderAction,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub created_at: DateTime<Utc>,
}

impl BookOrder {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_filled(&self) -> bool {
        self.remaining() <= Decimal::ZERO
    }
}

impl From<&Order> for BookOrder {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            user_id: order.user_id.clone(),
            side: order.side,
            action: order.action,
            price: order.price,
            quantity: order.quantity,
            filled_quantity: order.filled_quantity,
            created_at: order.created_at,
        }
    }
}

// ============================================================================
// Match Output
// ============================================================================

/// A maker-side mutation the caller must persist.
#[derive(Debug, Clone)]
pub struct MakerUpdate {
    pub order_id: Uuid,
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
    pub removed_from_book: bool,
}

/// Result of processing one incoming order.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub trades: Vec<Trade>,
    pub maker_updates: Vec<MakerUpdate>,
    /// True when a limit-order residual was left resting on the book.
    pub resting: bool,
}

// ============================================================================
// Snapshot
// ============================================================================

/// One aggregated price level: remaining quantity and order count, with
/// fully-filled entries excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub order_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub market_id: String,
    pub yes_bids: Vec<DepthLevel>,
    pub yes_asks: Vec<DepthLevel>,
    pub no_bids: Vec<DepthLevel>,
    pub no_asks: Vec<DepthLevel>,
    pub timestamp: i64,
}
