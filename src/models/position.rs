use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::order::Side;

/// A user's share position on one side of a binary market.
///
/// At most one non-archived row exists per (user, market, side). An archived
/// position always has zero quantity and zero locked quantity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub position_id: Uuid,
    pub user_id: String,
    pub market_id: String,
    pub side: Side,
    pub quantity: Decimal,
    pub locked_quantity: Decimal,
    pub avg_cost_basis: Decimal,
    pub is_archived: bool,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn new(user_id: String, market_id: String, side: Side) -> Self {
        Self {
            position_id: Uuid::new_v4(),
            user_id,
            market_id,
            side,
            quantity: Decimal::ZERO,
            locked_quantity: Decimal::ZERO,
            avg_cost_basis: Decimal::ZERO,
            is_archived: false,
            last_updated: Utc::now(),
        }
    }

    pub fn free_quantity(&self) -> Decimal {
        self.quantity - self.locked_quantity
    }

    /// Weighted-average cost basis after acquiring `fill_qty` at `price`.
    pub fn blended_cost_basis(&self, fill_qty: Decimal, price: Decimal) -> Decimal {
        let total = self.quantity + fill_qty;
        if total.is_zero() {
            return Decimal::ZERO;
        }
        (self.avg_cost_basis * self.quantity + price * fill_qty) / total
    }
}
