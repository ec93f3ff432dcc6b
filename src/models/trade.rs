use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::models::order::Side;

/// How a trade came to exist.
///
/// `ShareTrade` transfers existing shares between a buyer and a seller on the
/// same side. `ShareCreation` mints a new YES+NO pair funded by two buyers:
/// `buyer_id` is the YES-side party, `seller_id` the NO-side party, `price`
/// the YES leg and `1 - price` the NO leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "trade_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    ShareTrade,
    ShareCreation,
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeType::ShareTrade => write!(f, "share_trade"),
            TradeType::ShareCreation => write!(f, "share_creation"),
        }
    }
}

/// Settlement lifecycle of a trade. pending -> settling -> settled is
/// monotonic and advanced only by the settlement engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "settlement_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Settling,
    Settled,
    Failed,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementStatus::Pending => write!(f, "pending"),
            SettlementStatus::Settling => write!(f, "settling"),
            SettlementStatus::Settled => write!(f, "settled"),
            SettlementStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub trade_id: Uuid,
    pub market_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub side: Side,
    /// YES-leg price for share creation; execution price otherwise.
    pub price: Decimal,
    pub quantity: Decimal,
    pub buyer_order_id: Uuid,
    pub seller_order_id: Uuid,
    pub trade_type: TradeType,
    pub settlement_id: Option<Uuid>,
    pub settlement_status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Collateral owed by the buyer side: `quantity * price`.
    pub fn buyer_cost(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Collateral owed by the NO-side party of a share creation:
    /// `quantity * (1 - price)`.
    pub fn seller_creation_cost(&self) -> Decimal {
        self.quantity * (Decimal::ONE - self.price)
    }
}
