use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::models::order::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "market_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketStatus::Open => write!(f, "open"),
            MarketStatus::Closed => write!(f, "closed"),
            MarketStatus::Resolved => write!(f, "resolved"),
        }
    }
}

impl MarketStatus {
    /// Lifecycle is strictly open -> closed -> resolved.
    pub fn can_transition_to(&self, next: MarketStatus) -> bool {
        matches!(
            (self, next),
            (MarketStatus::Open, MarketStatus::Closed)
                | (MarketStatus::Closed, MarketStatus::Resolved)
        )
    }
}

/// A binary market. `no_price` is always `1 - yes_price`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Market {
    pub market_id: String,
    pub question: String,
    pub description: String,
    pub resolution_time: DateTime<Utc>,
    pub status: MarketStatus,
    pub outcome: Option<Side>,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub volume_24h: Decimal,
    pub total_volume: Decimal,
    pub open_interest: Decimal,
    pub ledger_contract_id: String,
    pub version: i64,
    pub last_updated: DateTime<Utc>,
}

impl Market {
    pub fn new(
        market_id: String,
        question: String,
        description: String,
        resolution_time: DateTime<Utc>,
        yes_price: Decimal,
        ledger_contract_id: String,
    ) -> Self {
        Self {
            market_id,
            question,
            description,
            resolution_time,
            status: MarketStatus::Open,
            outcome: None,
            yes_price,
            no_price: Decimal::ONE - yes_price,
            volume_24h: Decimal::ZERO,
            total_volume: Decimal::ZERO,
            open_interest: Decimal::ZERO,
            ledger_contract_id,
            version: 1,
            last_updated: Utc::now(),
        }
    }

    /// Set the YES price, keeping the YES/NO prices complementary.
    pub fn set_yes_price(&mut self, yes_price: Decimal) {
        self.yes_price = yes_price;
        self.no_price = Decimal::ONE - yes_price;
    }

    pub fn is_open(&self) -> bool {
        self.status == MarketStatus::Open
    }
}
