use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Local projection of a user's on-ledger trading account.
///
/// `account_contract_id` rotates on every ledger mutation (UTXO model); the
/// stored id is a hint, never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub user_id: String,
    pub party_id: String,
    pub account_contract_id: String,
    pub available_balance: Decimal,
    pub locked_balance: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Account {
    pub fn total_balance(&self) -> Decimal {
        self.available_balance + self.locked_balance
    }
}
