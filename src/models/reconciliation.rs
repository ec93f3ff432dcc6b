use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only audit row written by the drift reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    pub user_id: String,
    pub local_available: Decimal,
    pub local_locked: Decimal,
    pub onchain_available: Decimal,
    pub onchain_locked: Decimal,
    pub drift: Decimal,
    pub reconciled: bool,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of a compensation step that itself failed.
///
/// These rows are the input to out-of-band manual reconciliation; nothing in
/// the trading core consumes them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CompensationFailure {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: String,
    pub amount: Decimal,
    pub account_cid: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl CompensationFailure {
    pub fn new(
        order_id: Uuid,
        user_id: &str,
        amount: Decimal,
        account_cid: Option<String>,
        error: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            user_id: user_id.to_string(),
            amount,
            account_cid,
            error: error.to_string(),
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
        }
    }
}
