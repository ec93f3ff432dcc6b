use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Settlement batch lifecycle. `pending` batches may be (re)processed;
/// `completed` and `failed` are terminal, except that an operator may revert
/// a failed batch to `pending` via retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "batch_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Proposing,
    Accepting,
    Executing,
    Completed,
    Failed,
}

impl sqlx::postgres::PgHasArrayType for BatchStatus {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_batch_status")
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Proposing => write!(f, "proposing"),
            BatchStatus::Accepting => write!(f, "accepting"),
            BatchStatus::Executing => write!(f, "executing"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
        }
    }
}

impl BatchStatus {
    /// Statuses that mean a ledger conversation was started but not finished.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            BatchStatus::Proposing | BatchStatus::Accepting | BatchStatus::Executing
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub batch_id: Uuid,
    pub trade_ids: Vec<Uuid>,
    pub status: BatchStatus,
    pub ledger_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl SettlementBatch {
    pub fn new(trade_ids: Vec<Uuid>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            trade_ids,
            status: BatchStatus::Pending,
            ledger_tx_id: None,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Audit row emitted at each stage of the three-stage settlement protocol.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SettlementEvent {
    pub id: Uuid,
    pub contract_id: String,
    pub settlement_id: Uuid,
    pub transaction_id: Option<String>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl SettlementEvent {
    pub fn new(
        contract_id: String,
        settlement_id: Uuid,
        transaction_id: Option<String>,
        status: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contract_id,
            settlement_id,
            transaction_id,
            status: status.to_string(),
            timestamp: Utc::now(),
        }
    }
}
