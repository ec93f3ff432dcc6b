//! Repository capability traits.
//!
//! One trait per repository; implementations are Postgres-backed in this
//! module's siblings and in-memory in the test support module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{
    Account, BatchStatus, CompensationFailure, Market, Order, OrderStatus, Position,
    ReconciliationRecord, SettlementBatch, SettlementEvent, SettlementStatus, Side, Trade,
};
use crate::store::StoreError;

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn get(&self, market_id: &str) -> Result<Option<Market>, StoreError>;

    async fn upsert(&self, market: &Market) -> Result<(), StoreError>;

    /// Fold a settled trade into the market's volume and open-interest stats.
    async fn record_settled_volume(
        &self,
        market_id: &str,
        quantity: Decimal,
        open_interest_delta: Decimal,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: &Order) -> Result<(), StoreError>;

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<Order>, StoreError>;

    /// Open, partial and pending orders currently held by a user.
    async fn count_active_for_user(&self, user_id: &str) -> Result<i64, StoreError>;

    async fn update_status(&self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError>;

    /// Set absolute filled quantity and status after matching.
    async fn apply_fill(
        &self,
        order_id: Uuid,
        filled_quantity: Decimal,
        status: OrderStatus,
    ) -> Result<(), StoreError>;

    async fn set_locked_amount(
        &self,
        order_id: Uuid,
        locked_amount: Decimal,
    ) -> Result<(), StoreError>;

    /// Non-terminal orders that still have pending or settling trades.
    /// Used by the orderbook rehydrator on startup.
    async fn orders_with_unsettled_trades(&self) -> Result<Vec<Order>, StoreError>;

    /// Resting orders (open or partial) for book rehydration.
    async fn resting_orders(&self) -> Result<Vec<Order>, StoreError>;
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert_all(&self, trades: &[Trade]) -> Result<(), StoreError>;

    async fn get(&self, trade_id: Uuid) -> Result<Option<Trade>, StoreError>;

    async fn fetch_all(&self, trade_ids: &[Uuid]) -> Result<Vec<Trade>, StoreError>;

    /// Pending trades not yet associated with a batch, oldest first.
    async fn find_unbatched_pending(&self, limit: i64) -> Result<Vec<Trade>, StoreError>;

    /// Bulk settlement-status update, one transaction.
    async fn update_settlement_status_bulk(
        &self,
        trade_ids: &[Uuid],
        status: SettlementStatus,
        settled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Detach trades from their batch and return them to `pending`.
    async fn reset_to_pending(&self, trade_ids: &[Uuid]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<Account>, StoreError>;

    /// Replace-or-insert the full projection row (ledger event fold).
    async fn upsert(&self, account: &Account) -> Result<(), StoreError>;

    async fn set_contract_id(&self, user_id: &str, contract_id: &str) -> Result<(), StoreError>;

    /// Apply deltas to the balance projection.
    async fn adjust_balances(
        &self,
        user_id: &str,
        available_delta: Decimal,
        locked_delta: Decimal,
    ) -> Result<(), StoreError>;

    /// Overwrite the projection with authoritative on-chain values.
    async fn overwrite_balances(
        &self,
        user_id: &str,
        available: Decimal,
        locked: Decimal,
    ) -> Result<(), StoreError>;

    async fn find_stale(&self, updated_before: DateTime<Utc>) -> Result<Vec<Account>, StoreError>;

    async fn touch(&self, user_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// The unique non-archived position for (user, market, side).
    async fn get(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
    ) -> Result<Option<Position>, StoreError>;

    /// Create-or-increase a position, blending the average cost basis.
    async fn increase(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), StoreError>;

    /// Reduce quantity and locked quantity together in one transaction,
    /// archiving the row when quantity reaches zero.
    async fn reduce(
        &self,
        position_id: Uuid,
        quantity: Decimal,
        unlock_quantity: Decimal,
    ) -> Result<(), StoreError>;

    /// Move quantity between free and locked. Positive delta locks.
    async fn adjust_locked(&self, position_id: Uuid, delta: Decimal) -> Result<(), StoreError>;

    /// Replace the projection row from a ledger event.
    async fn replace_from_ledger(&self, position: &Position) -> Result<(), StoreError>;

    /// Archive the (user, market, side) row if its quantity is zero.
    async fn archive_if_empty(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Insert the batch row, its trade associations, and move the trades to
    /// `settling` — all in one transaction.
    async fn create_batch(&self, batch: &SettlementBatch) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<SettlementBatch>, StoreError>;

    async fn update_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
    ) -> Result<(), StoreError>;

    async fn mark_batch_completed(
        &self,
        batch_id: Uuid,
        ledger_tx_id: &str,
    ) -> Result<(), StoreError>;

    async fn record_batch_failure(
        &self,
        batch_id: Uuid,
        retry_count: i32,
        last_error: &str,
        status: BatchStatus,
    ) -> Result<(), StoreError>;

    async fn find_batches_by_status(
        &self,
        statuses: &[BatchStatus],
    ) -> Result<Vec<SettlementBatch>, StoreError>;

    /// Remove a batch row and its associations (recovery of never-started
    /// batches only).
    async fn delete_batch(&self, batch_id: Uuid) -> Result<(), StoreError>;

    async fn insert_event(&self, event: &SettlementEvent) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record_reconciliation(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), StoreError>;

    async fn record_compensation_failure(
        &self,
        failure: &CompensationFailure,
    ) -> Result<(), StoreError>;
}
