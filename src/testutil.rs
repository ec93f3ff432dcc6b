//! Test support: in-memory repositories and a scripted ledger façade.
//!
//! The doubles implement the same capability traits the Postgres and HTTP
//! implementations do, so the saga, settlement engine and reconciler run
//! unchanged against them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::ledger::{
    ActiveContract, LedgerClient, LedgerError, SubmitCommandRequest, SubmitCommandResponse,
};
use crate::models::{
    Account, BatchStatus, CompensationFailure, Market, Order, OrderStatus, Position,
    ReconciliationRecord, SettlementBatch, SettlementEvent, SettlementStatus, Side, Trade,
};
use crate::store::{
    AccountStore, AuditStore, MarketStore, OrderStore, PositionStore, Repositories,
    SettlementStore, StoreError, TradeStore,
};

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    markets: Mutex<HashMap<String, Market>>,
    orders: Mutex<HashMap<Uuid, Order>>,
    trades: Mutex<HashMap<Uuid, Trade>>,
    accounts: Mutex<HashMap<String, Account>>,
    positions: Mutex<Vec<Position>>,
    batches: Mutex<HashMap<Uuid, SettlementBatch>>,
    events: Mutex<Vec<SettlementEvent>>,
    reconciliations: Mutex<Vec<ReconciliationRecord>>,
    compensation_failures: Mutex<Vec<CompensationFailure>>,
}

impl MemoryStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            markets: self.clone(),
            orders: self.clone(),
            trades: self.clone(),
            accounts: self.clone(),
            positions: self.clone(),
            settlements: self.clone(),
            audit: self.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn seed_market(&self, market: Market) {
        self.markets.lock().insert(market.market_id.clone(), market);
    }

    pub fn seed_account(&self, account: Account) {
        self.accounts.lock().insert(account.user_id.clone(), account);
    }

    pub fn seed_position(&self, position: Position) {
        self.positions.lock().push(position);
    }

    pub fn seed_trade(&self, trade: Trade) {
        self.trades.lock().insert(trade.trade_id, trade);
    }

    pub fn seed_batch(&self, batch: SettlementBatch) {
        self.batches.lock().insert(batch.batch_id, batch);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn account(&self, user_id: &str) -> Option<Account> {
        self.accounts.lock().get(user_id).cloned()
    }

    pub fn position(&self, user_id: &str, market_id: &str, side: Side) -> Option<Position> {
        self.positions
            .lock()
            .iter()
            .find(|p| {
                p.user_id == user_id && p.market_id == market_id && p.side == side && !p.is_archived
            })
            .cloned()
    }

    pub fn archived_position(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
    ) -> Option<Position> {
        self.positions
            .lock()
            .iter()
            .find(|p| {
                p.user_id == user_id && p.market_id == market_id && p.side == side && p.is_archived
            })
            .cloned()
    }

    pub fn order(&self, order_id: Uuid) -> Option<Order> {
        self.orders.lock().get(&order_id).cloned()
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn trade(&self, trade_id: Uuid) -> Option<Trade> {
        self.trades.lock().get(&trade_id).cloned()
    }

    pub fn all_trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.trades.lock().values().cloned().collect();
        trades.sort_by_key(|t| t.created_at);
        trades
    }

    pub fn batch(&self, batch_id: Uuid) -> Option<SettlementBatch> {
        self.batches.lock().get(&batch_id).cloned()
    }

    pub fn all_batches(&self) -> Vec<SettlementBatch> {
        self.batches.lock().values().cloned().collect()
    }

    pub fn settlement_events(&self) -> Vec<SettlementEvent> {
        self.events.lock().clone()
    }

    pub fn reconciliations(&self) -> Vec<ReconciliationRecord> {
        self.reconciliations.lock().clone()
    }

    pub fn compensation_failures(&self) -> Vec<CompensationFailure> {
        self.compensation_failures.lock().clone()
    }

    pub fn market(&self, market_id: &str) -> Option<Market> {
        self.markets.lock().get(market_id).cloned()
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn get(&self, market_id: &str) -> Result<Option<Market>, StoreError> {
        Ok(self.markets.lock().get(market_id).cloned())
    }

    async fn upsert(&self, market: &Market) -> Result<(), StoreError> {
        self.markets
            .lock()
            .insert(market.market_id.clone(), market.clone());
        Ok(())
    }

    async fn record_settled_volume(
        &self,
        market_id: &str,
        quantity: Decimal,
        open_interest_delta: Decimal,
    ) -> Result<(), StoreError> {
        if let Some(market) = self.markets.lock().get_mut(market_id) {
            market.volume_24h += quantity;
            market.total_volume += quantity;
            market.open_interest += open_interest_delta;
            market.version += 1;
            market.last_updated = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        self.orders.lock().insert(order.order_id, order.clone());
        Ok(())
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.lock().get(&order_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<Order>, StoreError> {
        Ok(self
            .orders
            .lock()
            .values()
            .find(|o| o.user_id == user_id && o.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn count_active_for_user(&self, user_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .orders
            .lock()
            .values()
            .filter(|o| {
                o.user_id == user_id
                    && matches!(
                        o.status,
                        OrderStatus::Pending | OrderStatus::Open | OrderStatus::Partial
                    )
            })
            .count() as i64)
    }

    async fn update_status(&self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError> {
        if let Some(order) = self.orders.lock().get_mut(&order_id) {
            order.status = status;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn apply_fill(
        &self,
        order_id: Uuid,
        filled_quantity: Decimal,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        if let Some(order) = self.orders.lock().get_mut(&order_id) {
            order.filled_quantity = filled_quantity;
            order.status = status;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_locked_amount(
        &self,
        order_id: Uuid,
        locked_amount: Decimal,
    ) -> Result<(), StoreError> {
        if let Some(order) = self.orders.lock().get_mut(&order_id) {
            order.locked_amount = locked_amount;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn orders_with_unsettled_trades(&self) -> Result<Vec<Order>, StoreError> {
        let trades = self.trades.lock();
        let unsettled: Vec<Uuid> = trades
            .values()
            .filter(|t| {
                matches!(
                    t.settlement_status,
                    SettlementStatus::Pending | SettlementStatus::Settling
                )
            })
            .flat_map(|t| [t.buyer_order_id, t.seller_order_id])
            .collect();

        Ok(self
            .orders
            .lock()
            .values()
            .filter(|o| unsettled.contains(&o.order_id))
            .cloned()
            .collect())
    }

    async fn resting_orders(&self) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .lock()
            .values()
            .filter(|o| matches!(o.status, OrderStatus::Open | OrderStatus::Partial))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn insert_all(&self, trades: &[Trade]) -> Result<(), StoreError> {
        let mut map = self.trades.lock();
        for trade in trades {
            map.entry(trade.trade_id).or_insert_with(|| trade.clone());
        }
        Ok(())
    }

    async fn get(&self, trade_id: Uuid) -> Result<Option<Trade>, StoreError> {
        Ok(self.trades.lock().get(&trade_id).cloned())
    }

    async fn fetch_all(&self, trade_ids: &[Uuid]) -> Result<Vec<Trade>, StoreError> {
        let map = self.trades.lock();
        let mut trades: Vec<Trade> = trade_ids
            .iter()
            .filter_map(|id| map.get(id).cloned())
            .collect();
        trades.sort_by_key(|t| t.created_at);
        Ok(trades)
    }

    async fn find_unbatched_pending(&self, limit: i64) -> Result<Vec<Trade>, StoreError> {
        let mut trades: Vec<Trade> = self
            .trades
            .lock()
            .values()
            .filter(|t| {
                t.settlement_status == SettlementStatus::Pending && t.settlement_id.is_none()
            })
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.created_at);
        trades.truncate(limit as usize);
        Ok(trades)
    }

    async fn update_settlement_status_bulk(
        &self,
        trade_ids: &[Uuid],
        status: SettlementStatus,
        settled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut map = self.trades.lock();
        for id in trade_ids {
            if let Some(trade) = map.get_mut(id) {
                trade.settlement_status = status;
                if settled_at.is_some() {
                    trade.settled_at = settled_at;
                }
            }
        }
        Ok(())
    }

    async fn reset_to_pending(&self, trade_ids: &[Uuid]) -> Result<(), StoreError> {
        let mut map = self.trades.lock();
        for id in trade_ids {
            if let Some(trade) = map.get_mut(id) {
                trade.settlement_status = SettlementStatus::Pending;
                trade.settlement_id = None;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.lock().get(user_id).cloned())
    }

    async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
        self.accounts
            .lock()
            .insert(account.user_id.clone(), account.clone());
        Ok(())
    }

    async fn set_contract_id(&self, user_id: &str, contract_id: &str) -> Result<(), StoreError> {
        if let Some(account) = self.accounts.lock().get_mut(user_id) {
            account.account_contract_id = contract_id.to_string();
            account.last_updated = Utc::now();
        }
        Ok(())
    }

    async fn adjust_balances(
        &self,
        user_id: &str,
        available_delta: Decimal,
        locked_delta: Decimal,
    ) -> Result<(), StoreError> {
        if let Some(account) = self.accounts.lock().get_mut(user_id) {
            account.available_balance += available_delta;
            account.locked_balance += locked_delta;
            account.last_updated = Utc::now();
        }
        Ok(())
    }

    async fn overwrite_balances(
        &self,
        user_id: &str,
        available: Decimal,
        locked: Decimal,
    ) -> Result<(), StoreError> {
        if let Some(account) = self.accounts.lock().get_mut(user_id) {
            account.available_balance = available;
            account.locked_balance = locked;
            account.last_updated = Utc::now();
        }
        Ok(())
    }

    async fn find_stale(&self, updated_before: DateTime<Utc>) -> Result<Vec<Account>, StoreError> {
        let mut accounts: Vec<Account> = self
            .accounts
            .lock()
            .values()
            .filter(|a| a.last_updated < updated_before)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.last_updated);
        Ok(accounts)
    }

    async fn touch(&self, user_id: &str) -> Result<(), StoreError> {
        if let Some(account) = self.accounts.lock().get_mut(user_id) {
            account.last_updated = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn get(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
    ) -> Result<Option<Position>, StoreError> {
        Ok(self.position(user_id, market_id, side))
    }

    async fn increase(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), StoreError> {
        let mut positions = self.positions.lock();
        if let Some(position) = positions.iter_mut().find(|p| {
            p.user_id == user_id && p.market_id == market_id && p.side == side && !p.is_archived
        }) {
            position.avg_cost_basis = position.blended_cost_basis(quantity, price);
            position.quantity += quantity;
            position.last_updated = Utc::now();
        } else {
            let mut position = Position::new(user_id.to_string(), market_id.to_string(), side);
            position.quantity = quantity;
            position.avg_cost_basis = price;
            positions.push(position);
        }
        Ok(())
    }

    async fn reduce(
        &self,
        position_id: Uuid,
        quantity: Decimal,
        unlock_quantity: Decimal,
    ) -> Result<(), StoreError> {
        let mut positions = self.positions.lock();
        if let Some(position) = positions.iter_mut().find(|p| p.position_id == position_id) {
            position.quantity -= quantity;
            position.locked_quantity -= unlock_quantity;
            if position.quantity.is_zero() && position.locked_quantity.is_zero() {
                position.is_archived = true;
            }
            position.last_updated = Utc::now();
        }
        Ok(())
    }

    async fn adjust_locked(&self, position_id: Uuid, delta: Decimal) -> Result<(), StoreError> {
        let mut positions = self.positions.lock();
        if let Some(position) = positions.iter_mut().find(|p| p.position_id == position_id) {
            position.locked_quantity += delta;
            position.last_updated = Utc::now();
        }
        Ok(())
    }

    async fn replace_from_ledger(&self, position: &Position) -> Result<(), StoreError> {
        let mut positions = self.positions.lock();
        if let Some(existing) = positions.iter_mut().find(|p| {
            p.user_id == position.user_id
                && p.market_id == position.market_id
                && p.side == position.side
                && !p.is_archived
        }) {
            existing.quantity = position.quantity;
            existing.locked_quantity = position.locked_quantity;
            existing.last_updated = Utc::now();
        } else {
            positions.push(position.clone());
        }
        Ok(())
    }

    async fn archive_if_empty(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
    ) -> Result<(), StoreError> {
        let mut positions = self.positions.lock();
        if let Some(position) = positions.iter_mut().find(|p| {
            p.user_id == user_id && p.market_id == market_id && p.side == side && !p.is_archived
        }) {
            if position.quantity.is_zero() && position.locked_quantity.is_zero() {
                position.is_archived = true;
                position.last_updated = Utc::now();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn create_batch(&self, batch: &SettlementBatch) -> Result<(), StoreError> {
        self.batches.lock().insert(batch.batch_id, batch.clone());
        let mut trades = self.trades.lock();
        for trade_id in &batch.trade_ids {
            if let Some(trade) = trades.get_mut(trade_id) {
                trade.settlement_status = SettlementStatus::Settling;
                trade.settlement_id = Some(batch.batch_id);
            }
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<SettlementBatch>, StoreError> {
        Ok(self.batches.lock().get(&batch_id).cloned())
    }

    async fn update_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        if let Some(batch) = self.batches.lock().get_mut(&batch_id) {
            batch.status = status;
        }
        Ok(())
    }

    async fn mark_batch_completed(
        &self,
        batch_id: Uuid,
        ledger_tx_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(batch) = self.batches.lock().get_mut(&batch_id) {
            batch.status = BatchStatus::Completed;
            batch.ledger_tx_id = Some(ledger_tx_id.to_string());
            batch.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_batch_failure(
        &self,
        batch_id: Uuid,
        retry_count: i32,
        last_error: &str,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        if let Some(batch) = self.batches.lock().get_mut(&batch_id) {
            batch.retry_count = retry_count;
            batch.last_error = Some(last_error.to_string());
            batch.status = status;
            if status == BatchStatus::Failed {
                batch.processed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn find_batches_by_status(
        &self,
        statuses: &[BatchStatus],
    ) -> Result<Vec<SettlementBatch>, StoreError> {
        let mut batches: Vec<SettlementBatch> = self
            .batches
            .lock()
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    async fn delete_batch(&self, batch_id: Uuid) -> Result<(), StoreError> {
        self.batches.lock().remove(&batch_id);
        Ok(())
    }

    async fn insert_event(&self, event: &SettlementEvent) -> Result<(), StoreError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn record_reconciliation(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), StoreError> {
        self.reconciliations.lock().push(record.clone());
        Ok(())
    }

    async fn record_compensation_failure(
        &self,
        failure: &CompensationFailure,
    ) -> Result<(), StoreError> {
        self.compensation_failures.lock().push(failure.clone());
        Ok(())
    }
}

// ============================================================================
// Scripted ledger
// ============================================================================

/// Ledger double. Submissions succeed with synthetic ids unless a failure
/// has been scripted for a matching command id; queries serve whatever
/// contracts the test registered.
pub struct ScriptedLedger {
    submissions: Mutex<Vec<SubmitCommandRequest>>,
    active: Mutex<HashMap<(String, String), Vec<ActiveContract>>>,
    contracts: Mutex<HashMap<String, ActiveContract>>,
    fail_markers: Mutex<Vec<String>>,
    fail_contract_queries: Mutex<bool>,
    counter: AtomicU64,
}

impl ScriptedLedger {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            submissions: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            contracts: Mutex::new(HashMap::new()),
            fail_markers: Mutex::new(Vec::new()),
            fail_contract_queries: Mutex::new(false),
            counter: AtomicU64::new(0),
        })
    }

    /// Fail the next submission whose command id contains `marker`.
    pub fn fail_next_matching(&self, marker: &str) {
        self.fail_markers.lock().push(marker.to_string());
    }

    pub fn fail_contract_queries(&self, fail: bool) {
        *self.fail_contract_queries.lock() = fail;
    }

    pub fn submissions(&self) -> Vec<SubmitCommandRequest> {
        self.submissions.lock().clone()
    }

    pub fn submissions_matching(&self, marker: &str) -> Vec<SubmitCommandRequest> {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.command_id.contains(marker))
            .cloned()
            .collect()
    }

    pub fn register_account_contract(
        &self,
        party: &str,
        cid: &str,
        available: Decimal,
        locked: Decimal,
    ) {
        let contract = ActiveContract {
            contract_id: cid.to_string(),
            payload: json!({
                "owner": party,
                "availableBalance": available.to_string(),
                "lockedBalance": locked.to_string(),
            }),
        };
        self.active
            .lock()
            .insert(("TradingAccount".to_string(), party.to_string()), vec![contract]);
    }

    pub fn register_position_contract(
        &self,
        party: &str,
        cid: &str,
        market_id: &str,
        side: Side,
        quantity: Decimal,
        locked: Decimal,
    ) {
        let contract = ActiveContract {
            contract_id: cid.to_string(),
            payload: json!({
                "owner": party,
                "marketId": market_id,
                "side": side.wire(),
                "quantity": quantity.to_string(),
                "lockedQuantity": locked.to_string(),
            }),
        };
        self.active
            .lock()
            .entry(("Position".to_string(), party.to_string()))
            .or_default()
            .push(contract);
    }

    pub fn register_market_contract(&self, cid: &str, market_id: &str, status: &str) {
        self.contracts.lock().insert(
            cid.to_string(),
            ActiveContract {
                contract_id: cid.to_string(),
                payload: json!({ "marketId": market_id, "status": status }),
            },
        );
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn submit_command(
        &self,
        request: SubmitCommandRequest,
    ) -> Result<SubmitCommandResponse, LedgerError> {
        {
            let mut markers = self.fail_markers.lock();
            if let Some(index) = markers
                .iter()
                .position(|m| request.command_id.contains(m.as_str()))
            {
                let marker = markers.remove(index);
                return Err(LedgerError::Rejected(format!(
                    "scripted failure for {marker}"
                )));
            }
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.submissions.lock().push(request);

        Ok(SubmitCommandResponse {
            transaction_id: format!("tx-{n}"),
            new_contract_id: Some(format!("cid-{n}")),
        })
    }

    async fn get_active_contracts(
        &self,
        template_id: &str,
        party: &str,
    ) -> Result<Vec<ActiveContract>, LedgerError> {
        if *self.fail_contract_queries.lock() {
            return Err(LedgerError::Transport("scripted query failure".to_string()));
        }

        Ok(self
            .active
            .lock()
            .get(&(template_id.to_string(), party.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_contract(
        &self,
        contract_id: &str,
        _party: &str,
    ) -> Result<Option<ActiveContract>, LedgerError> {
        if *self.fail_contract_queries.lock() {
            return Err(LedgerError::Transport("scripted query failure".to_string()));
        }

        Ok(self.contracts.lock().get(contract_id).cloned())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn open_market(market_id: &str) -> Market {
    Market::new(
        market_id.to_string(),
        format!("Question for {market_id}"),
        String::new(),
        Utc::now() + chrono::Duration::days(30),
        Decimal::new(50, 2),
        format!("cid-market-{market_id}"),
    )
}

pub fn funded_account(user_id: &str, available: Decimal) -> Account {
    Account {
        user_id: user_id.to_string(),
        party_id: format!("{user_id}::party"),
        account_contract_id: format!("cid-account-{user_id}"),
        available_balance: available,
        locked_balance: Decimal::ZERO,
        last_updated: Utc::now(),
    }
}

pub fn held_position(user_id: &str, market_id: &str, side: Side, quantity: Decimal) -> Position {
    let mut position = Position::new(user_id.to_string(), market_id.to_string(), side);
    position.quantity = quantity;
    position.avg_cost_basis = Decimal::new(50, 2);
    position
}

pub fn pending_trade(
    market_id: &str,
    buyer: &str,
    seller: &str,
    price: Decimal,
    quantity: Decimal,
    trade_type: crate::models::TradeType,
) -> Trade {
    Trade {
        trade_id: Uuid::new_v4(),
        market_id: market_id.to_string(),
        buyer_id: buyer.to_string(),
        seller_id: seller.to_string(),
        side: Side::Yes,
        price,
        quantity,
        buyer_order_id: Uuid::new_v4(),
        seller_order_id: Uuid::new_v4(),
        trade_type,
        settlement_id: None,
        settlement_status: SettlementStatus::Pending,
        created_at: Utc::now(),
        settled_at: None,
    }
}
