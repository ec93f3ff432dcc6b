//! Order Service
//!
//! Runs each order placement as a compensating saga: validate against the
//! store, lock funds or position on the ledger, persist the order, hand it
//! to the matching engine, persist the resulting trades, then release any
//! over-locked remainder. A failure after the ledger lock unwinds with the
//! rotated contract id; compensation steps that themselves fail are recorded
//! as compensation-failure rows and never crash the saga.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrderServiceConfig;
use crate::ledger::commands::{
    self, PositionPayload, TEMPLATE_POSITION, TEMPLATE_TRADING_ACCOUNT,
};
use crate::ledger::{LedgerClient, LedgerError, SubmitCommandRequest};
use crate::models::{
    Account, CompensationFailure, Market, Order, OrderAction, OrderStatus, OrderType,
    PlaceOrderRequest, Position, Side,
};
use crate::services::matching::{MatchResult, MatchingEngine};
use crate::store::{Repositories, StoreError};

/// Tolerance below which a market-buy over-lock is not worth refunding.
const REFUND_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Worst-case price cap used to lock funds for market buys. Can exceed the
/// eventual cost; the excess is refunded after matching.
const MARKET_BUY_PRICE_CAP: Decimal = Decimal::from_parts(99, 0, 0, false, 2);

const MIN_LIMIT_PRICE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);
const MAX_LIMIT_PRICE: Decimal = Decimal::from_parts(99, 0, 0, false, 2);

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("limit price {0} outside [0.01, 0.99]")]
    InvalidPrice(Decimal),

    #[error("quantity {0} outside allowed range")]
    InvalidQuantity(Decimal),

    #[error("market not found: {0}")]
    MarketNotFound(String),

    #[error("market not open: {0}")]
    MarketNotOpen(String),

    #[error("market not open on ledger: {0}")]
    MarketNotOpenOnchain(String),

    #[error("could not verify market on ledger: {0}")]
    MarketVerificationFailed(String),

    #[error("account not found for user {0}")]
    AccountNotFound(String),

    #[error("user has {0} pending orders, limit reached")]
    MaxPendingOrders(i64),

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("no {side} position in market {market_id}")]
    NoPosition { market_id: String, side: Side },

    #[error("insufficient position: required {required}, free {free}")]
    InsufficientPosition { required: Decimal, free: Decimal },

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("order belongs to another user")]
    Unauthorized,

    #[error("order status {0} does not permit cancellation")]
    InvalidStatus(OrderStatus),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrderError {
    /// Stable error code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            OrderError::InvalidPrice(_) => "INVALID_PRICE",
            OrderError::InvalidQuantity(_) => "INVALID_QUANTITY",
            OrderError::MarketNotFound(_) => "MARKET_NOT_FOUND",
            OrderError::MarketNotOpen(_) => "MARKET_NOT_OPEN",
            OrderError::MarketNotOpenOnchain(_) => "MARKET_NOT_OPEN_ONCHAIN",
            OrderError::MarketVerificationFailed(_) => "MARKET_VERIFICATION_FAILED",
            OrderError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            OrderError::MaxPendingOrders(_) => "MAX_PENDING_ORDERS",
            OrderError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            OrderError::NoPosition { .. } => "NO_POSITION",
            OrderError::InsufficientPosition { .. } => "INSUFFICIENT_POSITION",
            OrderError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            OrderError::Unauthorized => "UNAUTHORIZED",
            OrderError::InvalidStatus(_) => "INVALID_STATUS",
            OrderError::Ledger(_) => "LEDGER_ERROR",
            OrderError::Store(_) => "STORE_ERROR",
        }
    }
}

/// What the saga locked on the ledger, so later steps can unwind it.
enum LedgerLock {
    Funds {
        amount: Decimal,
        account_cid: String,
    },
    Position {
        position_id: Uuid,
        position_cid: String,
        quantity: Decimal,
    },
}

pub struct OrderService {
    config: OrderServiceConfig,
    repos: Repositories,
    ledger: Arc<dyn LedgerClient>,
    engine: Arc<MatchingEngine>,
}

impl OrderService {
    pub fn new(
        config: OrderServiceConfig,
        repos: Repositories,
        ledger: Arc<dyn LedgerClient>,
        engine: Arc<MatchingEngine>,
    ) -> Self {
        Self {
            config,
            repos,
            ledger,
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    /// Place one order through the full saga. Validation errors leave no
    /// trace; failures after the ledger lock are compensated.
    pub async fn place_order(
        &self,
        user_id: &str,
        request: PlaceOrderRequest,
        idempotency_key: Option<String>,
    ) -> Result<Order, OrderError> {
        // Step 1: idempotency replay.
        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.repos.orders.find_by_idempotency_key(user_id, key).await? {
                info!(order_id = %existing.order_id, %user_id, "Idempotent replay of placeOrder");
                return Ok(existing);
            }
        }

        // Step 2: validation. Nothing is persisted if any check fails.
        let (market, account, position, required_funds) =
            self.validate(user_id, &request).await?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let price = match request.order_type {
            OrderType::Limit => request.price.unwrap_or_default(),
            OrderType::Market => Decimal::ZERO,
        };

        // Step 3: lock on the ledger. The exercised contract rotates, so the
        // fresh id returned here is what compensation must use.
        let (lock, lock_tx_id, locked_amount) = match request.action {
            OrderAction::Buy => {
                let account_cid = self.refresh_account_cid(&account).await?;
                let response = self
                    .ledger
                    .submit_command(SubmitCommandRequest {
                        user_id: user_id.to_string(),
                        command_id: format!("lock-funds-{order_id}"),
                        act_as: vec![account.party_id.clone()],
                        read_as: vec![self.config.pebble_admin_party.clone()],
                        commands: vec![commands::lock_funds(&account_cid, required_funds, order_id)],
                    })
                    .await?;

                let rotated_cid = response.new_contract_id.unwrap_or(account_cid);
                self.repos
                    .accounts
                    .set_contract_id(user_id, &rotated_cid)
                    .await?;
                self.repos
                    .accounts
                    .adjust_balances(user_id, -required_funds, required_funds)
                    .await?;

                (
                    LedgerLock::Funds {
                        amount: required_funds,
                        account_cid: rotated_cid,
                    },
                    response.transaction_id,
                    required_funds,
                )
            }
            OrderAction::Sell => {
                let position = position.as_ref().ok_or_else(|| OrderError::NoPosition {
                    market_id: request.market_id.clone(),
                    side: request.side,
                })?;
                let position_cid = self
                    .resolve_position_cid(&account.party_id, &request.market_id, request.side)
                    .await?;
                let response = self
                    .ledger
                    .submit_command(SubmitCommandRequest {
                        user_id: user_id.to_string(),
                        command_id: format!("lock-position-{order_id}"),
                        act_as: vec![account.party_id.clone()],
                        read_as: vec![self.config.pebble_admin_party.clone()],
                        commands: vec![commands::lock_position(
                            &position_cid,
                            request.quantity,
                            order_id,
                        )],
                    })
                    .await?;

                let rotated_cid = response.new_contract_id.unwrap_or(position_cid);
                self.repos
                    .positions
                    .adjust_locked(position.position_id, request.quantity)
                    .await?;

                (
                    LedgerLock::Position {
                        position_id: position.position_id,
                        position_cid: rotated_cid,
                        quantity: request.quantity,
                    },
                    response.transaction_id,
                    Decimal::ZERO,
                )
            }
        };

        let mut order = Order {
            order_id,
            market_id: request.market_id.clone(),
            user_id: user_id.to_string(),
            side: request.side,
            action: request.action,
            order_type: request.order_type,
            price,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::Pending,
            locked_amount,
            ledger_lock_tx_id: Some(lock_tx_id),
            idempotency_key,
            created_at: now,
            updated_at: now,
        };

        // Step 4: persist the pending order. A store failure here unwinds
        // the ledger lock.
        if let Err(e) = self.repos.orders.insert(&order).await {
            error!(%order_id, "Failed to persist order, compensating lock: {e}");
            self.compensate_lock(&order, &lock).await;
            return Err(e.into());
        }

        // Step 5: match and capture trades.
        let result = self.engine.submit(&order);
        if let Err(e) = self.persist_match(&order, &result).await {
            error!(%order_id, "Failed to persist match output, compensating: {e}");
            if result.resting {
                self.engine.cancel(&order.market_id, order_id);
            }
            self.compensate_lock(&order, &lock).await;
            let _ = self
                .repos
                .orders
                .update_status(order_id, OrderStatus::Rejected)
                .await;
            return Err(e);
        }

        order.filled_quantity = result.filled_quantity;
        order.status = result.status;

        if result.status == OrderStatus::Rejected {
            // Market order against an empty book: nothing matched, nothing
            // rests. Undo the lock entirely.
            self.compensate_lock(&order, &lock).await;
            return Ok(order);
        }

        // Step 6: refund a market buy's worst-case over-lock.
        if order.action == OrderAction::Buy && order.order_type == OrderType::Market {
            if let LedgerLock::Funds { account_cid, .. } = &lock {
                let actual_cost = Self::taker_cost(&order, &result);
                let excess = order.locked_amount - actual_cost;
                if excess > REFUND_EPSILON {
                    self.release_funds(&order, account_cid, excess, "market buy refund")
                        .await;
                    order.locked_amount = actual_cost;
                    let _ = self
                        .repos
                        .orders
                        .set_locked_amount(order_id, actual_cost)
                        .await;
                }
            }
        }

        // Step 7: release the residual position lock of a sell that ended
        // terminal without resting on the book.
        if order.action == OrderAction::Sell
            && !result.resting
            && result.remaining_quantity > Decimal::ZERO
        {
            if let LedgerLock::Position {
                position_id,
                position_cid,
                ..
            } = &lock
            {
                self.release_position(
                    &order,
                    &account.party_id,
                    *position_id,
                    position_cid,
                    result.remaining_quantity,
                    "residual position unlock",
                )
                .await;
            }
        }

        info!(
            %order_id,
            %user_id,
            market_id = %market.market_id,
            status = %order.status,
            filled = %order.filled_quantity,
            trades = result.trades.len(),
            "Order placed"
        );

        Ok(order)
    }

    /// Cancel a resting (or never-opened) order, releasing what remains of
    /// its lock pro-rata. Ledger unlock failures are non-fatal.
    pub async fn cancel_order(&self, user_id: &str, order_id: Uuid) -> Result<Order, OrderError> {
        let mut order = self
            .repos
            .orders
            .get(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))?;

        if order.user_id != user_id {
            return Err(OrderError::Unauthorized);
        }
        if !order.status.is_cancellable() {
            return Err(OrderError::InvalidStatus(order.status));
        }

        let remaining = order.remaining_quantity();

        match order.action {
            OrderAction::Buy => {
                // Pro-rate the remaining locked amount by unfilled quantity.
                let unlock_amount = if order.quantity.is_zero() {
                    Decimal::ZERO
                } else {
                    order.locked_amount * remaining / order.quantity
                };
                if unlock_amount > Decimal::ZERO {
                    if let Some(account) = self.repos.accounts.get(user_id).await? {
                        let account_cid = match self.refresh_account_cid(&account).await {
                            Ok(cid) => cid,
                            Err(e) => {
                                warn!(%order_id, "Contract refresh failed during cancel: {e}");
                                account.account_contract_id.clone()
                            }
                        };
                        self.release_funds(&order, &account_cid, unlock_amount, "cancel unlock")
                            .await;
                    }
                    order.locked_amount -= unlock_amount;
                    let _ = self
                        .repos
                        .orders
                        .set_locked_amount(order_id, order.locked_amount)
                        .await;
                }
            }
            OrderAction::Sell => {
                if remaining > Decimal::ZERO {
                    let account = self.repos.accounts.get(user_id).await?;
                    let party = account
                        .as_ref()
                        .map(|a| a.party_id.clone())
                        .unwrap_or_else(|| user_id.to_string());
                    let position = self
                        .repos
                        .positions
                        .get(user_id, &order.market_id, order.side)
                        .await?;
                    if let Some(position) = position {
                        let position_cid = self
                            .resolve_position_cid(&party, &order.market_id, order.side)
                            .await
                            .unwrap_or_else(|_| format!("stale-position-{}", position.position_id));
                        self.release_position(
                            &order,
                            &party,
                            position.position_id,
                            &position_cid,
                            remaining,
                            "cancel unlock",
                        )
                        .await;
                    }
                }
            }
        }

        self.engine.cancel(&order.market_id, order_id);
        self.repos
            .orders
            .update_status(order_id, OrderStatus::Cancelled)
            .await?;
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();

        info!(%order_id, %user_id, "Order cancelled");
        Ok(order)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    async fn validate(
        &self,
        user_id: &str,
        request: &PlaceOrderRequest,
    ) -> Result<(Market, Account, Option<Position>, Decimal), OrderError> {
        if request.order_type == OrderType::Limit {
            let price = request.price.ok_or(OrderError::InvalidPrice(Decimal::ZERO))?;
            if price < MIN_LIMIT_PRICE || price > MAX_LIMIT_PRICE {
                return Err(OrderError::InvalidPrice(price));
            }
        }

        if request.quantity <= Decimal::ZERO || request.quantity > self.config.max_quantity {
            return Err(OrderError::InvalidQuantity(request.quantity));
        }

        let market = self
            .repos
            .markets
            .get(&request.market_id)
            .await?
            .ok_or_else(|| OrderError::MarketNotFound(request.market_id.clone()))?;
        if !market.is_open() {
            return Err(OrderError::MarketNotOpen(market.market_id));
        }

        // Authoritative open check. Fail closed: if the ledger cannot answer,
        // the order is refused.
        if !self.ledger.is_offline() {
            let contract = self
                .ledger
                .get_contract(&market.ledger_contract_id, &self.config.pebble_admin_party)
                .await
                .map_err(|e| OrderError::MarketVerificationFailed(e.to_string()))?
                .ok_or_else(|| {
                    OrderError::MarketVerificationFailed(format!(
                        "market contract {} not visible",
                        market.ledger_contract_id
                    ))
                })?;
            let payload: commands::MarketPayload = serde_json::from_value(contract.payload)
                .map_err(|e| OrderError::MarketVerificationFailed(e.to_string()))?;
            if !payload.is_open() {
                return Err(OrderError::MarketNotOpenOnchain(market.market_id.clone()));
            }
        }

        let account = self
            .repos
            .accounts
            .get(user_id)
            .await?
            .ok_or_else(|| OrderError::AccountNotFound(user_id.to_string()))?;

        let mut position = None;
        let required_funds = match request.action {
            OrderAction::Buy => {
                let required = match request.order_type {
                    OrderType::Limit => request.price.unwrap_or_default() * request.quantity,
                    OrderType::Market => MARKET_BUY_PRICE_CAP * request.quantity,
                };
                if account.available_balance < required {
                    return Err(OrderError::InsufficientBalance {
                        required,
                        available: account.available_balance,
                    });
                }
                required
            }
            OrderAction::Sell => {
                let held = self
                    .repos
                    .positions
                    .get(user_id, &request.market_id, request.side)
                    .await?
                    .ok_or_else(|| OrderError::NoPosition {
                        market_id: request.market_id.clone(),
                        side: request.side,
                    })?;
                if held.free_quantity() < request.quantity {
                    return Err(OrderError::InsufficientPosition {
                        required: request.quantity,
                        free: held.free_quantity(),
                    });
                }
                position = Some(held);
                Decimal::ZERO
            }
        };

        let active = self.repos.orders.count_active_for_user(user_id).await?;
        if active >= self.config.max_pending_orders_per_user {
            return Err(OrderError::MaxPendingOrders(active));
        }

        Ok((market, account, position, required_funds))
    }

    // ========================================================================
    // Ledger helpers
    // ========================================================================

    /// The freshest TradingAccount contract id for this party. The stored id
    /// is stale whenever anything touched the account on the ledger.
    async fn refresh_account_cid(&self, account: &Account) -> Result<String, OrderError> {
        if self.ledger.is_offline() {
            return Ok(account.account_contract_id.clone());
        }

        let contracts = self
            .ledger
            .get_active_contracts(TEMPLATE_TRADING_ACCOUNT, &account.party_id)
            .await?;

        match contracts.into_iter().next() {
            Some(contract) => {
                if contract.contract_id != account.account_contract_id {
                    self.repos
                        .accounts
                        .set_contract_id(&account.user_id, &contract.contract_id)
                        .await?;
                }
                Ok(contract.contract_id)
            }
            None => Ok(account.account_contract_id.clone()),
        }
    }

    async fn resolve_position_cid(
        &self,
        party: &str,
        market_id: &str,
        side: Side,
    ) -> Result<String, OrderError> {
        if self.ledger.is_offline() {
            return Ok(format!("offline-position-{party}-{market_id}-{side}"));
        }

        let contracts = self
            .ledger
            .get_active_contracts(TEMPLATE_POSITION, party)
            .await?;

        for contract in contracts {
            if let Ok(payload) = serde_json::from_value::<PositionPayload>(contract.payload.clone())
            {
                if payload.market_id == market_id && payload.side() == Some(side) {
                    return Ok(contract.contract_id);
                }
            }
        }

        Err(OrderError::Ledger(LedgerError::ContractNotFound(format!(
            "position {party}/{market_id}/{side}"
        ))))
    }

    // ========================================================================
    // Persistence and compensation
    // ========================================================================

    async fn persist_match(&self, order: &Order, result: &MatchResult) -> Result<(), OrderError> {
        self.repos.trades.insert_all(&result.trades).await?;
        self.repos
            .orders
            .apply_fill(order.order_id, result.filled_quantity, result.status)
            .await?;

        for update in &result.maker_updates {
            self.repos
                .orders
                .apply_fill(update.order_id, update.filled_quantity, update.status)
                .await?;
        }

        Ok(())
    }

    /// Incoming order's own cost across the produced trades.
    fn taker_cost(order: &Order, result: &MatchResult) -> Decimal {
        result
            .trades
            .iter()
            .map(|trade| {
                if order.side == Side::Yes || trade.trade_type == crate::models::TradeType::ShareTrade
                {
                    trade.price * trade.quantity
                } else {
                    // NO-side leg of a share creation.
                    (Decimal::ONE - trade.price) * trade.quantity
                }
            })
            .sum()
    }

    /// Unwind a ledger lock after a downstream failure. Never propagates.
    async fn compensate_lock(&self, order: &Order, lock: &LedgerLock) {
        match lock {
            LedgerLock::Funds {
                amount,
                account_cid,
            } => {
                self.release_funds(order, account_cid, *amount, "saga compensation")
                    .await;
            }
            LedgerLock::Position {
                position_id,
                position_cid,
                quantity,
            } => {
                let party = self.party_for_user(&order.user_id).await;
                self.release_position(
                    order,
                    &party,
                    *position_id,
                    position_cid,
                    *quantity,
                    "saga compensation",
                )
                .await;
            }
        }
    }

    /// The ledger party acting for a user; falls back to the user id when no
    /// account row exists.
    async fn party_for_user(&self, user_id: &str) -> String {
        match self.repos.accounts.get(user_id).await {
            Ok(Some(account)) => account.party_id,
            _ => user_id.to_string(),
        }
    }

    async fn release_funds(&self, order: &Order, account_cid: &str, amount: Decimal, why: &str) {
        let party = self.party_for_user(&order.user_id).await;
        let command_id = format!("unlock-funds-{}-{}", order.order_id, Uuid::new_v4());
        let submit = self
            .ledger
            .submit_command(SubmitCommandRequest {
                user_id: order.user_id.clone(),
                command_id,
                act_as: vec![party],
                read_as: vec![self.config.pebble_admin_party.clone()],
                commands: vec![commands::unlock_funds(account_cid, amount, order.order_id)],
            })
            .await;

        match submit {
            Ok(response) => {
                if let Some(cid) = response.new_contract_id {
                    let _ = self.repos.accounts.set_contract_id(&order.user_id, &cid).await;
                }
                let _ = self
                    .repos
                    .accounts
                    .adjust_balances(&order.user_id, amount, -amount)
                    .await;
            }
            Err(e) => {
                error!(order_id = %order.order_id, "Fund unlock failed ({why}): {e}");
                let failure = CompensationFailure::new(
                    order.order_id,
                    &order.user_id,
                    amount,
                    Some(account_cid.to_string()),
                    &format!("{why}: {e}"),
                );
                if let Err(audit_err) =
                    self.repos.audit.record_compensation_failure(&failure).await
                {
                    error!(
                        order_id = %order.order_id,
                        "Could not record compensation failure: {audit_err}"
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn release_position(
        &self,
        order: &Order,
        party: &str,
        position_id: Uuid,
        position_cid: &str,
        quantity: Decimal,
        why: &str,
    ) {
        let command_id = format!("unlock-position-{}-{}", order.order_id, Uuid::new_v4());
        let submit = self
            .ledger
            .submit_command(SubmitCommandRequest {
                user_id: order.user_id.clone(),
                command_id,
                act_as: vec![party.to_string()],
                read_as: vec![self.config.pebble_admin_party.clone()],
                commands: vec![commands::unlock_position(
                    position_cid,
                    quantity,
                    order.order_id,
                )],
            })
            .await;

        match submit {
            Ok(_) => {
                let _ = self.repos.positions.adjust_locked(position_id, -quantity).await;
            }
            Err(e) => {
                error!(order_id = %order.order_id, "Position unlock failed ({why}): {e}");
                let failure = CompensationFailure::new(
                    order.order_id,
                    &order.user_id,
                    quantity,
                    Some(position_cid.to_string()),
                    &format!("{why}: {e}"),
                );
                if let Err(audit_err) =
                    self.repos.audit.record_compensation_failure(&failure).await
                {
                    error!(
                        order_id = %order.order_id,
                        "Could not record compensation failure: {audit_err}"
                    );
                }
            }
        }
    }
}
