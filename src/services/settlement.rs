//! Settlement Engine
//!
//! Single-writer batching loop that drives pending trades through the
//! three-stage ledger protocol: propose, dual-accept, execute. Execution is
//! partitioned into rounds so that no user's contracts are touched twice in
//! one ledger command (UTXO contention). Failed batches retry with
//! exponential backoff; exhausted batches are parked as `failed` for an
//! operator to retry.

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::ledger::commands::{
    self, ExecuteSettlementArgs, SettlementProposalArgs, TEMPLATE_TRADING_ACCOUNT,
};
use crate::ledger::{LedgerClient, LedgerError, SubmitCommandRequest};
use crate::models::{
    BatchStatus, SettlementBatch, SettlementEvent, SettlementStatus, Side, Trade, TradeType,
};
use crate::store::{Repositories, StoreError};

const EVENT_PROPOSAL_CREATED: &str = "proposal_created";
const EVENT_BUYER_ACCEPTED: &str = "buyer_accepted";
const EVENT_SELLER_ACCEPTED: &str = "seller_accepted";
const EVENT_EXECUTED: &str = "executed";

const CONTRACT_RESOLVE_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ledger returned no contract id for trade {0}")]
    MissingContractId(Uuid),

    #[error("proposal timed out for batch {0}")]
    ProposalTimeout(Uuid),

    #[error("batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("batch {0} is not retryable in status {1}")]
    NotRetryable(Uuid, BatchStatus),

    #[error("another batch is in flight")]
    Busy,

    #[error("engine is shutting down")]
    ShuttingDown,
}

pub struct SettlementEngine {
    config: SettlementConfig,
    repos: Repositories,
    ledger: Arc<dyn LedgerClient>,
    queue: Mutex<VecDeque<Uuid>>,
    is_processing: AtomicBool,
    accepting: AtomicBool,
    shutdown_signal: Notify,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SettlementEngine {
    pub fn new(
        config: SettlementConfig,
        repos: Repositories,
        ledger: Arc<dyn LedgerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            repos,
            ledger,
            queue: Mutex::new(VecDeque::new()),
            is_processing: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            shutdown_signal: Notify::new(),
            worker: tokio::sync::Mutex::new(None),
        })
    }

    /// Recover interrupted state, then start the batching loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), SettlementError> {
        self.recover().await?;

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(engine.config.batch_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Settlement loop started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !engine.accepting.load(Ordering::SeqCst) {
                            break;
                        }
                        match engine.run_once().await {
                            Ok(Some(batch_id)) => {
                                debug!(%batch_id, "Settlement batch processed");
                            }
                            Ok(None) => {}
                            Err(e) => {
                                error!("Settlement batch failed permanently: {e}");
                            }
                        }
                    }
                    _ = engine.shutdown_signal.notified() => break,
                }
            }

            info!("Settlement loop stopped");
        });

        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    /// Queue a freshly captured trade for the next batch. Returns false once
    /// shutdown has begun.
    pub fn enqueue_trade(&self, trade_id: Uuid) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        self.queue.lock().push_back(trade_id);
        true
    }

    /// Stop the loop, draining the in-flight batch first. Further queue
    /// submissions are rejected.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown_signal.notify_waiters();

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Settlement worker join error: {e}");
            }
        }
    }

    // ========================================================================
    // Batch assembly and processing
    // ========================================================================

    /// Assemble and process at most one batch. At most one batch is in
    /// flight at any time.
    pub async fn run_once(&self) -> Result<Option<Uuid>, SettlementError> {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SettlementError::Busy);
        }

        let result = self.assemble_and_process().await;
        self.is_processing.store(false, Ordering::SeqCst);
        result
    }

    async fn assemble_and_process(&self) -> Result<Option<Uuid>, SettlementError> {
        let trades = self.assemble_batch_trades().await?;
        if trades.is_empty() {
            return Ok(None);
        }

        let trade_ids: Vec<Uuid> = trades.iter().map(|t| t.trade_id).collect();
        let mut batch = SettlementBatch::new(trade_ids);
        self.repos.settlements.create_batch(&batch).await?;
        info!(batch_id = %batch.batch_id, trades = trades.len(), "Settlement batch created");

        self.process_with_retries(&mut batch, &trades).await?;
        Ok(Some(batch.batch_id))
    }

    /// Drain the in-process queue, then top up from the store's pending
    /// trades, de-duplicated by trade id.
    async fn assemble_batch_trades(&self) -> Result<Vec<Trade>, SettlementError> {
        let max = self.config.max_batch_size;
        let mut seen = HashSet::new();
        let mut queued_ids = Vec::new();

        {
            let mut queue = self.queue.lock();
            while queued_ids.len() < max {
                match queue.pop_front() {
                    Some(id) => {
                        if seen.insert(id) {
                            queued_ids.push(id);
                        }
                    }
                    None => break,
                }
            }
        }

        let mut trades = Vec::new();
        if !queued_ids.is_empty() {
            for trade in self.repos.trades.fetch_all(&queued_ids).await? {
                if trade.settlement_status == SettlementStatus::Pending
                    && trade.settlement_id.is_none()
                {
                    trades.push(trade);
                }
            }
        }

        if trades.len() < max {
            let remainder = (max - trades.len()) as i64;
            for trade in self.repos.trades.find_unbatched_pending(remainder).await? {
                if seen.insert(trade.trade_id) {
                    trades.push(trade);
                }
            }
        }

        Ok(trades)
    }

    async fn process_with_retries(
        &self,
        batch: &mut SettlementBatch,
        trades: &[Trade],
    ) -> Result<(), SettlementError> {
        loop {
            match self.process_batch(batch, trades).await {
                Ok(last_tx_id) => {
                    self.repos
                        .trades
                        .update_settlement_status_bulk(
                            &batch.trade_ids,
                            SettlementStatus::Settled,
                            Some(Utc::now()),
                        )
                        .await?;
                    self.repos
                        .settlements
                        .mark_batch_completed(batch.batch_id, &last_tx_id)
                        .await?;
                    batch.status = BatchStatus::Completed;

                    for trade in trades {
                        if let Err(e) = self.apply_local_effects(trade).await {
                            // Projections catch up from ledger events; a miss
                            // here is drift the reconciler will repair.
                            warn!(
                                trade_id = %trade.trade_id,
                                "Local projection update failed after settlement: {e}"
                            );
                        }
                    }

                    info!(
                        batch_id = %batch.batch_id,
                        retries = batch.retry_count,
                        "Settlement batch completed"
                    );
                    return Ok(());
                }
                Err(e) if batch.retry_count < self.config.max_retries => {
                    batch.retry_count += 1;
                    batch.last_error = Some(e.to_string());
                    batch.status = BatchStatus::Pending;
                    self.repos
                        .settlements
                        .record_batch_failure(
                            batch.batch_id,
                            batch.retry_count,
                            &e.to_string(),
                            BatchStatus::Pending,
                        )
                        .await?;

                    let backoff_ms =
                        (1000u64 * (1u64 << batch.retry_count.min(15) as u32)).min(30_000);
                    warn!(
                        batch_id = %batch.batch_id,
                        retry = batch.retry_count,
                        backoff_ms,
                        "Settlement batch attempt failed, backing off: {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                    if !self.accepting.load(Ordering::SeqCst) {
                        // Shutdown interrupted the retry loop: put the trades
                        // back at the head of the queue for the next run.
                        let mut queue = self.queue.lock();
                        for trade_id in batch.trade_ids.iter().rev() {
                            queue.push_front(*trade_id);
                        }
                        return Err(SettlementError::ShuttingDown);
                    }
                }
                Err(e) => {
                    error!(
                        batch_id = %batch.batch_id,
                        retries = batch.retry_count,
                        "Settlement batch failed permanently: {e}"
                    );
                    self.repos
                        .settlements
                        .record_batch_failure(
                            batch.batch_id,
                            batch.retry_count,
                            &e.to_string(),
                            BatchStatus::Failed,
                        )
                        .await?;
                    self.repos
                        .trades
                        .update_settlement_status_bulk(
                            &batch.trade_ids,
                            SettlementStatus::Failed,
                            None,
                        )
                        .await?;
                    batch.status = BatchStatus::Failed;
                    return Err(e);
                }
            }
        }
    }

    // ========================================================================
    // Three-stage protocol
    // ========================================================================

    async fn process_batch(
        &self,
        batch: &SettlementBatch,
        trades: &[Trade],
    ) -> Result<String, SettlementError> {
        let admin = self.config.pebble_admin_party.clone();
        let propose_started = Instant::now();
        let timeout = Duration::from_millis(self.config.proposal_timeout_ms);

        // Stage 1: propose.
        self.repos
            .settlements
            .update_batch_status(batch.batch_id, BatchStatus::Proposing)
            .await?;

        let mut proposal_cids: HashMap<Uuid, String> = HashMap::new();
        for trade in trades {
            let buyer_party = self.party_for(&trade.buyer_id).await?;
            let seller_party = self.party_for(&trade.seller_id).await?;

            let seller_position_locked = match trade.trade_type {
                TradeType::ShareTrade => self
                    .repos
                    .positions
                    .get(&trade.seller_id, &trade.market_id, trade.side)
                    .await?
                    .map(|p| p.locked_quantity),
                TradeType::ShareCreation => None,
            };

            let market_contract_id = self
                .repos
                .markets
                .get(&trade.market_id)
                .await?
                .map(|m| m.ledger_contract_id)
                .unwrap_or_default();

            let args = SettlementProposalArgs {
                buyer: buyer_party,
                seller: seller_party,
                market_id: trade.market_id.clone(),
                side: trade.side,
                quantity: trade.quantity,
                price: trade.price,
                proposal_id: trade.trade_id,
                trade_type: trade.trade_type,
                market_contract_id,
                seller_position_locked_quantity: seller_position_locked,
            };

            let response = self
                .ledger
                .submit_command(SubmitCommandRequest {
                    user_id: admin.clone(),
                    command_id: format!(
                        "propose-{}-{}-a{}",
                        batch.batch_id, trade.trade_id, batch.retry_count
                    ),
                    act_as: vec![admin.clone()],
                    read_as: vec![],
                    commands: vec![commands::create_settlement_proposal(&args)],
                })
                .await?;

            let proposal_cid = response
                .new_contract_id
                .ok_or(SettlementError::MissingContractId(trade.trade_id))?;
            self.repos
                .settlements
                .insert_event(&SettlementEvent::new(
                    proposal_cid.clone(),
                    batch.batch_id,
                    Some(response.transaction_id),
                    EVENT_PROPOSAL_CREATED,
                ))
                .await?;
            proposal_cids.insert(trade.trade_id, proposal_cid);
        }

        // Stage 2: dual accept, strictly sequential per trade.
        self.repos
            .settlements
            .update_batch_status(batch.batch_id, BatchStatus::Accepting)
            .await?;

        let mut settlement_cids: HashMap<Uuid, String> = HashMap::new();
        for trade in trades {
            if propose_started.elapsed() > timeout {
                return Err(SettlementError::ProposalTimeout(batch.batch_id));
            }

            let proposal_cid = &proposal_cids[&trade.trade_id];
            let buyer_party = self.party_for(&trade.buyer_id).await?;
            let seller_party = self.party_for(&trade.seller_id).await?;

            let buyer_response = self
                .ledger
                .submit_command(SubmitCommandRequest {
                    user_id: admin.clone(),
                    command_id: format!(
                        "buyer-accept-{}-{}-a{}",
                        batch.batch_id, trade.trade_id, batch.retry_count
                    ),
                    act_as: vec![buyer_party, admin.clone()],
                    read_as: vec![],
                    commands: vec![commands::buyer_accept(proposal_cid)],
                })
                .await?;
            let accepted_cid = buyer_response
                .new_contract_id
                .ok_or(SettlementError::MissingContractId(trade.trade_id))?;
            self.repos
                .settlements
                .insert_event(&SettlementEvent::new(
                    accepted_cid.clone(),
                    batch.batch_id,
                    Some(buyer_response.transaction_id),
                    EVENT_BUYER_ACCEPTED,
                ))
                .await?;

            let seller_response = self
                .ledger
                .submit_command(SubmitCommandRequest {
                    user_id: admin.clone(),
                    command_id: format!(
                        "seller-accept-{}-{}-a{}",
                        batch.batch_id, trade.trade_id, batch.retry_count
                    ),
                    act_as: vec![seller_party, admin.clone()],
                    read_as: vec![],
                    commands: vec![commands::seller_accept(&accepted_cid)],
                })
                .await?;
            let settlement_cid = seller_response
                .new_contract_id
                .ok_or(SettlementError::MissingContractId(trade.trade_id))?;
            self.repos
                .settlements
                .insert_event(&SettlementEvent::new(
                    settlement_cid.clone(),
                    batch.batch_id,
                    Some(seller_response.transaction_id),
                    EVENT_SELLER_ACCEPTED,
                ))
                .await?;
            settlement_cids.insert(trade.trade_id, settlement_cid);
        }

        // Stage 3: execute in rounds.
        self.repos
            .settlements
            .update_batch_status(batch.batch_id, BatchStatus::Executing)
            .await?;

        let rounds = partition_rounds(trades);
        let mut last_tx_id = String::new();

        for (index, round) in rounds.iter().enumerate() {
            if index > 0 {
                // Let the ledger observe the contract ids the previous round
                // created.
                tokio::time::sleep(Duration::from_millis(self.config.round_delay_ms)).await;
            }
            if propose_started.elapsed() > timeout {
                return Err(SettlementError::ProposalTimeout(batch.batch_id));
            }

            let mut round_commands = Vec::with_capacity(round.len());
            let mut act_as: Vec<String> = Vec::new();

            for trade in round {
                let buyer_party = self.party_for(&trade.buyer_id).await?;
                let seller_party = self.party_for(&trade.seller_id).await?;

                let (buyer_side, seller_side) = match trade.trade_type {
                    TradeType::ShareCreation => (Side::Yes, Side::No),
                    TradeType::ShareTrade => (trade.side, trade.side),
                };

                let args = ExecuteSettlementArgs {
                    buyer_account_cid: self
                        .resolve_account_cid_with_retry(&trade.buyer_id, &buyer_party)
                        .await?,
                    seller_account_cid: self
                        .resolve_account_cid_with_retry(&trade.seller_id, &seller_party)
                        .await?,
                    buyer_position_cid: self
                        .resolve_position_cid(&buyer_party, &trade.market_id, buyer_side)
                        .await,
                    seller_position_cid: self
                        .resolve_position_cid(&seller_party, &trade.market_id, seller_side)
                        .await,
                };

                round_commands.push(commands::execute_settlement(
                    &settlement_cids[&trade.trade_id],
                    &args,
                ));
                for party in [buyer_party, seller_party] {
                    if !act_as.contains(&party) {
                        act_as.push(party);
                    }
                }
            }
            act_as.push(admin.clone());

            let response = self
                .ledger
                .submit_command(SubmitCommandRequest {
                    user_id: admin.clone(),
                    command_id: format!(
                        "execute-{}-round-{}-a{}",
                        batch.batch_id, index, batch.retry_count
                    ),
                    act_as,
                    read_as: vec![],
                    commands: round_commands,
                })
                .await?;

            for trade in round {
                self.repos
                    .settlements
                    .insert_event(&SettlementEvent::new(
                        settlement_cids[&trade.trade_id].clone(),
                        batch.batch_id,
                        Some(response.transaction_id.clone()),
                        EVENT_EXECUTED,
                    ))
                    .await?;
            }
            last_tx_id = response.transaction_id;
        }

        Ok(last_tx_id)
    }

    // ========================================================================
    // Post-settlement projections
    // ========================================================================

    /// Fold a settled trade into local balances, positions and market stats.
    async fn apply_local_effects(&self, trade: &Trade) -> Result<(), StoreError> {
        let buyer_cost = trade.buyer_cost();

        match trade.trade_type {
            TradeType::ShareTrade => {
                self.repos
                    .accounts
                    .adjust_balances(&trade.buyer_id, Decimal::ZERO, -buyer_cost)
                    .await?;
                self.repos
                    .accounts
                    .adjust_balances(&trade.seller_id, buyer_cost, Decimal::ZERO)
                    .await?;

                self.repos
                    .positions
                    .increase(
                        &trade.buyer_id,
                        &trade.market_id,
                        trade.side,
                        trade.quantity,
                        trade.price,
                    )
                    .await?;

                if let Some(position) = self
                    .repos
                    .positions
                    .get(&trade.seller_id, &trade.market_id, trade.side)
                    .await?
                {
                    self.repos
                        .positions
                        .reduce(position.position_id, trade.quantity, trade.quantity)
                        .await?;
                }

                self.repos
                    .markets
                    .record_settled_volume(&trade.market_id, trade.quantity, Decimal::ZERO)
                    .await?;
            }
            TradeType::ShareCreation => {
                let seller_cost = trade.seller_creation_cost();

                self.repos
                    .accounts
                    .adjust_balances(&trade.buyer_id, Decimal::ZERO, -buyer_cost)
                    .await?;
                self.repos
                    .accounts
                    .adjust_balances(&trade.seller_id, Decimal::ZERO, -seller_cost)
                    .await?;

                self.repos
                    .positions
                    .increase(
                        &trade.buyer_id,
                        &trade.market_id,
                        Side::Yes,
                        trade.quantity,
                        trade.price,
                    )
                    .await?;
                self.repos
                    .positions
                    .increase(
                        &trade.seller_id,
                        &trade.market_id,
                        Side::No,
                        trade.quantity,
                        Decimal::ONE - trade.price,
                    )
                    .await?;

                self.repos
                    .markets
                    .record_settled_volume(&trade.market_id, trade.quantity, trade.quantity)
                    .await?;
            }
        }

        Ok(())
    }

    // ========================================================================
    // Recovery and operator retry
    // ========================================================================

    /// Startup recovery. In-flight batches left by a crash are indeterminate
    /// on the ledger, so they fail; never-started pending batches are
    /// dissolved and their trades re-queued.
    async fn recover(&self) -> Result<(), SettlementError> {
        let in_flight = self
            .repos
            .settlements
            .find_batches_by_status(&[
                BatchStatus::Proposing,
                BatchStatus::Accepting,
                BatchStatus::Executing,
            ])
            .await?;

        for batch in in_flight {
            warn!(batch_id = %batch.batch_id, status = %batch.status, "Recovering incomplete batch");
            self.repos
                .settlements
                .record_batch_failure(
                    batch.batch_id,
                    batch.retry_count,
                    "incomplete batch recovered",
                    BatchStatus::Failed,
                )
                .await?;
            self.repos
                .trades
                .update_settlement_status_bulk(&batch.trade_ids, SettlementStatus::Failed, None)
                .await?;
        }

        let pending = self
            .repos
            .settlements
            .find_batches_by_status(&[BatchStatus::Pending])
            .await?;

        for batch in pending {
            info!(batch_id = %batch.batch_id, "Re-queueing never-started batch");
            self.repos.trades.reset_to_pending(&batch.trade_ids).await?;
            self.repos.settlements.delete_batch(batch.batch_id).await?;
            let mut queue = self.queue.lock();
            for trade_id in batch.trade_ids {
                queue.push_back(trade_id);
            }
        }

        Ok(())
    }

    /// Operator entry point: retry a permanently failed batch in place.
    pub async fn retry_batch(&self, batch_id: Uuid) -> Result<(), SettlementError> {
        let mut batch = self
            .repos
            .settlements
            .get_batch(batch_id)
            .await?
            .ok_or(SettlementError::BatchNotFound(batch_id))?;

        if batch.status != BatchStatus::Failed {
            return Err(SettlementError::NotRetryable(batch_id, batch.status));
        }

        if self
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SettlementError::Busy);
        }

        let result = async {
            batch.status = BatchStatus::Pending;
            batch.retry_count = 0;
            self.repos
                .settlements
                .update_batch_status(batch_id, BatchStatus::Pending)
                .await?;
            self.repos
                .trades
                .update_settlement_status_bulk(
                    &batch.trade_ids,
                    SettlementStatus::Settling,
                    None,
                )
                .await?;

            let trades = self.repos.trades.fetch_all(&batch.trade_ids).await?;
            self.process_with_retries(&mut batch, &trades).await
        }
        .await;

        self.is_processing.store(false, Ordering::SeqCst);
        result
    }

    // ========================================================================
    // Contract resolution
    // ========================================================================

    async fn party_for(&self, user_id: &str) -> Result<String, StoreError> {
        Ok(self
            .repos
            .accounts
            .get(user_id)
            .await?
            .map(|a| a.party_id)
            .unwrap_or_else(|| user_id.to_string()))
    }

    /// Account contract ids rotate every time a round executes; refresh with
    /// a few attempts before giving up and using the stored hint.
    async fn resolve_account_cid_with_retry(
        &self,
        user_id: &str,
        party: &str,
    ) -> Result<String, SettlementError> {
        let mut last_error: Option<LedgerError> = None;

        for attempt in 1..=CONTRACT_RESOLVE_ATTEMPTS {
            match self
                .ledger
                .get_active_contracts(TEMPLATE_TRADING_ACCOUNT, party)
                .await
            {
                Ok(contracts) => {
                    if let Some(contract) = contracts.into_iter().next() {
                        let _ = self
                            .repos
                            .accounts
                            .set_contract_id(user_id, &contract.contract_id)
                            .await;
                        return Ok(contract.contract_id);
                    }
                    break;
                }
                Err(e) => {
                    debug!(%party, attempt, "Account contract lookup failed: {e}");
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }

        if let Some(account) = self.repos.accounts.get(user_id).await? {
            return Ok(account.account_contract_id);
        }

        Err(match last_error {
            Some(e) => SettlementError::Ledger(e),
            None => SettlementError::Ledger(LedgerError::ContractNotFound(party.to_string())),
        })
    }

    async fn resolve_position_cid(
        &self,
        party: &str,
        market_id: &str,
        side: Side,
    ) -> Option<String> {
        for attempt in 1..=CONTRACT_RESOLVE_ATTEMPTS {
            match self
                .ledger
                .get_active_contracts(commands::TEMPLATE_POSITION, party)
                .await
            {
                Ok(contracts) => {
                    for contract in contracts {
                        if let Ok(payload) = serde_json::from_value::<commands::PositionPayload>(
                            contract.payload.clone(),
                        ) {
                            if payload.market_id == market_id && payload.side() == Some(side) {
                                return Some(contract.contract_id);
                            }
                        }
                    }
                    return None;
                }
                Err(e) => {
                    debug!(%party, attempt, "Position contract lookup failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }

        None
    }
}

/// Greedy earliest-first round partition. A trade joins the current round
/// iff neither its buyer nor its seller already appears in that round, so
/// each user's contracts are exercised at most once per round.
pub fn partition_rounds(trades: &[Trade]) -> Vec<Vec<Trade>> {
    let mut remaining: Vec<&Trade> = trades.iter().collect();
    let mut rounds = Vec::new();

    while !remaining.is_empty() {
        let mut users: HashSet<&str> = HashSet::new();
        let mut round = Vec::new();
        let mut deferred = Vec::new();

        for trade in remaining {
            if users.contains(trade.buyer_id.as_str()) || users.contains(trade.seller_id.as_str())
            {
                deferred.push(trade);
            } else {
                users.insert(trade.buyer_id.as_str());
                users.insert(trade.seller_id.as_str());
                round.push(trade.clone());
            }
        }

        // The first unassigned trade always joins, so progress is
        // guaranteed; an empty round is a fatal invariant violation.
        assert!(!round.is_empty(), "round partition made no progress");

        rounds.push(round);
        remaining = deferred;
    }

    rounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TradeStore;
    use crate::testutil::{
        funded_account, held_position, open_market, pending_trade, MemoryStore, ScriptedLedger,
    };
    use rust_decimal_macros::dec;

    const MARKET: &str = "mkt-1";

    fn engine_with(
        store: &Arc<MemoryStore>,
        ledger: &Arc<ScriptedLedger>,
        config: SettlementConfig,
    ) -> Arc<SettlementEngine> {
        SettlementEngine::new(config, store.repositories(), ledger.clone())
    }

    fn seed_share_trade(store: &MemoryStore) -> Trade {
        store.seed_market(open_market(MARKET));

        let mut buyer = funded_account("alice", dec!(950));
        buyer.locked_balance = dec!(50);
        store.seed_account(buyer);
        store.seed_account(funded_account("bob", dec!(1000)));

        let mut position = held_position("bob", MARKET, Side::Yes, dec!(100));
        position.locked_quantity = dec!(100);
        store.seed_position(position);

        let trade = pending_trade(MARKET, "alice", "bob", dec!(0.50), dec!(100), TradeType::ShareTrade);
        store.seed_trade(trade.clone());
        trade
    }

    fn seed_share_creation(store: &MemoryStore) -> Trade {
        store.seed_market(open_market(MARKET));

        let mut yes_buyer = funded_account("yara", dec!(60));
        yes_buyer.locked_balance = dec!(40);
        store.seed_account(yes_buyer);
        let mut no_buyer = funded_account("nina", dec!(40));
        no_buyer.locked_balance = dec!(60);
        store.seed_account(no_buyer);

        let trade = pending_trade(
            MARKET,
            "yara",
            "nina",
            dec!(0.40),
            dec!(100),
            TradeType::ShareCreation,
        );
        store.seed_trade(trade.clone());
        trade
    }

    fn trade_between(buyer: &str, seller: &str) -> Trade {
        pending_trade(MARKET, buyer, seller, dec!(0.50), dec!(10), TradeType::ShareTrade)
    }

    // ------------------------------------------------------------------
    // Round partitioning
    // ------------------------------------------------------------------

    #[test]
    fn test_partition_rounds_separates_contending_users() {
        let trades = vec![
            trade_between("a", "b"),
            trade_between("c", "d"),
            trade_between("a", "c"),
            trade_between("b", "d"),
        ];

        let rounds = partition_rounds(&trades);

        // First round takes (a,b) and (c,d); the rest wait.
        assert_eq!(rounds[0].len(), 2);
        assert_eq!(rounds[0][0].buyer_id, "a");
        assert_eq!(rounds[0][1].buyer_id, "c");

        // Every trade lands somewhere, and no user appears twice per round.
        let total: usize = rounds.iter().map(|r| r.len()).sum();
        assert_eq!(total, trades.len());
        for round in &rounds {
            let mut users = HashSet::new();
            for trade in round {
                assert!(users.insert(trade.buyer_id.clone()), "buyer twice in round");
                assert!(users.insert(trade.seller_id.clone()), "seller twice in round");
            }
        }
    }

    #[test]
    fn test_partition_rounds_single_user_chain() {
        let trades = vec![
            trade_between("a", "b"),
            trade_between("a", "c"),
            trade_between("a", "d"),
        ];

        let rounds = partition_rounds(&trades);
        assert_eq!(rounds.len(), 3);
        for round in &rounds {
            assert_eq!(round.len(), 1);
        }
    }

    // ------------------------------------------------------------------
    // Three-stage protocol
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_share_trade_settles_end_to_end() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();
        let trade = seed_share_trade(&store);
        let engine = engine_with(&store, &ledger, SettlementConfig::default());

        let batch_id = engine.run_once().await.unwrap().unwrap();

        let batch = store.batch(batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.ledger_tx_id.is_some());
        assert!(batch.processed_at.is_some());
        assert_eq!(batch.retry_count, 0);

        let settled = store.trade(trade.trade_id).unwrap();
        assert_eq!(settled.settlement_status, SettlementStatus::Settled);
        assert!(settled.settled_at.is_some());
        assert_eq!(settled.settlement_id, Some(batch_id));

        // Full event trail for the single trade.
        let statuses: Vec<String> = store
            .settlement_events()
            .iter()
            .map(|e| e.status.clone())
            .collect();
        assert_eq!(
            statuses,
            vec![
                EVENT_PROPOSAL_CREATED,
                EVENT_BUYER_ACCEPTED,
                EVENT_SELLER_ACCEPTED,
                EVENT_EXECUTED,
            ]
        );

        // Buyer's locked collateral moved to the seller's available balance.
        let buyer = store.account("alice").unwrap();
        assert_eq!(buyer.locked_balance, dec!(0));
        let seller = store.account("bob").unwrap();
        assert_eq!(seller.available_balance, dec!(1050));

        // Shares moved: buyer gained, seller's emptied position archived.
        let buyer_position = store.position("alice", MARKET, Side::Yes).unwrap();
        assert_eq!(buyer_position.quantity, dec!(100));
        assert_eq!(buyer_position.avg_cost_basis, dec!(0.50));
        assert!(store.position("bob", MARKET, Side::Yes).is_none());
        assert!(store.archived_position("bob", MARKET, Side::Yes).is_some());

        let market = store.market(MARKET).unwrap();
        assert_eq!(market.total_volume, dec!(100));
        assert_eq!(market.open_interest, dec!(0));
    }

    #[tokio::test]
    async fn test_share_creation_mints_both_sides() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();
        let trade = seed_share_creation(&store);
        let engine = engine_with(&store, &ledger, SettlementConfig::default());

        engine.run_once().await.unwrap().unwrap();

        assert_eq!(
            store.trade(trade.trade_id).unwrap().settlement_status,
            SettlementStatus::Settled
        );

        // Both legs funded the mint from their locked balances.
        assert_eq!(store.account("yara").unwrap().locked_balance, dec!(0));
        assert_eq!(store.account("nina").unwrap().locked_balance, dec!(0));

        let yes = store.position("yara", MARKET, Side::Yes).unwrap();
        assert_eq!(yes.quantity, dec!(100));
        assert_eq!(yes.avg_cost_basis, dec!(0.40));
        let no = store.position("nina", MARKET, Side::No).unwrap();
        assert_eq!(no.quantity, dec!(100));
        assert_eq!(no.avg_cost_basis, dec!(0.60));

        let market = store.market(MARKET).unwrap();
        assert_eq!(market.open_interest, dec!(100));
    }

    #[tokio::test]
    async fn test_queue_feeds_batches_and_dedups() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();
        let trade = seed_share_trade(&store);
        let engine = engine_with(&store, &ledger, SettlementConfig::default());

        assert!(engine.enqueue_trade(trade.trade_id));
        assert!(engine.enqueue_trade(trade.trade_id));

        let batch_id = engine.run_once().await.unwrap().unwrap();
        let batch = store.batch(batch_id).unwrap();
        assert_eq!(batch.trade_ids, vec![trade.trade_id]);

        // Nothing left to settle.
        assert!(engine.run_once().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_execute_retries_and_succeeds() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();
        let trade = seed_share_trade(&store);
        let engine = engine_with(&store, &ledger, SettlementConfig::default());

        ledger.fail_next_matching("execute-");

        let batch_id = engine.run_once().await.unwrap().unwrap();

        let batch = store.batch(batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.retry_count, 1);
        assert!(batch.last_error.is_some());

        let settled = store.trade(trade.trade_id).unwrap();
        assert_eq!(settled.settlement_status, SettlementStatus::Settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_then_operator_retry_succeeds() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();
        let trade = seed_share_trade(&store);
        let engine = engine_with(&store, &ledger, SettlementConfig::default());

        // Initial attempt plus all three retries fail.
        for _ in 0..4 {
            ledger.fail_next_matching("propose-");
        }

        let err = engine.run_once().await.unwrap_err();
        assert!(matches!(err, SettlementError::Ledger(_)));

        let batch = store.all_batches().into_iter().next().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.retry_count, 3);
        assert_eq!(
            store.trade(trade.trade_id).unwrap().settlement_status,
            SettlementStatus::Failed
        );

        // Operator review: retry the parked batch, which now goes through.
        engine.retry_batch(batch.batch_id).await.unwrap();

        let batch = store.batch(batch.batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(
            store.trade(trade.trade_id).unwrap().settlement_status,
            SettlementStatus::Settled
        );
    }

    #[tokio::test]
    async fn test_retry_batch_guards_status() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();
        let engine = engine_with(&store, &ledger, SettlementConfig::default());

        let err = engine.retry_batch(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SettlementError::BatchNotFound(_)));

        let _trade = seed_share_trade(&store);
        let batch_id = engine.run_once().await.unwrap().unwrap();
        let err = engine.retry_batch(batch_id).await.unwrap_err();
        assert!(matches!(err, SettlementError::NotRetryable(_, _)));
    }

    #[tokio::test]
    async fn test_execution_rounds_respect_user_contention() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();
        store.seed_market(open_market(MARKET));

        for user in ["a", "b", "c", "d"] {
            let mut account = funded_account(user, dec!(1000));
            account.locked_balance = dec!(100);
            store.seed_account(account);
            let mut position = held_position(user, MARKET, Side::Yes, dec!(100));
            position.locked_quantity = dec!(100);
            store.seed_position(position);
        }

        for trade in [
            trade_between("a", "b"),
            trade_between("c", "d"),
            trade_between("a", "c"),
            trade_between("b", "d"),
        ] {
            store.seed_trade(trade);
        }

        let engine = engine_with(&store, &ledger, SettlementConfig::default());
        engine.run_once().await.unwrap().unwrap();

        // (a,b)+(c,d) execute together; (a,c)+(b,d) follow in round two.
        let executes = ledger.submissions_matching("execute-");
        assert_eq!(executes.len(), 2);
        assert_eq!(executes[0].commands.len(), 2);
        assert_eq!(executes[1].commands.len(), 2);

        for execute in &executes {
            let mut seen = HashSet::new();
            for party in &execute.act_as {
                assert!(seen.insert(party.clone()), "party {party} twice in round");
            }
        }
    }

    // ------------------------------------------------------------------
    // Recovery and shutdown
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_recovery_fails_in_flight_and_requeues_pending() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();

        store.seed_market(open_market(MARKET));
        let interrupted = pending_trade(MARKET, "alice", "bob", dec!(0.50), dec!(10), TradeType::ShareTrade);
        let untouched = pending_trade(MARKET, "carol", "dave", dec!(0.60), dec!(10), TradeType::ShareTrade);
        store.seed_trade(interrupted.clone());
        store.seed_trade(untouched.clone());

        let mut in_flight = SettlementBatch::new(vec![interrupted.trade_id]);
        in_flight.status = BatchStatus::Accepting;
        store.seed_batch(in_flight.clone());
        store
            .update_settlement_status_bulk(
                &[interrupted.trade_id],
                SettlementStatus::Settling,
                None,
            )
            .await
            .unwrap();

        let mut never_started = SettlementBatch::new(vec![untouched.trade_id]);
        never_started.status = BatchStatus::Pending;
        store.seed_batch(never_started.clone());

        let engine = engine_with(&store, &ledger, SettlementConfig::default());
        engine.recover().await.unwrap();

        // The interrupted batch is indeterminate on the ledger: parked.
        let failed = store.batch(in_flight.batch_id).unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("incomplete batch recovered"));
        assert_eq!(
            store.trade(interrupted.trade_id).unwrap().settlement_status,
            SettlementStatus::Failed
        );

        // The never-started batch dissolves and its trade goes again.
        assert!(store.batch(never_started.batch_id).is_none());
        let trade = store.trade(untouched.trade_id).unwrap();
        assert_eq!(trade.settlement_status, SettlementStatus::Pending);
        assert!(trade.settlement_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_queue_submissions() {
        let store = MemoryStore::shared();
        let ledger = ScriptedLedger::shared();
        let engine = engine_with(&store, &ledger, SettlementConfig::default());

        engine.start().await.unwrap();
        assert!(engine.enqueue_trade(Uuid::new_v4()));

        engine.shutdown().await;
        assert!(!engine.enqueue_trade(Uuid::new_v4()));
    }
}
