//! Drift Reconciler
//!
//! Periodic sweep comparing stale account projections against authoritative
//! on-chain balances. Material drift overwrites the projection and leaves an
//! audit row; healthy accounts just get their staleness clock reset. The
//! sweep is best-effort: a failure on one account is logged and skipped.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReconciliationConfig;
use crate::ledger::commands::{TradingAccountPayload, TEMPLATE_TRADING_ACCOUNT};
use crate::ledger::LedgerClient;
use crate::models::{Account, ReconciliationRecord};
use crate::store::Repositories;

pub struct Reconciler {
    config: ReconciliationConfig,
    repos: Repositories,
    ledger: Arc<dyn LedgerClient>,
    running: AtomicBool,
    shutdown_signal: Notify,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Outcome of reconciling a single account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Drift above tolerance; projection overwritten.
    Corrected,
    /// Within tolerance; staleness clock reset.
    InSync,
    /// No on-chain account visible; skipped.
    Unverifiable,
}

impl Reconciler {
    pub fn new(
        config: ReconciliationConfig,
        repos: Repositories,
        ledger: Arc<dyn LedgerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            repos,
            ledger,
            running: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
            worker: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);

        let reconciler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(reconciler.config.interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Reconciler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !reconciler.running.load(Ordering::SeqCst) {
                            break;
                        }
                        reconciler.sweep().await;
                    }
                    _ = reconciler.shutdown_signal.notified() => break,
                }
            }

            info!("Reconciler stopped");
        });

        *self.worker.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown_signal.notify_waiters();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// One pass over accounts untouched for the staleness threshold.
    pub async fn sweep(&self) {
        let threshold =
            Utc::now() - ChronoDuration::minutes(self.config.stale_threshold_minutes as i64);

        let stale = match self.repos.accounts.find_stale(threshold).await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Reconciler could not list stale accounts: {e}");
                return;
            }
        };

        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "Reconciling stale accounts");

        for account in stale {
            match self.reconcile_account(&account).await {
                Ok(outcome) => {
                    debug!(user_id = %account.user_id, ?outcome, "Account reconciled");
                }
                Err(e) => {
                    // Best-effort sweep: log and move to the next account.
                    warn!(user_id = %account.user_id, "Reconciliation skipped: {e}");
                }
            }
        }
    }

    /// Compare one projection against on-chain truth and repair if drift
    /// exceeds the relative tolerance.
    pub async fn reconcile_account(
        &self,
        account: &Account,
    ) -> Result<ReconcileOutcome, anyhow::Error> {
        let contracts = self
            .ledger
            .get_active_contracts(TEMPLATE_TRADING_ACCOUNT, &account.party_id)
            .await?;

        let Some(contract) = contracts.into_iter().next() else {
            return Ok(ReconcileOutcome::Unverifiable);
        };
        let payload: TradingAccountPayload = serde_json::from_value(contract.payload)?;

        let drift = (account.available_balance - payload.available_balance).abs()
            + (account.locked_balance - payload.locked_balance).abs();
        let onchain_total = payload.available_balance + payload.locked_balance;
        let relative_drift = if onchain_total.is_zero() {
            Decimal::ZERO
        } else {
            drift / onchain_total
        };

        if relative_drift > self.config.drift_tolerance_percentage {
            warn!(
                user_id = %account.user_id,
                %drift,
                %relative_drift,
                "Balance drift above tolerance, overwriting projection"
            );

            self.repos
                .accounts
                .overwrite_balances(
                    &account.user_id,
                    payload.available_balance,
                    payload.locked_balance,
                )
                .await?;
            self.repos
                .accounts
                .set_contract_id(&account.user_id, &contract.contract_id)
                .await?;
            self.repos
                .audit
                .record_reconciliation(&ReconciliationRecord {
                    id: Uuid::new_v4(),
                    user_id: account.user_id.clone(),
                    local_available: account.available_balance,
                    local_locked: account.locked_balance,
                    onchain_available: payload.available_balance,
                    onchain_locked: payload.locked_balance,
                    drift,
                    reconciled: true,
                    created_at: Utc::now(),
                })
                .await?;

            Ok(ReconcileOutcome::Corrected)
        } else {
            // Defer the next check.
            self.repos.accounts.touch(&account.user_id).await?;
            Ok(ReconcileOutcome::InSync)
        }
    }
}
