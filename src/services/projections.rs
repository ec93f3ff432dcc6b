//! Ledger Event Projections
//!
//! Folds the ledger's event stream into the local account and position
//! projections. Folding is idempotent by contract id: replaying the same
//! event sequence produces identical store state, and archive events for
//! contracts the store never saw are no-ops.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::commands::{
    PositionPayload, TradingAccountPayload, TEMPLATE_POSITION, TEMPLATE_TRADING_ACCOUNT,
};
use crate::models::{Account, Position};
use crate::store::{AccountStore, PositionStore, StoreError};

/// One event from the ledger stream.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Created {
        template_id: String,
        contract_id: String,
        payload: Value,
    },
    Archived {
        template_id: String,
        contract_id: String,
        payload: Value,
    },
}

pub struct BalanceProjection {
    accounts: Arc<dyn AccountStore>,
}

impl BalanceProjection {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }

    /// A `Created(TradingAccount)` event replaces the account row for its
    /// owner with the new balances and the new contract id: each ledger
    /// mutation archives the old contract and creates a successor.
    pub async fn apply(&self, event: &LedgerEvent) -> Result<(), StoreError> {
        match event {
            LedgerEvent::Created {
                template_id,
                contract_id,
                payload,
            } if template_id == TEMPLATE_TRADING_ACCOUNT => {
                let payload: TradingAccountPayload = match serde_json::from_value(payload.clone())
                {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(%contract_id, "Skipping malformed TradingAccount payload: {e}");
                        return Ok(());
                    }
                };

                let user_id = user_id_from_party(&payload.owner);
                self.accounts
                    .upsert(&Account {
                        user_id,
                        party_id: payload.owner.clone(),
                        account_contract_id: contract_id.clone(),
                        available_balance: payload.available_balance,
                        locked_balance: payload.locked_balance,
                        last_updated: Utc::now(),
                    })
                    .await?;
                debug!(%contract_id, owner = %payload.owner, "Balance projection updated");
            }
            // Archives of unknown contracts are no-ops: the successor's
            // Created event already replaced the row.
            LedgerEvent::Archived { .. } | LedgerEvent::Created { .. } => {}
        }

        Ok(())
    }
}

pub struct PositionProjection {
    positions: Arc<dyn PositionStore>,
}

impl PositionProjection {
    pub fn new(positions: Arc<dyn PositionStore>) -> Self {
        Self { positions }
    }

    pub async fn apply(&self, event: &LedgerEvent) -> Result<(), StoreError> {
        match event {
            LedgerEvent::Created {
                template_id,
                contract_id,
                payload,
            } if template_id == TEMPLATE_POSITION => {
                let payload: PositionPayload = match serde_json::from_value(payload.clone()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(%contract_id, "Skipping malformed Position payload: {e}");
                        return Ok(());
                    }
                };
                let Some(side) = payload.side() else {
                    warn!(%contract_id, side = %payload.side, "Unknown side value on wire");
                    return Ok(());
                };

                let user_id = user_id_from_party(&payload.owner);
                self.positions
                    .replace_from_ledger(&Position {
                        position_id: Uuid::new_v4(),
                        user_id: user_id.clone(),
                        market_id: payload.market_id.clone(),
                        side,
                        quantity: payload.quantity,
                        locked_quantity: payload.locked_quantity,
                        avg_cost_basis: rust_decimal::Decimal::ZERO,
                        is_archived: false,
                        last_updated: Utc::now(),
                    })
                    .await?;
                debug!(%contract_id, owner = %payload.owner, "Position projection updated");
            }
            LedgerEvent::Archived {
                template_id,
                payload,
                ..
            } if template_id == TEMPLATE_POSITION => {
                // Only an empty position may be archived for good; an archive
                // mid-rotation is followed by the successor's Created event.
                if let Ok(payload) = serde_json::from_value::<PositionPayload>(payload.clone()) {
                    if payload.quantity.is_zero() {
                        if let Some(side) = payload.side() {
                            let user_id = user_id_from_party(&payload.owner);
                            self.positions
                                .archive_if_empty(&user_id, &payload.market_id, side)
                                .await?;
                        }
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Drives both projections from a ledger event channel.
pub struct ProjectionRunner {
    balances: BalanceProjection,
    positions: PositionProjection,
}

impl ProjectionRunner {
    pub fn new(accounts: Arc<dyn AccountStore>, positions: Arc<dyn PositionStore>) -> Self {
        Self {
            balances: BalanceProjection::new(accounts),
            positions: PositionProjection::new(positions),
        }
    }

    pub async fn apply(&self, event: &LedgerEvent) -> Result<(), StoreError> {
        self.balances.apply(event).await?;
        self.positions.apply(event).await?;
        Ok(())
    }

    /// Fold events until the channel closes.
    pub fn spawn(self, mut events: mpsc::Receiver<LedgerEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Projection runner started");
            while let Some(event) = events.recv().await {
                if let Err(e) = self.apply(&event).await {
                    warn!("Projection fold failed, event skipped: {e}");
                }
            }
            info!("Projection runner stopped");
        })
    }
}

/// Party ids carry a `user::fingerprint` shape; the local key is the part
/// before the separator.
fn user_id_from_party(party: &str) -> String {
    party.split("::").next().unwrap_or(party).to_string()
}
