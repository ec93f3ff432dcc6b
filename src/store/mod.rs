//! Persistent Store
//!
//! Typed repositories over Postgres. Each repository is a small capability
//! trait (see `repository.rs`) so the order saga, settlement engine and
//! reconciler can be exercised against in-memory doubles.

mod accounts;
mod audit;
mod markets;
mod orders;
mod positions;
mod repository;
mod settlements;
mod trades;

pub use accounts::PgAccountStore;
pub use audit::PgAuditStore;
pub use markets::PgMarketStore;
pub use orders::PgOrderStore;
pub use positions::PgPositionStore;
pub use repository::*;
pub use settlements::PgSettlementStore;
pub use trades::PgTradeStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info};

/// All store failures surface as this single kind.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Database connection wrapper.
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the bundled schema. Statements are idempotent; enum types that
    /// already exist are skipped.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let schema = include_str!("schema.sql");

        for statement in schema.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                let duplicate = e
                    .as_database_error()
                    .and_then(|d| d.code())
                    .map(|c| c == "42710" || c == "42P07")
                    .unwrap_or(false);
                if duplicate {
                    debug!("Skipping existing schema object");
                    continue;
                }
                return Err(e.into());
            }
        }

        info!("Database schema applied");
        Ok(())
    }

    /// Construct the full set of Postgres-backed repositories.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            markets: Arc::new(PgMarketStore::new(self.pool.clone())),
            orders: Arc::new(PgOrderStore::new(self.pool.clone())),
            trades: Arc::new(PgTradeStore::new(self.pool.clone())),
            accounts: Arc::new(PgAccountStore::new(self.pool.clone())),
            positions: Arc::new(PgPositionStore::new(self.pool.clone())),
            settlements: Arc::new(PgSettlementStore::new(self.pool.clone())),
            audit: Arc::new(PgAuditStore::new(self.pool.clone())),
        }
    }
}

/// Bundle of repository handles injected into the services.
#[derive(Clone)]
pub struct Repositories {
    pub markets: Arc<dyn MarketStore>,
    pub orders: Arc<dyn OrderStore>,
    pub trades: Arc<dyn TradeStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub positions: Arc<dyn PositionStore>,
    pub settlements: Arc<dyn SettlementStore>,
    pub audit: Arc<dyn AuditStore>,
}
