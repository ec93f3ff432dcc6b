use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::models::Market;
use crate::store::{MarketStore, StoreError};

pub struct PgMarketStore {
    pool: PgPool,
}

impl PgMarketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarketStore for PgMarketStore {
    async fn get(&self, market_id: &str) -> Result<Option<Market>, StoreError> {
        let market = sqlx::query_as::<_, Market>(
            r#"
            SELECT market_id, question, description, resolution_time, status, outcome,
                   yes_price, no_price, volume_24h, total_volume, open_interest,
                   ledger_contract_id, version, last_updated
            FROM markets
            WHERE market_id = $1
            "#,
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(market)
    }

    async fn upsert(&self, market: &Market) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO markets (
                market_id, question, description, resolution_time, status, outcome,
                yes_price, no_price, volume_24h, total_volume, open_interest,
                ledger_contract_id, version, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (market_id) DO UPDATE SET
                question = $2,
                description = $3,
                resolution_time = $4,
                status = $5,
                outcome = $6,
                yes_price = $7,
                no_price = $8,
                volume_24h = $9,
                total_volume = $10,
                open_interest = $11,
                ledger_contract_id = $12,
                version = markets.version + 1,
                last_updated = NOW()
            "#,
        )
        .bind(&market.market_id)
        .bind(&market.question)
        .bind(&market.description)
        .bind(market.resolution_time)
        .bind(market.status)
        .bind(market.outcome)
        .bind(market.yes_price)
        .bind(market.no_price)
        .bind(market.volume_24h)
        .bind(market.total_volume)
        .bind(market.open_interest)
        .bind(&market.ledger_contract_id)
        .bind(market.version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_settled_volume(
        &self,
        market_id: &str,
        quantity: Decimal,
        open_interest_delta: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE markets
            SET volume_24h = volume_24h + $1,
                total_volume = total_volume + $1,
                open_interest = open_interest + $2,
                version = version + 1,
                last_updated = NOW()
            WHERE market_id = $3
            "#,
        )
        .bind(quantity)
        .bind(open_interest_delta)
        .bind(market_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
