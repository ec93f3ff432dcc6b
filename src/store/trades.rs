use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{SettlementStatus, Trade};
use crate::store::{StoreError, TradeStore};

const TRADE_COLUMNS: &str = r#"
    trade_id, market_id, buyer_id, seller_id, side, price, quantity,
    buyer_order_id, seller_order_id, trade_type, settlement_id,
    settlement_status, created_at, settled_at
"#;

pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeStore for PgTradeStore {
    async fn insert_all(&self, trades: &[Trade]) -> Result<(), StoreError> {
        if trades.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for trade in trades {
            sqlx::query(
                r#"
                INSERT INTO trades (
                    trade_id, market_id, buyer_id, seller_id, side, price, quantity,
                    buyer_order_id, seller_order_id, trade_type, settlement_id,
                    settlement_status, created_at, settled_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (trade_id) DO NOTHING
                "#,
            )
            .bind(trade.trade_id)
            .bind(&trade.market_id)
            .bind(&trade.buyer_id)
            .bind(&trade.seller_id)
            .bind(trade.side)
            .bind(trade.price)
            .bind(trade.quantity)
            .bind(trade.buyer_order_id)
            .bind(trade.seller_order_id)
            .bind(trade.trade_type)
            .bind(trade.settlement_id)
            .bind(trade.settlement_status)
            .bind(trade.created_at)
            .bind(trade.settled_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, trade_id: Uuid) -> Result<Option<Trade>, StoreError> {
        let trade = sqlx::query_as::<_, Trade>(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE trade_id = $1"
        ))
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(trade)
    }

    async fn fetch_all(&self, trade_ids: &[Uuid]) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE trade_id = ANY($1) ORDER BY created_at ASC"
        ))
        .bind(trade_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(trades)
    }

    async fn find_unbatched_pending(&self, limit: i64) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(&format!(
            r#"
            SELECT {TRADE_COLUMNS}
            FROM trades
            WHERE settlement_status = 'pending' AND settlement_id IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(trades)
    }

    async fn update_settlement_status_bulk(
        &self,
        trade_ids: &[Uuid],
        status: SettlementStatus,
        settled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if trade_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE trades
            SET settlement_status = $1,
                settled_at = COALESCE($2, settled_at)
            WHERE trade_id = ANY($3)
            "#,
        )
        .bind(status)
        .bind(settled_at)
        .bind(trade_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reset_to_pending(&self, trade_ids: &[Uuid]) -> Result<(), StoreError> {
        if trade_ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE trades
            SET settlement_status = 'pending', settlement_id = NULL
            WHERE trade_id = ANY($1)
            "#,
        )
        .bind(trade_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
