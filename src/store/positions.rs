use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Position, Side};
use crate::store::{PositionStore, StoreError};

const POSITION_COLUMNS: &str = r#"
    position_id, user_id, market_id, side, quantity, locked_quantity,
    avg_cost_basis, is_archived, last_updated
"#;

pub struct PgPositionStore {
    pool: PgPool,
}

impl PgPositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn get(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
    ) -> Result<Option<Position>, StoreError> {
        let position = sqlx::query_as::<_, Position>(&format!(
            r#"
            SELECT {POSITION_COLUMNS}
            FROM positions
            WHERE user_id = $1 AND market_id = $2 AND side = $3 AND NOT is_archived
            "#
        ))
        .bind(user_id)
        .bind(market_id)
        .bind(side)
        .fetch_optional(&self.pool)
        .await?;

        Ok(position)
    }

    async fn increase(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), StoreError> {
        // Blends avg cost the way the shares upsert does: weighted by the
        // pre-existing quantity.
        sqlx::query(
            r#"
            INSERT INTO positions (
                position_id, user_id, market_id, side, quantity, locked_quantity,
                avg_cost_basis, is_archived, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, FALSE, NOW())
            ON CONFLICT (user_id, market_id, side) WHERE NOT is_archived DO UPDATE SET
                avg_cost_basis = CASE
                    WHEN positions.quantity + $5 = 0 THEN 0
                    ELSE (positions.avg_cost_basis * positions.quantity + $6 * $5)
                         / (positions.quantity + $5)
                END,
                quantity = positions.quantity + $5,
                last_updated = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(market_id)
        .bind(side)
        .bind(quantity)
        .bind(price)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reduce(
        &self,
        position_id: Uuid,
        quantity: Decimal,
        unlock_quantity: Decimal,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE positions
            SET quantity = quantity - $1,
                locked_quantity = locked_quantity - $2,
                last_updated = NOW()
            WHERE position_id = $3
            "#,
        )
        .bind(quantity)
        .bind(unlock_quantity)
        .bind(position_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE positions
            SET is_archived = TRUE, last_updated = NOW()
            WHERE position_id = $1 AND quantity = 0 AND locked_quantity = 0
            "#,
        )
        .bind(position_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn adjust_locked(&self, position_id: Uuid, delta: Decimal) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE positions
            SET locked_quantity = locked_quantity + $1, last_updated = NOW()
            WHERE position_id = $2
            "#,
        )
        .bind(delta)
        .bind(position_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_from_ledger(&self, position: &Position) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                position_id, user_id, market_id, side, quantity, locked_quantity,
                avg_cost_basis, is_archived, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, NOW())
            ON CONFLICT (user_id, market_id, side) WHERE NOT is_archived DO UPDATE SET
                quantity = $5,
                locked_quantity = $6,
                avg_cost_basis = $7,
                last_updated = NOW()
            "#,
        )
        .bind(position.position_id)
        .bind(&position.user_id)
        .bind(&position.market_id)
        .bind(position.side)
        .bind(position.quantity)
        .bind(position.locked_quantity)
        .bind(position.avg_cost_basis)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn archive_if_empty(
        &self,
        user_id: &str,
        market_id: &str,
        side: Side,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE positions
            SET is_archived = TRUE, last_updated = NOW()
            WHERE user_id = $1 AND market_id = $2 AND side = $3
              AND NOT is_archived AND quantity = 0 AND locked_quantity = 0
            "#,
        )
        .bind(user_id)
        .bind(market_id)
        .bind(side)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
