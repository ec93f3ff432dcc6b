use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Order, OrderStatus};
use crate::store::{OrderStore, StoreError};

const ORDER_COLUMNS: &str = r#"
    order_id, market_id, user_id, side, action, order_type, price, quantity,
    filled_quantity, status, locked_amount, ledger_lock_tx_id, idempotency_key,
    created_at, updated_at
"#;

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, market_id, user_id, side, action, order_type, price, quantity,
                filled_quantity, status, locked_amount, ledger_lock_tx_id, idempotency_key,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(order.order_id)
        .bind(&order.market_id)
        .bind(&order.user_id)
        .bind(order.side)
        .bind(order.action)
        .bind(order.order_type)
        .bind(order.price)
        .bind(order.quantity)
        .bind(order.filled_quantity)
        .bind(order.status)
        .bind(order.locked_amount)
        .bind(&order.ledger_lock_tx_id)
        .bind(&order.idempotency_key)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<Order>, StoreError> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 AND idempotency_key = $2"
        ))
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn count_active_for_user(&self, user_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM orders
            WHERE user_id = $1 AND status IN ('pending', 'open', 'partial')
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn update_status(&self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE order_id = $2")
            .bind(status)
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn apply_fill(
        &self,
        order_id: Uuid,
        filled_quantity: Decimal,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE orders
            SET filled_quantity = $1, status = $2, updated_at = NOW()
            WHERE order_id = $3
            "#,
        )
        .bind(filled_quantity)
        .bind(status)
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_locked_amount(
        &self,
        order_id: Uuid,
        locked_amount: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET locked_amount = $1, updated_at = NOW() WHERE order_id = $2")
            .bind(locked_amount)
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn orders_with_unsettled_trades(&self) -> Result<Vec<Order>, StoreError> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT DISTINCT {ORDER_COLUMNS}
            FROM orders
            WHERE order_id IN (
                SELECT buyer_order_id FROM trades WHERE settlement_status IN ('pending', 'settling')
                UNION
                SELECT seller_order_id FROM trades WHERE settlement_status IN ('pending', 'settling')
            )
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn resting_orders(&self) -> Result<Vec<Order>, StoreError> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE status IN ('open', 'partial') AND order_type = 'limit'
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }
}
