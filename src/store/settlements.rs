use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{BatchStatus, SettlementBatch, SettlementEvent};
use crate::store::{SettlementStore, StoreError};

#[derive(FromRow)]
struct BatchRow {
    batch_id: Uuid,
    status: BatchStatus,
    ledger_tx_id: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    last_error: Option<String>,
}

impl BatchRow {
    fn into_batch(self, trade_ids: Vec<Uuid>) -> SettlementBatch {
        SettlementBatch {
            batch_id: self.batch_id,
            trade_ids,
            status: self.status,
            ledger_tx_id: self.ledger_tx_id,
            created_at: self.created_at,
            processed_at: self.processed_at,
            retry_count: self.retry_count,
            last_error: self.last_error,
        }
    }
}

pub struct PgSettlementStore {
    pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn trade_ids_for(&self, batch_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT trade_id FROM settlement_batch_trades WHERE batch_id = $1",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    async fn create_batch(&self, batch: &SettlementBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO settlement_batches (
                batch_id, status, ledger_tx_id, created_at, processed_at,
                retry_count, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(batch.batch_id)
        .bind(batch.status)
        .bind(&batch.ledger_tx_id)
        .bind(batch.created_at)
        .bind(batch.processed_at)
        .bind(batch.retry_count)
        .bind(&batch.last_error)
        .execute(&mut *tx)
        .await?;

        for trade_id in &batch.trade_ids {
            sqlx::query(
                "INSERT INTO settlement_batch_trades (batch_id, trade_id) VALUES ($1, $2)",
            )
            .bind(batch.batch_id)
            .bind(trade_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE trades
            SET settlement_status = 'settling', settlement_id = $1
            WHERE trade_id = ANY($2)
            "#,
        )
        .bind(batch.batch_id)
        .bind(&batch.trade_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<SettlementBatch>, StoreError> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT batch_id, status, ledger_tx_id, created_at, processed_at,
                   retry_count, last_error
            FROM settlement_batches
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let trade_ids = self.trade_ids_for(batch_id).await?;
                Ok(Some(row.into_batch(trade_ids)))
            }
            None => Ok(None),
        }
    }

    async fn update_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE settlement_batches SET status = $1 WHERE batch_id = $2")
            .bind(status)
            .bind(batch_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_batch_completed(
        &self,
        batch_id: Uuid,
        ledger_tx_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE settlement_batches
            SET status = 'completed', ledger_tx_id = $1, processed_at = NOW()
            WHERE batch_id = $2
            "#,
        )
        .bind(ledger_tx_id)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_batch_failure(
        &self,
        batch_id: Uuid,
        retry_count: i32,
        last_error: &str,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE settlement_batches
            SET retry_count = $1, last_error = $2, status = $3,
                processed_at = CASE WHEN $3 IN ('completed', 'failed') THEN NOW()
                                    ELSE processed_at END
            WHERE batch_id = $4
            "#,
        )
        .bind(retry_count)
        .bind(last_error)
        .bind(status)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_batches_by_status(
        &self,
        statuses: &[BatchStatus],
    ) -> Result<Vec<SettlementBatch>, StoreError> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT batch_id, status, ledger_tx_id, created_at, processed_at,
                   retry_count, last_error
            FROM settlement_batches
            WHERE status = ANY($1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(statuses)
        .fetch_all(&self.pool)
        .await?;

        let mut batches = Vec::with_capacity(rows.len());
        for row in rows {
            let trade_ids = self.trade_ids_for(row.batch_id).await?;
            batches.push(row.into_batch(trade_ids));
        }

        Ok(batches)
    }

    async fn delete_batch(&self, batch_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM settlement_batches WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_event(&self, event: &SettlementEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settlement_events (
                id, contract_id, settlement_id, transaction_id, status, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(&event.contract_id)
        .bind(event.settlement_id)
        .bind(&event.transaction_id)
        .bind(&event.status)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
