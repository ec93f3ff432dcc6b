use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::{CompensationFailure, ReconciliationRecord};
use crate::store::{AuditStore, StoreError};

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn record_reconciliation(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_history (
                id, user_id, local_available, local_locked, onchain_available,
                onchain_locked, drift, reconciled, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(record.local_available)
        .bind(record.local_locked)
        .bind(record.onchain_available)
        .bind(record.onchain_locked)
        .bind(record.drift)
        .bind(record.reconciled)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_compensation_failure(
        &self,
        failure: &CompensationFailure,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO compensation_failures (
                id, order_id, user_id, amount, account_cid, error, timestamp,
                resolved, resolved_at, resolved_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(failure.id)
        .bind(failure.order_id)
        .bind(&failure.user_id)
        .bind(failure.amount)
        .bind(&failure.account_cid)
        .bind(&failure.error)
        .bind(failure.timestamp)
        .bind(failure.resolved)
        .bind(failure.resolved_at)
        .bind(&failure.resolved_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
