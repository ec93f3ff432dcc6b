use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::models::Account;
use crate::store::{AccountStore, StoreError};

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn get(&self, user_id: &str) -> Result<Option<Account>, StoreError> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT user_id, party_id, account_contract_id, available_balance,
                   locked_balance, last_updated
            FROM accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                user_id, party_id, account_contract_id, available_balance,
                locked_balance, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                party_id = $2,
                account_contract_id = $3,
                available_balance = $4,
                locked_balance = $5,
                last_updated = NOW()
            "#,
        )
        .bind(&account.user_id)
        .bind(&account.party_id)
        .bind(&account.account_contract_id)
        .bind(account.available_balance)
        .bind(account.locked_balance)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_contract_id(&self, user_id: &str, contract_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET account_contract_id = $1, last_updated = NOW()
            WHERE user_id = $2
            "#,
        )
        .bind(contract_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn adjust_balances(
        &self,
        user_id: &str,
        available_delta: Decimal,
        locked_delta: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET available_balance = available_balance + $1,
                locked_balance = locked_balance + $2,
                last_updated = NOW()
            WHERE user_id = $3
            "#,
        )
        .bind(available_delta)
        .bind(locked_delta)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn overwrite_balances(
        &self,
        user_id: &str,
        available: Decimal,
        locked: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET available_balance = $1, locked_balance = $2, last_updated = NOW()
            WHERE user_id = $3
            "#,
        )
        .bind(available)
        .bind(locked)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_stale(&self, updated_before: DateTime<Utc>) -> Result<Vec<Account>, StoreError> {
        let accounts = sqlx::query_as::<_, Account>(
            r#"
            SELECT user_id, party_id, account_contract_id, available_balance,
                   locked_balance, last_updated
            FROM accounts
            WHERE last_updated < $1
            ORDER BY last_updated ASC
            "#,
        )
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn touch(&self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET last_updated = NOW() WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
