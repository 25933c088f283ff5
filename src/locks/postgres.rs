use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::backends::postgres::{connect, execute_all, table_name};
use crate::config::PostgresOptions;
use crate::error::{StoreError, StoreResult};
use crate::utils::LockKey;
use super::{ensure_in_future, LockStore};

// ============================================================================
// PostgreSQL Lock Store
// ============================================================================
//
// One row per live lock, primary key on the hashed value. Acquisition is a
// single upsert that only overwrites an expired row, so racing callers are
// serialised by the primary key and exactly one sees an affected row.
//
// ============================================================================

pub struct PostgresLockStore {
    pool: PgPool,
    table: String,
}

impl PostgresLockStore {
    pub async fn connect(options: &PostgresOptions) -> StoreResult<Self> {
        let pool = connect(options).await?;
        Self::with_pool(pool, options)
    }

    pub fn with_pool(pool: PgPool, options: &PostgresOptions) -> StoreResult<Self> {
        Ok(Self {
            pool,
            table: table_name(options, "locks")?,
        })
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE expires_at <= $1", self.table))
            .bind(now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::debug!(swept = result.rows_affected(), "Swept expired locks");
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    async fn acquire_lock(&self, key: &LockKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let now = Utc::now();
        ensure_in_future(expires_at, now)?;

        self.sweep_expired(now).await?;

        let result = sqlx::query(&format!(
            "INSERT INTO {table} (lock_key, expires_at) VALUES ($1, $2)
             ON CONFLICT (lock_key) DO UPDATE SET expires_at = EXCLUDED.expires_at
             WHERE {table}.expires_at <= $3",
            table = self.table
        ))
        .bind(key.as_str())
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(lock = %key, "Lock is held by someone else");
            return Err(StoreError::LockAcquireFailed);
        }

        tracing::debug!(lock = %key, expires_at = %expires_at, "Lock acquired");
        Ok(())
    }

    async fn is_locked(&self, key: &LockKey) -> StoreResult<bool> {
        let locked: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE lock_key = $1 AND expires_at > $2)",
            self.table
        ))
        .bind(key.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(locked)
    }

    async fn renew_lock(&self, key: &LockKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let now = Utc::now();
        ensure_in_future(expires_at, now)?;

        let result = sqlx::query(&format!(
            "UPDATE {} SET expires_at = $2 WHERE lock_key = $1 AND expires_at > $3",
            self.table
        ))
        .bind(key.as_str())
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(lock = %key, "Lock renewal failed, lock is gone");
            return Err(StoreError::LockRenewalFailed);
        }
        Ok(())
    }

    async fn release_lock(&self, key: &LockKey) -> StoreResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE lock_key = $1", self.table))
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn setup(&self) -> StoreResult<()> {
        execute_all(
            &self.pool,
            &[
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        lock_key TEXT NOT NULL PRIMARY KEY,
                        expires_at TIMESTAMPTZ NOT NULL
                    )",
                    self.table
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {table}_expires_at ON {table} (expires_at)",
                    table = self.table
                ),
            ],
        )
        .await?;

        tracing::info!(table = %self.table, "Lock store set up");
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
