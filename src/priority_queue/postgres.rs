use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

use crate::backends::postgres::{connect, execute_all, is_unique_violation, table_name};
use crate::config::PostgresOptions;
use crate::error::{StoreError, StoreResult};
use crate::utils::new_id;
use super::{ensure_discriminator, lease_duration, LeaseMetadata, LeasedItem, PriorityQueueStore};

// ============================================================================
// PostgreSQL Priority Queue Store
// ============================================================================
//
// One row per queued item. A partial unique index on `discriminator` over
// leased rows is the "one live lease per discriminator" guarantee; a lease
// attempt that collides with another worker's fresh lease fails on that
// index and is retried.
//
// ============================================================================

/// Attempts for `lock_next` when racing workers collide on the lease index
const LEASE_ATTEMPTS: u32 = 3;

pub struct PostgresPriorityQueueStore<T> {
    pool: PgPool,
    table: String,
    expiration_time: Duration,
    _item: PhantomData<fn() -> T>,
}

impl<T> PostgresPriorityQueueStore<T> {
    pub async fn connect(options: &PostgresOptions, expiration_time: Duration) -> StoreResult<Self> {
        let pool = connect(options).await?;
        Self::with_pool(pool, options, expiration_time)
    }

    pub fn with_pool(
        pool: PgPool,
        options: &PostgresOptions,
        expiration_time: Duration,
    ) -> StoreResult<Self> {
        Ok(Self {
            pool,
            table: table_name(options, "priority_queue")?,
            expiration_time,
            _item: PhantomData,
        })
    }

    async fn release_expired_leases(&self) -> StoreResult<()> {
        let released = sqlx::query(&format!(
            "UPDATE {} SET lock_token = NULL, lock_expires_at = NULL
             WHERE lock_token IS NOT NULL AND lock_expires_at <= $1",
            self.table
        ))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released > 0 {
            tracing::warn!(released = released, "Released expired queue leases");
        }
        Ok(())
    }

    /// Explain a conditional statement that matched no row.
    async fn lease_error(&self, discriminator: &str) -> StoreResult<StoreError> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE discriminator = $1)",
            self.table
        ))
        .bind(discriminator)
        .fetch_one(&self.pool)
        .await?;

        Ok(if exists {
            StoreError::TokenMismatch(discriminator.to_string())
        } else {
            StoreError::ItemNotFound(discriminator.to_string())
        })
    }

    async fn try_lock_next(
        &self,
        lease_for: chrono::Duration,
    ) -> Result<Option<(Uuid, String, Json<serde_json::Value>)>, sqlx::Error> {
        let now = Utc::now();

        let mut transaction = self.pool.begin().await?;

        // Only the head of a discriminator with no lease is eligible. Heads
        // locked by a concurrent transaction are skipped.
        let candidate: Option<(Uuid, String, Json<serde_json::Value>)> = sqlx::query_as(&format!(
            "SELECT q.id, q.discriminator, q.item FROM {table} q
             WHERE q.lock_token IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM {table} l
                   WHERE l.discriminator = q.discriminator AND l.lock_token IS NOT NULL
               )
               AND NOT EXISTS (
                   SELECT 1 FROM {table} e
                   WHERE e.discriminator = q.discriminator
                     AND (e.priority, e.position) < (q.priority, q.position)
               )
             ORDER BY q.priority ASC, q.position ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
            table = self.table
        ))
        .fetch_optional(&mut *transaction)
        .await?;

        let Some((id, discriminator, item)) = candidate else {
            transaction.rollback().await?;
            return Ok(None);
        };

        let token = new_id();
        sqlx::query(&format!(
            "UPDATE {} SET lock_token = $2, lock_expires_at = $3 WHERE id = $1",
            self.table
        ))
        .bind(id)
        .bind(token)
        .bind(now + lease_for)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;

        Ok(Some((token, discriminator, item)))
    }
}

/// Run a lease attempt until it succeeds or stops colliding. Once the
/// attempts are used up, report nothing to lease for this round.
async fn retry_on_collision<R, E, F, Fut>(
    attempts: u32,
    is_collision: impl Fn(&E) -> bool,
    mut attempt_lease: F,
) -> Result<Option<R>, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<R>, E>>,
{
    for attempt in 1..=attempts {
        match attempt_lease().await {
            Err(error) if is_collision(&error) => {
                tracing::debug!(attempt = attempt, "Lease collided with a concurrent worker");
            }
            outcome => return outcome,
        }
    }

    tracing::warn!(
        attempts = attempts,
        "Every lease attempt collided with a concurrent worker, giving up this round"
    );
    Ok(None)
}

#[async_trait]
impl<T> PriorityQueueStore<T> for PostgresPriorityQueueStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn enqueue(&self, item: T, discriminator: &str, priority: i64) -> StoreResult<()> {
        ensure_discriminator(discriminator)?;

        sqlx::query(&format!(
            "INSERT INTO {} (id, discriminator, priority, item) VALUES ($1, $2, $3, $4)",
            self.table
        ))
        .bind(new_id())
        .bind(discriminator)
        .bind(priority)
        .bind(Json(&item))
        .execute(&self.pool)
        .await?;

        tracing::debug!(discriminator = %discriminator, priority = priority, "Enqueued item");
        Ok(())
    }

    async fn lock_next(&self) -> StoreResult<Option<LeasedItem<T>>> {
        let lease_for = lease_duration(self.expiration_time)?;
        self.release_expired_leases().await?;

        let leased = retry_on_collision(LEASE_ATTEMPTS, is_unique_violation, || {
            self.try_lock_next(lease_for)
        })
        .await?;

        let Some((token, discriminator, Json(item))) = leased else {
            return Ok(None);
        };

        tracing::debug!(discriminator = %discriminator, token = %token, "Leased item");
        Ok(Some(LeasedItem {
            item: serde_json::from_value(item)?,
            metadata: LeaseMetadata {
                discriminator,
                token,
            },
        }))
    }

    async fn renew_lock(&self, discriminator: &str, token: Uuid) -> StoreResult<()> {
        let lease_for = lease_duration(self.expiration_time)?;
        let now = Utc::now();

        let renewed = sqlx::query(&format!(
            "UPDATE {} SET lock_expires_at = $3
             WHERE discriminator = $1 AND lock_token = $2 AND lock_expires_at > $4",
            self.table
        ))
        .bind(discriminator)
        .bind(token)
        .bind(now + lease_for)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if renewed == 0 {
            return Err(self.lease_error(discriminator).await?);
        }
        Ok(())
    }

    async fn acknowledge(&self, discriminator: &str, token: Uuid) -> StoreResult<()> {
        let removed = sqlx::query(&format!(
            "DELETE FROM {}
             WHERE discriminator = $1 AND lock_token = $2 AND lock_expires_at > $3",
            self.table
        ))
        .bind(discriminator)
        .bind(token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if removed == 0 {
            return Err(self.lease_error(discriminator).await?);
        }

        tracing::debug!(discriminator = %discriminator, "Acknowledged item");
        Ok(())
    }

    async fn defer(&self, discriminator: &str, token: Uuid, priority: i64) -> StoreResult<()> {
        let deferred = sqlx::query(&format!(
            "UPDATE {} SET priority = $3, lock_token = NULL, lock_expires_at = NULL
             WHERE discriminator = $1 AND lock_token = $2 AND lock_expires_at > $4",
            self.table
        ))
        .bind(discriminator)
        .bind(token)
        .bind(priority)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deferred == 0 {
            return Err(self.lease_error(discriminator).await?);
        }

        tracing::debug!(discriminator = %discriminator, priority = priority, "Deferred item");
        Ok(())
    }

    async fn setup(&self) -> StoreResult<()> {
        let table = &self.table;

        execute_all(
            &self.pool,
            &[
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        id UUID NOT NULL PRIMARY KEY,
                        position BIGSERIAL NOT NULL,
                        discriminator TEXT NOT NULL,
                        priority BIGINT NOT NULL,
                        item JSONB NOT NULL,
                        lock_token UUID NULL,
                        lock_expires_at TIMESTAMPTZ NULL
                    )"
                ),
                format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {table}_one_lease ON {table} (discriminator) \
                     WHERE lock_token IS NOT NULL"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {table}_order ON {table} (discriminator, priority, position)"
                ),
                format!("CREATE INDEX IF NOT EXISTS {table}_global_order ON {table} (priority, position)"),
            ],
        )
        .await?;

        tracing::info!(table = %table, "Priority queue store set up");
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
