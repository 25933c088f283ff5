use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;

use crate::backends::redis::{connect, key};
use crate::config::RedisOptions;
use crate::error::{StoreError, StoreResult};
use crate::utils::LockKey;
use super::{ensure_in_future, LockStore};

// ============================================================================
// Redis Lock Store
// ============================================================================
//
// `SET NX PX` creates a lock atomically, `SET XX PX` renews one. Redis drops
// expired keys on its own, so an expired lock can neither be renewed nor
// block a new acquisition.
//
// ============================================================================

pub struct RedisLockStore {
    connection: RwLock<Option<MultiplexedConnection>>,
    options: RedisOptions,
}

impl RedisLockStore {
    pub async fn connect(options: &RedisOptions) -> StoreResult<Self> {
        let connection = connect(options).await?;
        Ok(Self {
            connection: RwLock::new(Some(connection)),
            options: options.clone(),
        })
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| StoreError::Unknown(anyhow::anyhow!("redis lock store was destroyed")))
    }

    fn lock_key(&self, lock: &LockKey) -> StoreResult<String> {
        key(&self.options, "lock", lock.as_str())
    }
}

/// Time to live in ms, rejecting deadlines that are not in the future.
fn ttl_millis(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<i64> {
    ensure_in_future(expires_at, now)?;
    Ok((expires_at - now).num_milliseconds().max(1))
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn acquire_lock(&self, lock: &LockKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let ttl = ttl_millis(expires_at, Utc::now())?;
        let mut connection = self.connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(lock)?)
            .arg(expires_at.timestamp_millis())
            .arg("NX")
            .arg("PX")
            .arg(ttl)
            .query_async(&mut connection)
            .await?;

        if reply.is_none() {
            tracing::debug!(lock = %lock, "Lock is held by someone else");
            return Err(StoreError::LockAcquireFailed);
        }

        tracing::debug!(lock = %lock, ttl_ms = ttl, "Lock acquired");
        Ok(())
    }

    async fn is_locked(&self, lock: &LockKey) -> StoreResult<bool> {
        let mut connection = self.connection().await?;

        let exists: bool = redis::cmd("EXISTS")
            .arg(self.lock_key(lock)?)
            .query_async(&mut connection)
            .await?;

        Ok(exists)
    }

    async fn renew_lock(&self, lock: &LockKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let ttl = ttl_millis(expires_at, Utc::now())?;
        let mut connection = self.connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(lock)?)
            .arg(expires_at.timestamp_millis())
            .arg("XX")
            .arg("PX")
            .arg(ttl)
            .query_async(&mut connection)
            .await?;

        if reply.is_none() {
            tracing::warn!(lock = %lock, "Lock renewal failed, lock is gone");
            return Err(StoreError::LockRenewalFailed);
        }
        Ok(())
    }

    async fn release_lock(&self, lock: &LockKey) -> StoreResult<()> {
        let mut connection = self.connection().await?;

        let _: i64 = redis::cmd("DEL")
            .arg(self.lock_key(lock)?)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn setup(&self) -> StoreResult<()> {
        let mut connection = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.connection.write().await.take();
        tracing::info!("Redis lock store connection released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ttl_in_millis() {
        let now = Utc::now();
        assert_eq!(ttl_millis(now + Duration::milliseconds(1_500), now).unwrap(), 1_500);
    }

    #[test]
    fn test_ttl_rejects_past_deadline() {
        let now = Utc::now();
        assert!(matches!(
            ttl_millis(now - Duration::milliseconds(1), now),
            Err(StoreError::ExpirationInPast)
        ));
    }
}
