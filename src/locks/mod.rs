// ============================================================================
// Lock Store
// ============================================================================
//
// Generic distributed mutex keyed by the hash of an arbitrary value, with a
// deadline instead of an owner. At most one live lock per key; expired locks
// count as absent everywhere and are swept opportunistically.
//
// ============================================================================

mod in_memory;
mod postgres;
mod redis;

pub use in_memory::InMemoryLockStore;
pub use postgres::PostgresLockStore;
pub use redis::RedisLockStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::utils::LockKey;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create the lock. Exactly one of several racing callers wins; the rest
    /// get `LockAcquireFailed`.
    async fn acquire_lock(&self, key: &LockKey, expires_at: DateTime<Utc>) -> StoreResult<()>;

    async fn is_locked(&self, key: &LockKey) -> StoreResult<bool>;

    /// Move the deadline of a live lock. An expired lock is not revived.
    async fn renew_lock(&self, key: &LockKey, expires_at: DateTime<Utc>) -> StoreResult<()>;

    /// No-op if the lock does not exist or already expired.
    async fn release_lock(&self, key: &LockKey) -> StoreResult<()>;

    async fn setup(&self) -> StoreResult<()>;

    async fn destroy(&self) -> StoreResult<()>;
}

pub(crate) fn ensure_in_future(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<()> {
    if expires_at <= now {
        return Err(StoreError::ExpirationInPast);
    }
    Ok(())
}
