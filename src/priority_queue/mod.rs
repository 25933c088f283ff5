// ============================================================================
// Priority Queue Store
// ============================================================================
//
// Work queue partitioned by discriminator (typically an aggregate id).
//
// Guarantees:
// 1. At most one live lease per discriminator
// 2. `lock_next` picks the smallest (priority, insertion) head among
//    discriminators without a live lease
// 3. An expired lease makes its item leasable again under a new token
// 4. renew / acknowledge / defer only succeed for the current lease token
//
// ============================================================================

mod in_memory;
mod postgres;

pub use in_memory::InMemoryPriorityQueueStore;
pub use postgres::PostgresPriorityQueueStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Proof of ownership handed out by `lock_next`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseMetadata {
    pub discriminator: String,
    pub token: Uuid,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeasedItem<T> {
    pub item: T,
    pub metadata: LeaseMetadata,
}

#[async_trait]
pub trait PriorityQueueStore<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Lower priority values are handed out first.
    async fn enqueue(&self, item: T, discriminator: &str, priority: i64) -> StoreResult<()>;

    /// `None` when nothing is eligible right now.
    async fn lock_next(&self) -> StoreResult<Option<LeasedItem<T>>>;

    async fn renew_lock(&self, discriminator: &str, token: Uuid) -> StoreResult<()>;

    /// Remove the leased item for good.
    async fn acknowledge(&self, discriminator: &str, token: Uuid) -> StoreResult<()>;

    /// Give the lease back and keep the item under a new priority.
    async fn defer(&self, discriminator: &str, token: Uuid, priority: i64) -> StoreResult<()>;

    async fn setup(&self) -> StoreResult<()>;

    async fn destroy(&self) -> StoreResult<()>;
}

pub(crate) fn ensure_discriminator(discriminator: &str) -> StoreResult<()> {
    if discriminator.is_empty() {
        return Err(StoreError::parameter("discriminator must not be empty"));
    }
    Ok(())
}

pub(crate) fn lease_duration(expiration_time: std::time::Duration) -> StoreResult<chrono::Duration> {
    let duration = chrono::Duration::from_std(expiration_time)
        .map_err(|e| StoreError::parameter(format!("invalid expiration time: {e}")))?;

    if duration <= chrono::Duration::zero() {
        return Err(StoreError::ExpirationInPast);
    }
    Ok(duration)
}
