use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::utils::LockKey;
use super::{ensure_in_future, LockStore};

#[derive(Default, Clone)]
pub struct InMemoryLockStore {
    locks: Arc<Mutex<HashMap<LockKey, DateTime<Utc>>>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sweep_expired(locks: &mut HashMap<LockKey, DateTime<Utc>>, now: DateTime<Utc>) {
    locks.retain(|_, expires_at| *expires_at > now);
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire_lock(&self, key: &LockKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let now = Utc::now();
        ensure_in_future(expires_at, now)?;

        let mut locks = self.locks.lock().await;
        sweep_expired(&mut locks, now);

        if locks.contains_key(key) {
            tracing::debug!(lock = %key, "Lock is held by someone else");
            return Err(StoreError::LockAcquireFailed);
        }

        locks.insert(key.clone(), expires_at);
        tracing::debug!(lock = %key, expires_at = %expires_at, "Lock acquired");
        Ok(())
    }

    async fn is_locked(&self, key: &LockKey) -> StoreResult<bool> {
        let locks = self.locks.lock().await;
        let now = Utc::now();

        Ok(locks.get(key).is_some_and(|expires_at| *expires_at > now))
    }

    async fn renew_lock(&self, key: &LockKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let now = Utc::now();
        ensure_in_future(expires_at, now)?;

        let mut locks = self.locks.lock().await;

        match locks.get_mut(key) {
            Some(current) if *current > now => {
                *current = expires_at;
                Ok(())
            }
            _ => {
                tracing::warn!(lock = %key, "Lock renewal failed, lock is gone");
                Err(StoreError::LockRenewalFailed)
            }
        }
    }

    async fn release_lock(&self, key: &LockKey) -> StoreResult<()> {
        let mut locks = self.locks.lock().await;
        locks.remove(key);
        Ok(())
    }

    async fn setup(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.locks.lock().await.clear();
        Ok(())
    }
}
