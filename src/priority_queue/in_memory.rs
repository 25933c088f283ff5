use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::utils::new_id;
use super::{ensure_discriminator, lease_duration, LeaseMetadata, LeasedItem, PriorityQueueStore};

// ============================================================================
// In-Memory Priority Queue Store
// ============================================================================

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone)]
struct QueuedItem<T> {
    sequence: u64,
    priority: i64,
    item: T,
    lease: Option<Lease>,
}

impl<T> QueuedItem<T> {
    fn order_key(&self) -> (i64, u64) {
        (self.priority, self.sequence)
    }
}

struct Queues<T> {
    by_discriminator: HashMap<String, Vec<QueuedItem<T>>>,
    next_sequence: u64,
}

impl<T> Default for Queues<T> {
    fn default() -> Self {
        Self {
            by_discriminator: HashMap::new(),
            next_sequence: 0,
        }
    }
}

impl<T> Queues<T> {
    /// Index of the item holding the live lease `token`, or the error that
    /// explains why there is none.
    fn leased_position(
        &self,
        discriminator: &str,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let items = match self.by_discriminator.get(discriminator) {
            Some(items) if !items.is_empty() => items,
            _ => return Err(StoreError::ItemNotFound(discriminator.to_string())),
        };

        items
            .iter()
            .position(|queued| {
                queued
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.token == token && lease.is_live(now))
            })
            .ok_or_else(|| StoreError::TokenMismatch(discriminator.to_string()))
    }
}

pub struct InMemoryPriorityQueueStore<T> {
    queues: Arc<Mutex<Queues<T>>>,
    expiration_time: Duration,
}

impl<T> InMemoryPriorityQueueStore<T> {
    pub fn new(expiration_time: Duration) -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues::default())),
            expiration_time,
        }
    }
}

impl<T> Clone for InMemoryPriorityQueueStore<T> {
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
            expiration_time: self.expiration_time,
        }
    }
}

#[async_trait]
impl<T> PriorityQueueStore<T> for InMemoryPriorityQueueStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn enqueue(&self, item: T, discriminator: &str, priority: i64) -> StoreResult<()> {
        ensure_discriminator(discriminator)?;

        let mut queues = self.queues.lock().await;
        let sequence = queues.next_sequence;
        queues.next_sequence += 1;

        queues
            .by_discriminator
            .entry(discriminator.to_string())
            .or_default()
            .push(QueuedItem {
                sequence,
                priority,
                item,
                lease: None,
            });

        tracing::debug!(discriminator = %discriminator, priority = priority, "Enqueued item");
        Ok(())
    }

    async fn lock_next(&self) -> StoreResult<Option<LeasedItem<T>>> {
        let lease_for = lease_duration(self.expiration_time)?;
        let now = Utc::now();
        let mut queues = self.queues.lock().await;

        // Head of every discriminator that is free to lease.
        let candidate = queues
            .by_discriminator
            .iter()
            .filter(|(_, items)| {
                !items
                    .iter()
                    .any(|queued| queued.lease.as_ref().is_some_and(|lease| lease.is_live(now)))
            })
            .filter_map(|(discriminator, items)| {
                items
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, queued)| queued.order_key())
                    .map(|(position, queued)| (queued.order_key(), discriminator.clone(), position))
            })
            .min_by_key(|(order_key, _, _)| *order_key);

        let Some((_, discriminator, position)) = candidate else {
            return Ok(None);
        };

        let Some(items) = queues.by_discriminator.get_mut(&discriminator) else {
            return Ok(None);
        };

        for queued in items.iter_mut() {
            queued.lease = None;
        }

        let token = new_id();
        let queued = &mut items[position];
        queued.lease = Some(Lease {
            token,
            expires_at: now + lease_for,
        });

        tracing::debug!(discriminator = %discriminator, token = %token, "Leased item");

        Ok(Some(LeasedItem {
            item: queued.item.clone(),
            metadata: LeaseMetadata {
                discriminator,
                token,
            },
        }))
    }

    async fn renew_lock(&self, discriminator: &str, token: Uuid) -> StoreResult<()> {
        let lease_for = lease_duration(self.expiration_time)?;
        let now = Utc::now();
        let mut queues = self.queues.lock().await;

        let position = queues.leased_position(discriminator, token, now)?;
        if let Some(lease) = queues
            .by_discriminator
            .get_mut(discriminator)
            .and_then(|items| items[position].lease.as_mut())
        {
            lease.expires_at = now + lease_for;
        }

        Ok(())
    }

    async fn acknowledge(&self, discriminator: &str, token: Uuid) -> StoreResult<()> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;

        let position = queues.leased_position(discriminator, token, now)?;
        if let Some(items) = queues.by_discriminator.get_mut(discriminator) {
            items.remove(position);
            if items.is_empty() {
                queues.by_discriminator.remove(discriminator);
            }
        }

        tracing::debug!(discriminator = %discriminator, "Acknowledged item");
        Ok(())
    }

    async fn defer(&self, discriminator: &str, token: Uuid, priority: i64) -> StoreResult<()> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;

        let position = queues.leased_position(discriminator, token, now)?;
        if let Some(items) = queues.by_discriminator.get_mut(discriminator) {
            let queued = &mut items[position];
            queued.priority = priority;
            queued.lease = None;
        }

        tracing::debug!(discriminator = %discriminator, priority = priority, "Deferred item");
        Ok(())
    }

    async fn setup(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        let mut queues = self.queues.lock().await;
        *queues = Queues::default();
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
