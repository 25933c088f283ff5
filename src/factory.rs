use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BackendOptions;
use crate::consumer_progress::{
    ConsumerProgressStore, InMemoryConsumerProgressStore, PostgresConsumerProgressStore,
};
use crate::error::{StoreError, StoreResult};
use crate::event_sourcing::{
    DomainEventStore, InMemoryDomainEventStore, PostgresDomainEventStore, ScyllaDomainEventStore,
};
use crate::locks::{InMemoryLockStore, LockStore, PostgresLockStore, RedisLockStore};
use crate::notifications::{InMemoryNotifier, Notifier, PostgresNotifier};
use crate::priority_queue::{
    InMemoryPriorityQueueStore, PostgresPriorityQueueStore, PriorityQueueStore,
};

// ============================================================================
// Store Factory
// ============================================================================
//
// Resolves a `BackendOptions` into a ready store behind its trait object.
// Backend support per store:
//
//   events         in-memory | postgres | scylla
//   locks          in-memory | postgres | redis
//   queue          in-memory | postgres
//   progress       in-memory | postgres
//   notifications  in-memory | postgres
//
// Anything else is `DatabaseTypeInvalid`. Schema creation stays with the
// caller (`setup()`).
// ============================================================================

fn unsupported(store: &str, options: &BackendOptions) -> StoreError {
    StoreError::DatabaseTypeInvalid(format!(
        "{} is not available for the {store}",
        options.kind()
    ))
}

pub async fn create_event_store(options: &BackendOptions) -> StoreResult<Arc<dyn DomainEventStore>> {
    let store: Arc<dyn DomainEventStore> = match options {
        BackendOptions::InMemory => Arc::new(InMemoryDomainEventStore::new()),
        BackendOptions::Postgres(postgres) => Arc::new(PostgresDomainEventStore::connect(postgres).await?),
        BackendOptions::Scylla(scylla) => Arc::new(ScyllaDomainEventStore::connect(scylla).await?),
        other => return Err(unsupported("domain event store", other)),
    };

    tracing::info!(backend = options.kind(), "Domain event store created");
    Ok(store)
}

pub async fn create_lock_store(options: &BackendOptions) -> StoreResult<Arc<dyn LockStore>> {
    let store: Arc<dyn LockStore> = match options {
        BackendOptions::InMemory => Arc::new(InMemoryLockStore::new()),
        BackendOptions::Postgres(postgres) => Arc::new(PostgresLockStore::connect(postgres).await?),
        BackendOptions::Redis(redis) => Arc::new(RedisLockStore::connect(redis).await?),
        other => return Err(unsupported("lock store", other)),
    };

    tracing::info!(backend = options.kind(), "Lock store created");
    Ok(store)
}

pub async fn create_priority_queue_store<T>(
    options: &BackendOptions,
    expiration_time: Duration,
) -> StoreResult<Arc<dyn PriorityQueueStore<T>>>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let store: Arc<dyn PriorityQueueStore<T>> = match options {
        BackendOptions::InMemory => Arc::new(InMemoryPriorityQueueStore::new(expiration_time)),
        BackendOptions::Postgres(postgres) => {
            Arc::new(PostgresPriorityQueueStore::connect(postgres, expiration_time).await?)
        }
        other => return Err(unsupported("priority queue store", other)),
    };

    tracing::info!(backend = options.kind(), "Priority queue store created");
    Ok(store)
}

pub async fn create_consumer_progress_store(
    options: &BackendOptions,
) -> StoreResult<Arc<dyn ConsumerProgressStore>> {
    let store: Arc<dyn ConsumerProgressStore> = match options {
        BackendOptions::InMemory => Arc::new(InMemoryConsumerProgressStore::new()),
        BackendOptions::Postgres(postgres) => {
            Arc::new(PostgresConsumerProgressStore::connect(postgres).await?)
        }
        other => return Err(unsupported("consumer progress store", other)),
    };

    tracing::info!(backend = options.kind(), "Consumer progress store created");
    Ok(store)
}

pub async fn create_notifier(options: &BackendOptions) -> StoreResult<Arc<dyn Notifier>> {
    let notifier: Arc<dyn Notifier> = match options {
        BackendOptions::InMemory => Arc::new(InMemoryNotifier::new()),
        BackendOptions::Postgres(postgres) => Arc::new(PostgresNotifier::connect(postgres).await?),
        other => return Err(unsupported("notifier", other)),
    };

    tracing::info!(backend = options.kind(), "Notifier created");
    Ok(notifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RedisOptions, ScyllaOptions};

    #[tokio::test]
    async fn test_in_memory_everywhere() {
        let options = BackendOptions::InMemory;

        assert!(create_event_store(&options).await.is_ok());
        assert!(create_lock_store(&options).await.is_ok());
        assert!(create_priority_queue_store::<String>(&options, Duration::from_secs(1))
            .await
            .is_ok());
        assert!(create_consumer_progress_store(&options).await.is_ok());
        assert!(create_notifier(&options).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsupported_combinations_fail_fast() {
        let redis = BackendOptions::Redis(RedisOptions::default());
        let scylla = BackendOptions::Scylla(ScyllaOptions::default());

        assert!(matches!(
            create_event_store(&redis).await,
            Err(StoreError::DatabaseTypeInvalid(_))
        ));
        assert!(matches!(
            create_lock_store(&scylla).await,
            Err(StoreError::DatabaseTypeInvalid(_))
        ));
        assert!(matches!(
            create_priority_queue_store::<String>(&redis, Duration::from_secs(1)).await,
            Err(StoreError::DatabaseTypeInvalid(_))
        ));
        assert!(matches!(
            create_consumer_progress_store(&scylla).await,
            Err(StoreError::DatabaseTypeInvalid(_))
        ));
        assert!(matches!(
            create_notifier(&redis).await,
            Err(StoreError::DatabaseTypeInvalid(msg)) if msg.contains("redis")
        ));
    }
}
