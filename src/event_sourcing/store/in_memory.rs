use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::event_sourcing::core::{AggregateIdentifier, DomainEvent, Snapshot};
use super::event_store::{
    ensure_contiguous, validate_batch, AggregateIdentifierStream, DomainEventStore,
    DomainEventStream, RevisionRange,
};

// ============================================================================
// In-Memory Domain Event Store
// ============================================================================
//
// Reference backend. Events are kept in arrival order and looked up by
// linear scan; the write lock is held across validate + append, which makes
// every batch atomic.
//
// ============================================================================

#[derive(Default)]
struct Database {
    domain_events: Vec<DomainEvent>,
    snapshots: Vec<Snapshot>,
}

impl Database {
    fn current_revision(&self, aggregate_id: Uuid) -> i64 {
        self.domain_events
            .iter()
            .filter(|event| event.aggregate_id() == aggregate_id)
            .map(DomainEvent::revision)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryDomainEventStore {
    database: Arc<RwLock<Database>>,
}

impl InMemoryDomainEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collect_matching<F>(&self, predicate: F) -> Vec<DomainEvent>
    where
        F: Fn(&DomainEvent) -> bool,
    {
        let database = self.database.read().await;
        database
            .domain_events
            .iter()
            .filter(|event| predicate(*event))
            .cloned()
            .collect()
    }
}

fn into_stream(domain_events: Vec<DomainEvent>) -> DomainEventStream {
    stream::iter(domain_events.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl DomainEventStore for InMemoryDomainEventStore {
    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Option<DomainEvent>> {
        let database = self.database.read().await;

        Ok(database
            .domain_events
            .iter()
            .filter(|event| event.aggregate_id() == aggregate_identifier.id())
            .max_by_key(|event| event.revision())
            .cloned())
    }

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> StoreResult<DomainEventStream> {
        let matching = self
            .collect_matching(|event| event.metadata.causation_id == causation_id)
            .await;
        Ok(into_stream(matching))
    }

    async fn has_domain_events_with_causation_id(&self, causation_id: Uuid) -> StoreResult<bool> {
        let database = self.database.read().await;
        Ok(database
            .domain_events
            .iter()
            .any(|event| event.metadata.causation_id == causation_id))
    }

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> StoreResult<DomainEventStream> {
        let matching = self
            .collect_matching(|event| event.metadata.correlation_id == correlation_id)
            .await;
        Ok(into_stream(matching))
    }

    async fn get_replay(
        &self,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> StoreResult<DomainEventStream> {
        let matching = self
            .collect_matching(|event| {
                from_timestamp.map_or(true, |from| event.metadata.timestamp >= from)
            })
            .await;

        tracing::debug!(event_count = matching.len(), "Replaying domain events");
        Ok(into_stream(matching))
    }

    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: Uuid,
        from_revision: Option<i64>,
        to_revision: Option<i64>,
    ) -> StoreResult<DomainEventStream> {
        let range = RevisionRange::resolve(from_revision, to_revision)?;

        let mut matching = self
            .collect_matching(|event| {
                event.aggregate_id() == aggregate_id && range.contains(event.revision())
            })
            .await;
        matching.sort_by_key(DomainEvent::revision);

        tracing::debug!(
            aggregate_id = %aggregate_id,
            from_revision = range.from,
            to_revision = range.to,
            event_count = matching.len(),
            "Replaying aggregate"
        );

        Ok(ensure_contiguous(into_stream(matching), range))
    }

    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Option<Snapshot>> {
        let database = self.database.read().await;

        Ok(database
            .snapshots
            .iter()
            .filter(|snapshot| snapshot.aggregate_identifier.id() == aggregate_identifier.id())
            .max_by_key(|snapshot| snapshot.revision)
            .cloned())
    }

    async fn store_domain_events(&self, domain_events: Vec<DomainEvent>) -> StoreResult<()> {
        let mut database = self.database.write().await;

        validate_batch(&domain_events, |aggregate_id| database.current_revision(aggregate_id))?;

        let event_count = domain_events.len();
        database.domain_events.extend(domain_events);

        tracing::info!(event_count = event_count, "Appended domain events");
        Ok(())
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> StoreResult<()> {
        let mut database = self.database.write().await;

        let exists = database.snapshots.iter().any(|stored| {
            stored.aggregate_identifier.id() == snapshot.aggregate_identifier.id()
                && stored.revision == snapshot.revision
        });
        if !exists {
            tracing::debug!(
                aggregate_id = %snapshot.aggregate_identifier.id(),
                revision = snapshot.revision,
                "Stored snapshot"
            );
            database.snapshots.push(snapshot);
        }

        Ok(())
    }

    async fn get_aggregate_identifiers(&self) -> StoreResult<AggregateIdentifierStream> {
        let identifiers: Vec<AggregateIdentifier> = self
            .collect_matching(|event| event.revision() == 1)
            .await
            .into_iter()
            .map(|event| event.aggregate_identifier)
            .collect();

        Ok(stream::iter(identifiers.into_iter().map(Ok)).boxed())
    }

    async fn get_aggregate_identifiers_by_name(
        &self,
        context_name: &str,
        aggregate_name: &str,
    ) -> StoreResult<AggregateIdentifierStream> {
        let identifiers: Vec<AggregateIdentifier> = self
            .collect_matching(|event| {
                event.revision() == 1
                    && event.aggregate_identifier.context_name() == context_name
                    && event.aggregate_identifier.aggregate_name() == aggregate_name
            })
            .await
            .into_iter()
            .map(|event| event.aggregate_identifier)
            .collect();

        Ok(stream::iter(identifiers.into_iter().map(Ok)).boxed())
    }

    async fn setup(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        let mut database = self.database.write().await;
        *database = Database::default();
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use futures_util::TryStreamExt;
    use proptest::prelude::*;
    use serde_json::json;

    fn aggregate() -> AggregateIdentifier {
        AggregateIdentifier::new("sampleContext", "sampleAggregate", Uuid::new_v4())
    }

    fn event(aggregate: &AggregateIdentifier, revision: i64) -> DomainEvent {
        DomainEvent::new(aggregate.clone(), "executed", &json!({ "strategy": "succeed" }), revision)
            .unwrap()
    }

    async fn revisions(store: &InMemoryDomainEventStore, aggregate_id: Uuid) -> Vec<i64> {
        store
            .get_replay_for_aggregate(aggregate_id, None, None)
            .await
            .unwrap()
            .map_ok(|event| event.revision())
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_last_domain_event_of_unknown_aggregate_is_none() {
        let store = InMemoryDomainEventStore::new();
        assert!(store.get_last_domain_event(&aggregate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_and_read_last_event() {
        let store = InMemoryDomainEventStore::new();
        let aggregate = aggregate();

        store
            .store_domain_events(vec![event(&aggregate, 1), event(&aggregate, 2)])
            .await
            .unwrap();

        let last = store.get_last_domain_event(&aggregate).await.unwrap().unwrap();
        assert_eq!(last.revision(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let store = InMemoryDomainEventStore::new();
        let result = store.store_domain_events(vec![]).await;
        assert!(matches!(result, Err(StoreError::ParameterInvalid(_))));
    }

    #[tokio::test]
    async fn test_duplicate_revision_leaves_state_untouched() {
        let store = InMemoryDomainEventStore::new();
        let aggregate = aggregate();

        store.store_domain_events(vec![event(&aggregate, 1)]).await.unwrap();

        // second event of the batch is valid, the first conflicts: nothing is written
        let result = store
            .store_domain_events(vec![event(&aggregate, 1), event(&aggregate, 2)])
            .await;
        assert!(matches!(result, Err(StoreError::RevisionAlreadyExists { revision: 1, .. })));
        assert_eq!(revisions(&store, aggregate.id()).await, vec![1]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_for_same_revision() {
        let store = InMemoryDomainEventStore::new();
        let aggregate = aggregate();

        store
            .store_domain_events(vec![event(&aggregate, 1), event(&aggregate, 2), event(&aggregate, 3)])
            .await
            .unwrap();

        let first = tokio::spawn({
            let store = store.clone();
            let batch = vec![event(&aggregate, 4)];
            async move { store.store_domain_events(batch).await }
        });
        let second = tokio::spawn({
            let store = store.clone();
            let batch = vec![event(&aggregate, 4)];
            async move { store.store_domain_events(batch).await }
        });

        let results = vec![first.await.unwrap(), second.await.unwrap()];
        let succeeded = results.iter().filter(|result| result.is_ok()).count();
        let conflicted = results
            .iter()
            .filter(|result| matches!(result, Err(StoreError::RevisionAlreadyExists { revision: 4, .. })))
            .count();

        assert_eq!(succeeded, 1);
        assert_eq!(conflicted, 1);
        assert_eq!(revisions(&store, aggregate.id()).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_replay_for_aggregate_range() {
        let store = InMemoryDomainEventStore::new();
        let aggregate = aggregate();

        store
            .store_domain_events(vec![event(&aggregate, 1), event(&aggregate, 2), event(&aggregate, 3)])
            .await
            .unwrap();

        let inverted = store.get_replay_for_aggregate(aggregate.id(), Some(5), Some(3)).await;
        assert!(matches!(inverted, Err(StoreError::ParameterInvalid(_))));

        let all: Vec<i64> = store
            .get_replay_for_aggregate(aggregate.id(), Some(1), Some(1_000_000))
            .await
            .unwrap()
            .map_ok(|event| event.revision())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all, vec![1, 2, 3]);

        let middle: Vec<i64> = store
            .get_replay_for_aggregate(aggregate.id(), Some(2), Some(2))
            .await
            .unwrap()
            .map_ok(|event| event.revision())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(middle, vec![2]);
    }

    #[tokio::test]
    async fn test_replay_from_timestamp_keeps_arrival_order() {
        let store = InMemoryDomainEventStore::new();
        let first = aggregate();
        let second = aggregate();
        let cutoff = Utc::now() - chrono::Duration::hours(1);

        let old = event(&first, 1).with_timestamp(cutoff - chrono::Duration::hours(1));
        store.store_domain_events(vec![old]).await.unwrap();
        store.store_domain_events(vec![event(&second, 1)]).await.unwrap();
        store.store_domain_events(vec![event(&first, 2)]).await.unwrap();

        let replayed: Vec<DomainEvent> = store
            .get_replay(Some(cutoff))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].aggregate_id(), second.id());
        assert_eq!(replayed[1].aggregate_id(), first.id());

        let everything: Vec<DomainEvent> =
            store.get_replay(None).await.unwrap().try_collect().await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn test_causation_and_correlation_queries() {
        let store = InMemoryDomainEventStore::new();
        let aggregate = aggregate();
        let causation_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        store
            .store_domain_events(vec![
                event(&aggregate, 1).with_causation_id(causation_id),
                event(&aggregate, 2).with_correlation_id(correlation_id),
                event(&aggregate, 3)
                    .with_causation_id(causation_id)
                    .with_correlation_id(correlation_id),
            ])
            .await
            .unwrap();

        let caused: Vec<DomainEvent> = store
            .get_domain_events_by_causation_id(causation_id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(caused.len(), 2);

        let correlated: Vec<DomainEvent> = store
            .get_domain_events_by_correlation_id(correlation_id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(correlated.len(), 2);

        assert!(store.has_domain_events_with_causation_id(causation_id).await.unwrap());
        assert!(!store.has_domain_events_with_causation_id(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_returns_highest_revision() {
        let store = InMemoryDomainEventStore::new();
        let aggregate = aggregate();

        assert!(store.get_snapshot(&aggregate).await.unwrap().is_none());

        store
            .store_snapshot(Snapshot::new(aggregate.clone(), 5, &json!({ "count": 5 })).unwrap())
            .await
            .unwrap();
        store
            .store_snapshot(Snapshot::new(aggregate.clone(), 10, &json!({ "count": 10 })).unwrap())
            .await
            .unwrap();
        // same revision again is ignored
        store
            .store_snapshot(Snapshot::new(aggregate.clone(), 10, &json!({ "count": -1 })).unwrap())
            .await
            .unwrap();

        let snapshot = store.get_snapshot(&aggregate).await.unwrap().unwrap();
        assert_eq!(snapshot.revision, 10);
        assert_eq!(snapshot.state["count"], 10);
    }

    #[tokio::test]
    async fn test_aggregate_identifiers() {
        let store = InMemoryDomainEventStore::new();
        let order = AggregateIdentifier::new("sales", "order", Uuid::new_v4());
        let invoice = AggregateIdentifier::new("billing", "invoice", Uuid::new_v4());

        store
            .store_domain_events(vec![event(&order, 1), event(&order, 2), event(&invoice, 1)])
            .await
            .unwrap();

        let all: Vec<AggregateIdentifier> = store
            .get_aggregate_identifiers()
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all, vec![order.clone(), invoice.clone()]);

        let orders: Vec<AggregateIdentifier> = store
            .get_aggregate_identifiers_by_name("sales", "order")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(orders, vec![order]);
    }

    #[tokio::test]
    async fn test_destroy_then_setup_leaves_empty_usable_store() {
        let store = InMemoryDomainEventStore::new();
        let aggregate = aggregate();

        store.store_domain_events(vec![event(&aggregate, 1)]).await.unwrap();
        store.destroy().await.unwrap();
        store.setup().await.unwrap();

        assert!(store.get_last_domain_event(&aggregate).await.unwrap().is_none());
        store.store_domain_events(vec![event(&aggregate, 1)]).await.unwrap();
        assert_eq!(revisions(&store, aggregate.id()).await, vec![1]);
    }

    proptest! {
        #[test]
        fn prop_revisions_are_gapless(batch_sizes in proptest::collection::vec(1usize..5, 1..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

            runtime.block_on(async {
                let store = InMemoryDomainEventStore::new();
                let aggregate = aggregate();
                let mut next = 1;

                for size in &batch_sizes {
                    let batch: Vec<DomainEvent> =
                        (next..next + *size as i64).map(|revision| event(&aggregate, revision)).collect();
                    store.store_domain_events(batch).await.unwrap();
                    next += *size as i64;
                }

                let total: i64 = batch_sizes.iter().map(|size| *size as i64).sum();
                let stored = revisions(&store, aggregate.id()).await;
                assert_eq!(stored, (1..=total).collect::<Vec<i64>>());
            });
        }
    }
}
