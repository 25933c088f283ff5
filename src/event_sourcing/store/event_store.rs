use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::event_sourcing::core::{AggregateIdentifier, DomainEvent, Snapshot};

// ============================================================================
// Domain Event Store - Contract
// ============================================================================
//
// Append-only log per aggregate with optimistic concurrency on
// (aggregate id, revision).
//
// Responsibilities:
// 1. Append batches atomically (all or nothing)
// 2. Reject a revision somebody else already claimed
// 3. Serve lazy, ordered replays
// 4. Keep snapshots as a replay shortcut
//
// ============================================================================

/// Lazy, forward-only sequence of stored events. Backend failures arrive as
/// `Err` items on the stream.
pub type DomainEventStream = BoxStream<'static, StoreResult<DomainEvent>>;

pub type AggregateIdentifierStream = BoxStream<'static, StoreResult<AggregateIdentifier>>;

#[async_trait]
pub trait DomainEventStore: Send + Sync {
    /// Most recent event of an aggregate, if it has any.
    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Option<DomainEvent>>;

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> StoreResult<DomainEventStream>;

    async fn has_domain_events_with_causation_id(&self, causation_id: Uuid) -> StoreResult<bool>;

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> StoreResult<DomainEventStream>;

    /// All events stored at or after `from_timestamp`, in arrival order.
    /// ScyllaDB has no global arrival order and yields partition token order
    /// instead; each aggregate's events still arrive by ascending revision.
    async fn get_replay(
        &self,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> StoreResult<DomainEventStream>;

    /// Events of one aggregate in ascending revision order. Bounds default to
    /// the full log and must satisfy `1 <= from <= to`.
    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: Uuid,
        from_revision: Option<i64>,
        to_revision: Option<i64>,
    ) -> StoreResult<DomainEventStream>;

    /// Highest snapshot of an aggregate, if any.
    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Option<Snapshot>>;

    async fn store_domain_events(&self, domain_events: Vec<DomainEvent>) -> StoreResult<()>;

    async fn store_snapshot(&self, snapshot: Snapshot) -> StoreResult<()>;

    /// Every aggregate that has a first event, in the order they were born.
    async fn get_aggregate_identifiers(&self) -> StoreResult<AggregateIdentifierStream>;

    async fn get_aggregate_identifiers_by_name(
        &self,
        context_name: &str,
        aggregate_name: &str,
    ) -> StoreResult<AggregateIdentifierStream>;

    /// Idempotent schema creation.
    async fn setup(&self) -> StoreResult<()>;

    /// Release connections. In-memory stores drop their data.
    async fn destroy(&self) -> StoreResult<()>;
}

// ============================================================================
// Shared Validation
// ============================================================================

/// Resolved, validated replay bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionRange {
    pub from: i64,
    pub to: i64,
}

impl RevisionRange {
    pub fn resolve(from_revision: Option<i64>, to_revision: Option<i64>) -> StoreResult<Self> {
        let from = from_revision.unwrap_or(1);
        let to = to_revision.unwrap_or(i64::MAX);

        if from < 1 {
            return Err(StoreError::parameter("from revision must be at least 1"));
        }
        if to < 1 {
            return Err(StoreError::parameter("to revision must be at least 1"));
        }
        if from > to {
            return Err(StoreError::parameter(
                "from revision must not be greater than to revision",
            ));
        }

        Ok(Self { from, to })
    }

    pub fn contains(&self, revision: i64) -> bool {
        revision >= self.from && revision <= self.to
    }
}

/// Check a batch before anything is written.
///
/// `current_revision` reports the stored head of an aggregate (0 if none).
/// Within the batch, each aggregate's revisions must continue that head one
/// by one: a revision at or below the head was already claimed, one beyond
/// head + 1 would leave a gap.
pub fn validate_batch<F>(domain_events: &[DomainEvent], mut current_revision: F) -> StoreResult<()>
where
    F: FnMut(Uuid) -> i64,
{
    if domain_events.is_empty() {
        return Err(StoreError::parameter("domain events are missing"));
    }

    let mut heads: HashMap<Uuid, i64> = HashMap::new();

    for event in domain_events {
        let aggregate_id = event.aggregate_id();
        let revision = event.revision();

        if revision < 1 {
            return Err(StoreError::parameter(format!(
                "revision must be at least 1, got {revision}"
            )));
        }

        let head = heads
            .entry(aggregate_id)
            .or_insert_with(|| current_revision(aggregate_id));

        if revision <= *head {
            return Err(StoreError::RevisionAlreadyExists {
                aggregate_id,
                revision,
            });
        }
        if revision != *head + 1 {
            return Err(StoreError::parameter(format!(
                "revision {revision} of aggregate {aggregate_id} would leave a gap after {head}"
            )));
        }

        *head = revision;
    }

    Ok(())
}

/// Turn a stored log into an error item as soon as a revision is skipped.
pub fn ensure_contiguous(stream: DomainEventStream, range: RevisionRange) -> DomainEventStream {
    stream
        .scan((range.from, false), |(expected, failed), item| {
            if *failed {
                return futures_util::future::ready(None);
            }

            let next = match item {
                Ok(event) if event.revision() == *expected => {
                    *expected += 1;
                    Ok(event)
                }
                Ok(event) => {
                    *failed = true;
                    tracing::error!(
                        aggregate_id = %event.aggregate_id(),
                        expected = *expected,
                        found = event.revision(),
                        "Revision gap detected in stored event log"
                    );
                    Err(StoreError::Unknown(anyhow::anyhow!(
                        "revision gap in aggregate {}: expected {}, found {}",
                        event.aggregate_id(),
                        expected,
                        event.revision()
                    )))
                }
                Err(error) => {
                    *failed = true;
                    Err(error)
                }
            };

            futures_util::future::ready(Some(next))
        })
        .boxed()
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use futures_util::TryStreamExt;

    fn event(aggregate: &AggregateIdentifier, revision: i64) -> DomainEvent {
        DomainEvent::new(aggregate.clone(), "executed", &serde_json::json!({}), revision).unwrap()
    }

    fn aggregate() -> AggregateIdentifier {
        AggregateIdentifier::new("sampleContext", "sampleAggregate", Uuid::new_v4())
    }

    #[test]
    fn test_range_defaults_to_full_log() {
        let range = RevisionRange::resolve(None, None).unwrap();
        assert_eq!(range.from, 1);
        assert_eq!(range.to, i64::MAX);
    }

    #[test]
    fn test_range_rejects_inverted_bounds() {
        assert!(matches!(
            RevisionRange::resolve(Some(5), Some(3)),
            Err(StoreError::ParameterInvalid(_))
        ));
        assert!(matches!(
            RevisionRange::resolve(Some(0), None),
            Err(StoreError::ParameterInvalid(_))
        ));
        assert!(matches!(
            RevisionRange::resolve(None, Some(0)),
            Err(StoreError::ParameterInvalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_batch() {
        let result = validate_batch(&[], |_| 0);
        assert!(matches!(result, Err(StoreError::ParameterInvalid(_))));
    }

    #[test]
    fn test_validate_accepts_consecutive_revisions() {
        let aggregate = aggregate();
        let batch = vec![event(&aggregate, 4), event(&aggregate, 5)];

        assert!(validate_batch(&batch, |_| 3).is_ok());
    }

    #[test]
    fn test_validate_detects_conflict_and_gap() {
        let aggregate = aggregate();

        let conflict = validate_batch(&[event(&aggregate, 3)], |_| 3);
        assert!(matches!(
            conflict,
            Err(StoreError::RevisionAlreadyExists { revision: 3, .. })
        ));

        let gap = validate_batch(&[event(&aggregate, 5)], |_| 3);
        assert!(matches!(gap, Err(StoreError::ParameterInvalid(_))));

        let duplicate_in_batch = validate_batch(&[event(&aggregate, 1), event(&aggregate, 1)], |_| 0);
        assert!(matches!(
            duplicate_in_batch,
            Err(StoreError::RevisionAlreadyExists { revision: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_contiguity_check_stops_at_gap() {
        let aggregate = aggregate();
        let events = vec![Ok(event(&aggregate, 1)), Ok(event(&aggregate, 3)), Ok(event(&aggregate, 4))];
        let range = RevisionRange::resolve(None, None).unwrap();

        let collected: Vec<StoreResult<DomainEvent>> =
            ensure_contiguous(stream::iter(events).boxed(), range).collect().await;

        assert_eq!(collected.len(), 2);
        assert!(collected[0].is_ok());
        assert!(collected[1].is_err());
    }

    #[tokio::test]
    async fn test_contiguity_check_passes_clean_log() {
        let aggregate = aggregate();
        let events = vec![Ok(event(&aggregate, 2)), Ok(event(&aggregate, 3))];
        let range = RevisionRange::resolve(Some(2), None).unwrap();

        let collected: Vec<DomainEvent> = ensure_contiguous(stream::iter(events).boxed(), range)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(collected.len(), 2);
    }
}
