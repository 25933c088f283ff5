use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use scylla::client::session::Session;
use scylla::serialize::row::SerializeRow;
use scylla::statement::batch::Batch;
use scylla::value::{CqlValue, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::backends::scylla::connect;
use crate::config::ScyllaOptions;
use crate::error::{StoreError, StoreResult};
use crate::event_sourcing::core::{
    deserialize_event, serialize_event, AggregateIdentifier, DomainEvent, Snapshot,
};
use super::event_store::{
    ensure_contiguous, validate_batch, AggregateIdentifierStream, DomainEventStore,
    DomainEventStream, RevisionRange,
};

// ============================================================================
// ScyllaDB Domain Event Store
// ============================================================================
//
// Tables:
// - domain_events: partition = aggregate_id, clustering = revision
// - aggregates: one row per aggregate, registered before its first event
// - snapshots: partition = aggregate_id, clustering = revision DESC
//
// Appends are a single-partition LWT batch (`IF NOT EXISTS` per row), so a
// batch may only target one aggregate. Event queries are paged lazily; those
// that cross partitions come back in token order, not arrival order.
//
// ============================================================================

type EventRow = (Uuid, i64, String, String, Uuid, Uuid, DateTime<Utc>, String);

type AggregateRow = (Uuid, String, String, DateTime<Utc>);

const REGISTER_AGGREGATE: &str = "INSERT INTO aggregates \
    (aggregate_id, context_name, aggregate_name, created_at) VALUES (?, ?, ?, ?) IF NOT EXISTS";

pub struct ScyllaDomainEventStore {
    session: Arc<Session>,
}

impl ScyllaDomainEventStore {
    pub async fn connect(options: &ScyllaOptions) -> StoreResult<Self> {
        let session = connect(options).await?;
        Ok(Self::with_session(Arc::new(session)))
    }

    pub fn with_session(session: Arc<Session>) -> Self {
        Self { session }
    }

    async fn current_revision(&self, aggregate_id: Uuid) -> StoreResult<i64> {
        let result = self
            .session
            .query_unpaged(
                "SELECT revision FROM domain_events WHERE aggregate_id = ? \
                 ORDER BY revision DESC LIMIT 1",
                (aggregate_id,),
            )
            .await
            .map_err(StoreError::backend)?;

        let rows_result = result.into_rows_result().map_err(StoreError::backend)?;

        Ok(rows_result
            .maybe_first_row::<(i64,)>()
            .map_err(StoreError::backend)?
            .map(|(revision,)| revision)
            .unwrap_or(0))
    }

    /// Page through the rows of an event query as they are consumed.
    async fn stream_events<V>(&self, cql: &str, values: V) -> StoreResult<DomainEventStream>
    where
        V: SerializeRow,
    {
        let pager = self
            .session
            .query_iter(cql, values)
            .await
            .map_err(StoreError::backend)?;

        let rows = pager
            .rows_stream::<(String,)>()
            .map_err(StoreError::backend)?;

        Ok(decode_events(rows))
    }

    async fn collect_identifiers(
        &self,
        cql: &str,
        filter: Option<(&str, &str)>,
    ) -> StoreResult<AggregateIdentifierStream> {
        let result = match filter {
            Some((context_name, aggregate_name)) => {
                self.session
                    .query_unpaged(cql, (context_name, aggregate_name))
                    .await
            }
            None => self.session.query_unpaged(cql, ()).await,
        }
        .map_err(StoreError::backend)?;

        let rows_result = result.into_rows_result().map_err(StoreError::backend)?;
        let mut identifiers: Vec<(DateTime<Utc>, AggregateIdentifier)> = Vec::new();

        for row in rows_result
            .rows::<AggregateRow>()
            .map_err(StoreError::backend)?
        {
            let (aggregate_id, context_name, aggregate_name, created_at) =
                row.map_err(StoreError::backend)?;
            identifiers.push((
                created_at,
                AggregateIdentifier::new(context_name, aggregate_name, aggregate_id),
            ));
        }

        identifiers.sort_by_key(|(created_at, _)| *created_at);

        Ok(stream::iter(identifiers.into_iter().map(|(_, identifier)| Ok(identifier))).boxed())
    }
}

/// Decode `domain_event` rows one by one as the consumer pulls them. A
/// failing page becomes an error item.
fn decode_events<S, E>(rows: S) -> DomainEventStream
where
    S: Stream<Item = Result<(String,), E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    rows.map(|row| {
        let (json,) = row.map_err(StoreError::backend)?;
        deserialize_event(&json)
    })
    .boxed()
}

/// Whether a conditional statement went through. The `[applied]` column
/// always comes first; the remaining columns vary with the outcome.
fn was_applied(result: scylla::response::query_result::QueryResult) -> StoreResult<bool> {
    let rows_result = result.into_rows_result().map_err(StoreError::backend)?;

    let row = rows_result
        .maybe_first_row::<Row>()
        .map_err(StoreError::backend)?;

    Ok(matches!(
        row.as_ref().and_then(|row| row.columns.first()),
        Some(Some(CqlValue::Boolean(true)))
    ))
}

fn to_row(event: &DomainEvent) -> StoreResult<EventRow> {
    Ok((
        event.aggregate_id(),
        event.revision(),
        event.aggregate_identifier.context_name().to_string(),
        event.aggregate_identifier.aggregate_name().to_string(),
        event.metadata.causation_id,
        event.metadata.correlation_id,
        event.metadata.timestamp,
        serialize_event(event)?,
    ))
}

/// `aggregates` row for a batch that starts an aggregate's log.
fn registration(domain_events: &[DomainEvent]) -> Option<AggregateRow> {
    domain_events
        .iter()
        .find(|event| event.revision() == 1)
        .map(|first| {
            (
                first.aggregate_id(),
                first.aggregate_identifier.context_name().to_string(),
                first.aggregate_identifier.aggregate_name().to_string(),
                first.metadata.timestamp,
            )
        })
}

/// The LWT batch lives on one partition, so one aggregate per batch.
fn single_aggregate(domain_events: &[DomainEvent]) -> StoreResult<Uuid> {
    let first = domain_events
        .first()
        .ok_or_else(|| StoreError::parameter("domain events are missing"))?
        .aggregate_id();

    if domain_events.iter().any(|event| event.aggregate_id() != first) {
        return Err(StoreError::parameter(
            "scylla event store only appends events of a single aggregate per batch",
        ));
    }

    Ok(first)
}

#[async_trait]
impl DomainEventStore for ScyllaDomainEventStore {
    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Option<DomainEvent>> {
        let result = self
            .session
            .query_unpaged(
                "SELECT domain_event FROM domain_events WHERE aggregate_id = ? \
                 ORDER BY revision DESC LIMIT 1",
                (aggregate_identifier.id(),),
            )
            .await
            .map_err(StoreError::backend)?;

        let rows_result = result.into_rows_result().map_err(StoreError::backend)?;

        match rows_result
            .maybe_first_row::<(String,)>()
            .map_err(StoreError::backend)?
        {
            Some((json,)) => Ok(Some(deserialize_event(&json)?)),
            None => Ok(None),
        }
    }

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> StoreResult<DomainEventStream> {
        self.stream_events(
            "SELECT domain_event FROM domain_events WHERE causation_id = ?",
            (causation_id,),
        )
        .await
    }

    async fn has_domain_events_with_causation_id(&self, causation_id: Uuid) -> StoreResult<bool> {
        let result = self
            .session
            .query_unpaged(
                "SELECT aggregate_id FROM domain_events WHERE causation_id = ? LIMIT 1",
                (causation_id,),
            )
            .await
            .map_err(StoreError::backend)?;

        let rows_result = result.into_rows_result().map_err(StoreError::backend)?;
        Ok(rows_result.rows_num() > 0)
    }

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> StoreResult<DomainEventStream> {
        self.stream_events(
            "SELECT domain_event FROM domain_events WHERE correlation_id = ?",
            (correlation_id,),
        )
        .await
    }

    async fn get_replay(
        &self,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> StoreResult<DomainEventStream> {
        tracing::debug!(from_timestamp = ?from_timestamp, "Replaying domain events");

        match from_timestamp {
            Some(from) => {
                self.stream_events(
                    "SELECT domain_event FROM domain_events WHERE timestamp >= ? ALLOW FILTERING",
                    (from,),
                )
                .await
            }
            None => {
                self.stream_events("SELECT domain_event FROM domain_events", ())
                    .await
            }
        }
    }

    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: Uuid,
        from_revision: Option<i64>,
        to_revision: Option<i64>,
    ) -> StoreResult<DomainEventStream> {
        let range = RevisionRange::resolve(from_revision, to_revision)?;

        let rows = self
            .stream_events(
                "SELECT domain_event FROM domain_events \
                 WHERE aggregate_id = ? AND revision >= ? AND revision <= ? \
                 ORDER BY revision ASC",
                (aggregate_id, range.from, range.to),
            )
            .await?;

        Ok(ensure_contiguous(rows, range))
    }

    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Option<Snapshot>> {
        let result = self
            .session
            .query_unpaged(
                "SELECT snapshot FROM snapshots WHERE aggregate_id = ? LIMIT 1",
                (aggregate_identifier.id(),),
            )
            .await
            .map_err(StoreError::backend)?;

        let rows_result = result.into_rows_result().map_err(StoreError::backend)?;

        match rows_result
            .maybe_first_row::<(String,)>()
            .map_err(StoreError::backend)?
        {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_domain_events(&self, domain_events: Vec<DomainEvent>) -> StoreResult<()> {
        let aggregate_id = single_aggregate(&domain_events)?;

        let head = self.current_revision(aggregate_id).await?;
        validate_batch(&domain_events, |_| head)?;

        // Before the batch, so a committed first event is always enumerable.
        if let Some(row) = registration(&domain_events) {
            self.session
                .query_unpaged(REGISTER_AGGREGATE, row)
                .await
                .map_err(StoreError::backend)?;
        }

        let mut batch = Batch::default();
        let mut values: Vec<EventRow> = Vec::with_capacity(domain_events.len());

        for event in &domain_events {
            batch.append_statement(
                "INSERT INTO domain_events (
                    aggregate_id, revision, context_name, aggregate_name,
                    causation_id, correlation_id, timestamp, domain_event
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
            );
            values.push(to_row(event)?);
        }

        let result = self
            .session
            .batch(&batch, values)
            .await
            .map_err(StoreError::backend)?;

        if !was_applied(result)? {
            let revision = domain_events[0].revision();
            tracing::debug!(
                aggregate_id = %aggregate_id,
                revision = revision,
                "Lost append race"
            );
            return Err(StoreError::RevisionAlreadyExists {
                aggregate_id,
                revision,
            });
        }

        tracing::info!(
            aggregate_id = %aggregate_id,
            event_count = domain_events.len(),
            "Appended domain events"
        );
        Ok(())
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> StoreResult<()> {
        let json = serde_json::to_string(&snapshot)?;

        self.session
            .query_unpaged(
                "INSERT INTO snapshots (aggregate_id, revision, snapshot) VALUES (?, ?, ?) IF NOT EXISTS",
                (snapshot.aggregate_identifier.id(), snapshot.revision, json),
            )
            .await
            .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn get_aggregate_identifiers(&self) -> StoreResult<AggregateIdentifierStream> {
        self.collect_identifiers(
            "SELECT aggregate_id, context_name, aggregate_name, created_at FROM aggregates",
            None,
        )
        .await
    }

    async fn get_aggregate_identifiers_by_name(
        &self,
        context_name: &str,
        aggregate_name: &str,
    ) -> StoreResult<AggregateIdentifierStream> {
        self.collect_identifiers(
            "SELECT aggregate_id, context_name, aggregate_name, created_at FROM aggregates \
             WHERE context_name = ? AND aggregate_name = ? ALLOW FILTERING",
            Some((context_name, aggregate_name)),
        )
        .await
    }

    async fn setup(&self) -> StoreResult<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS domain_events (
                aggregate_id uuid,
                revision bigint,
                context_name text,
                aggregate_name text,
                causation_id uuid,
                correlation_id uuid,
                timestamp timestamp,
                domain_event text,
                PRIMARY KEY (aggregate_id, revision)
            ) WITH CLUSTERING ORDER BY (revision ASC)",
            "CREATE INDEX IF NOT EXISTS domain_events_causation ON domain_events (causation_id)",
            "CREATE INDEX IF NOT EXISTS domain_events_correlation ON domain_events (correlation_id)",
            "CREATE TABLE IF NOT EXISTS aggregates (
                aggregate_id uuid PRIMARY KEY,
                context_name text,
                aggregate_name text,
                created_at timestamp
            )",
            "CREATE TABLE IF NOT EXISTS snapshots (
                aggregate_id uuid,
                revision bigint,
                snapshot text,
                PRIMARY KEY (aggregate_id, revision)
            ) WITH CLUSTERING ORDER BY (revision DESC)",
        ];

        for statement in statements {
            self.session
                .query_unpaged(statement, ())
                .await
                .map_err(StoreError::backend)?;
        }

        tracing::info!("Domain event store set up in ScyllaDB");
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        // Sessions close when the last handle is dropped.
        tracing::debug!("Scylla domain event store released");
        Ok(())
    }
}
