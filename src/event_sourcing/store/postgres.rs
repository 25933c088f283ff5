use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::backends::postgres::{
    connect, execute_all, is_unique_violation, spawn_row_stream, table_name, Bind,
};
use crate::config::PostgresOptions;
use crate::error::{StoreError, StoreResult};
use crate::event_sourcing::core::{AggregateIdentifier, DomainEvent, Snapshot};
use super::event_store::{
    ensure_contiguous, validate_batch, AggregateIdentifierStream, DomainEventStore,
    DomainEventStream, RevisionRange,
};

// ============================================================================
// PostgreSQL Domain Event Store
// ============================================================================
//
// Tables:
// - <prefix>domain_events: one row per event, PK (aggregate_id, revision),
//   `position` gives the global arrival order
// - <prefix>snapshots: PK (aggregate_id, revision)
//
// A batch is written in one transaction. The primary key settles races: the
// loser of two concurrent appends for the same revision hits a unique
// violation and gets `RevisionAlreadyExists`.
//
// ============================================================================

pub struct PostgresDomainEventStore {
    pool: PgPool,
    events_table: String,
    snapshots_table: String,
}

impl PostgresDomainEventStore {
    pub async fn connect(options: &PostgresOptions) -> StoreResult<Self> {
        let pool = connect(options).await?;
        Self::with_pool(pool, options)
    }

    pub fn with_pool(pool: PgPool, options: &PostgresOptions) -> StoreResult<Self> {
        Ok(Self {
            pool,
            events_table: table_name(options, "domain_events")?,
            snapshots_table: table_name(options, "snapshots")?,
        })
    }

    fn stream_events(&self, filter: &str, binds: Vec<Bind>) -> DomainEventStream {
        let sql = format!(
            "SELECT domain_event FROM {} {} ORDER BY position ASC",
            self.events_table, filter
        );
        spawn_row_stream(self.pool.clone(), sql, binds, decode_event)
    }

    fn stream_identifiers(&self, filter: &str, binds: Vec<Bind>) -> AggregateIdentifierStream {
        let sql = format!(
            "SELECT context_name, aggregate_name, aggregate_id FROM {}
             WHERE revision = 1 {} ORDER BY position ASC",
            self.events_table, filter
        );
        spawn_row_stream(self.pool.clone(), sql, binds, decode_identifier)
    }
}

fn decode_event(row: PgRow) -> StoreResult<DomainEvent> {
    let Json(event): Json<DomainEvent> = row.try_get("domain_event")?;
    Ok(event)
}

fn decode_identifier(row: PgRow) -> StoreResult<AggregateIdentifier> {
    let context_name: String = row.try_get("context_name")?;
    let aggregate_name: String = row.try_get("aggregate_name")?;
    let aggregate_id: Uuid = row.try_get("aggregate_id")?;
    Ok(AggregateIdentifier::new(context_name, aggregate_name, aggregate_id))
}

#[async_trait]
impl DomainEventStore for PostgresDomainEventStore {
    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Option<DomainEvent>> {
        let row: Option<(Json<DomainEvent>,)> = sqlx::query_as(&format!(
            "SELECT domain_event FROM {} WHERE aggregate_id = $1 ORDER BY revision DESC LIMIT 1",
            self.events_table
        ))
        .bind(aggregate_identifier.id())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(event),)| event))
    }

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> StoreResult<DomainEventStream> {
        Ok(self.stream_events("WHERE causation_id = $1", vec![Bind::Uuid(causation_id)]))
    }

    async fn has_domain_events_with_causation_id(&self, causation_id: Uuid) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE causation_id = $1)",
            self.events_table
        ))
        .bind(causation_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> StoreResult<DomainEventStream> {
        Ok(self.stream_events("WHERE correlation_id = $1", vec![Bind::Uuid(correlation_id)]))
    }

    async fn get_replay(
        &self,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> StoreResult<DomainEventStream> {
        Ok(match from_timestamp {
            Some(from) => self.stream_events("WHERE timestamp >= $1", vec![Bind::Timestamp(from)]),
            None => self.stream_events("", Vec::new()),
        })
    }

    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: Uuid,
        from_revision: Option<i64>,
        to_revision: Option<i64>,
    ) -> StoreResult<DomainEventStream> {
        let range = RevisionRange::resolve(from_revision, to_revision)?;

        let sql = format!(
            "SELECT domain_event FROM {}
             WHERE aggregate_id = $1 AND revision >= $2 AND revision <= $3
             ORDER BY revision ASC",
            self.events_table
        );
        let stream = spawn_row_stream(
            self.pool.clone(),
            sql,
            vec![
                Bind::Uuid(aggregate_id),
                Bind::BigInt(range.from),
                Bind::BigInt(range.to),
            ],
            decode_event,
        );

        Ok(ensure_contiguous(stream, range))
    }

    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Option<Snapshot>> {
        let row: Option<(Json<Snapshot>,)> = sqlx::query_as(&format!(
            "SELECT snapshot FROM {} WHERE aggregate_id = $1 ORDER BY revision DESC LIMIT 1",
            self.snapshots_table
        ))
        .bind(aggregate_identifier.id())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(snapshot),)| snapshot))
    }

    async fn store_domain_events(&self, domain_events: Vec<DomainEvent>) -> StoreResult<()> {
        if domain_events.is_empty() {
            return Err(StoreError::parameter("domain events are missing"));
        }

        let aggregate_ids: Vec<Uuid> = domain_events
            .iter()
            .map(DomainEvent::aggregate_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut transaction = self.pool.begin().await?;

        let heads: HashMap<Uuid, i64> = sqlx::query_as::<_, (Uuid, i64)>(&format!(
            "SELECT aggregate_id, MAX(revision) FROM {} WHERE aggregate_id = ANY($1) GROUP BY aggregate_id",
            self.events_table
        ))
        .bind(&aggregate_ids)
        .fetch_all(&mut *transaction)
        .await?
        .into_iter()
        .collect();

        validate_batch(&domain_events, |aggregate_id| {
            heads.get(&aggregate_id).copied().unwrap_or(0)
        })?;

        let insert = format!(
            "INSERT INTO {} (
                aggregate_id, revision, context_name, aggregate_name,
                causation_id, correlation_id, timestamp, domain_event
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.events_table
        );

        for event in &domain_events {
            let result = sqlx::query(&insert)
                .bind(event.aggregate_id())
                .bind(event.revision())
                .bind(event.aggregate_identifier.context_name())
                .bind(event.aggregate_identifier.aggregate_name())
                .bind(event.metadata.causation_id)
                .bind(event.metadata.correlation_id)
                .bind(event.metadata.timestamp)
                .bind(Json(event))
                .execute(&mut *transaction)
                .await;

            match result {
                Ok(_) => {}
                Err(error) if is_unique_violation(&error) => {
                    tracing::debug!(
                        aggregate_id = %event.aggregate_id(),
                        revision = event.revision(),
                        "Lost append race"
                    );
                    return Err(StoreError::RevisionAlreadyExists {
                        aggregate_id: event.aggregate_id(),
                        revision: event.revision(),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }

        transaction.commit().await?;

        tracing::info!(event_count = domain_events.len(), "Appended domain events");
        Ok(())
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (aggregate_id, revision, snapshot) VALUES ($1, $2, $3)
             ON CONFLICT (aggregate_id, revision) DO NOTHING",
            self.snapshots_table
        ))
        .bind(snapshot.aggregate_identifier.id())
        .bind(snapshot.revision)
        .bind(Json(&snapshot))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_aggregate_identifiers(&self) -> StoreResult<AggregateIdentifierStream> {
        Ok(self.stream_identifiers("", Vec::new()))
    }

    async fn get_aggregate_identifiers_by_name(
        &self,
        context_name: &str,
        aggregate_name: &str,
    ) -> StoreResult<AggregateIdentifierStream> {
        Ok(self.stream_identifiers(
            "AND context_name = $1 AND aggregate_name = $2",
            vec![
                Bind::Text(context_name.to_string()),
                Bind::Text(aggregate_name.to_string()),
            ],
        ))
    }

    async fn setup(&self) -> StoreResult<()> {
        let events = &self.events_table;
        let snapshots = &self.snapshots_table;

        execute_all(
            &self.pool,
            &[
                format!(
                    "CREATE TABLE IF NOT EXISTS {events} (
                        position BIGSERIAL NOT NULL,
                        aggregate_id UUID NOT NULL,
                        revision BIGINT NOT NULL,
                        context_name TEXT NOT NULL,
                        aggregate_name TEXT NOT NULL,
                        causation_id UUID NOT NULL,
                        correlation_id UUID NOT NULL,
                        timestamp TIMESTAMPTZ NOT NULL,
                        domain_event JSONB NOT NULL,
                        CONSTRAINT {events}_pk PRIMARY KEY (aggregate_id, revision)
                    )"
                ),
                format!("CREATE UNIQUE INDEX IF NOT EXISTS {events}_position ON {events} (position)"),
                format!("CREATE INDEX IF NOT EXISTS {events}_causation ON {events} (causation_id)"),
                format!("CREATE INDEX IF NOT EXISTS {events}_correlation ON {events} (correlation_id)"),
                format!("CREATE INDEX IF NOT EXISTS {events}_timestamp ON {events} (timestamp)"),
                format!(
                    "CREATE INDEX IF NOT EXISTS {events}_names ON {events} (context_name, aggregate_name) \
                     WHERE revision = 1"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {snapshots} (
                        aggregate_id UUID NOT NULL,
                        revision BIGINT NOT NULL,
                        snapshot JSONB NOT NULL,
                        CONSTRAINT {snapshots}_pk PRIMARY KEY (aggregate_id, revision)
                    )"
                ),
            ],
        )
        .await?;

        tracing::info!(table = %events, "Domain event store set up");
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_follow_prefix() {
        let options = PostgresOptions {
            table_prefix: "billing_".to_string(),
            ..PostgresOptions::default()
        };
        assert_eq!(table_name(&options, "domain_events").unwrap(), "billing_domain_events");
        assert_eq!(table_name(&options, "snapshots").unwrap(), "billing_snapshots");
    }
}
