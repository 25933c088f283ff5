use async_trait::async_trait;
use sqlx::postgres::PgPool;

use crate::backends::postgres::{connect, execute_all, table_name};
use crate::config::PostgresOptions;
use crate::error::{StoreError, StoreResult};
use crate::event_sourcing::AggregateIdentifier;
use super::{ensure_consumer_id, ensure_reset_target, ConsumerProgressStore, IsReplaying, Progress};

// ============================================================================
// PostgreSQL Consumer Progress Store
// ============================================================================
//
// Row per (consumer_id, aggregate_id). The replay window is two nullable
// columns; both are NULL when the consumer is not replaying. Every write is
// a single conditional statement, the affected row count tells whether the
// precondition held.
//
// ============================================================================

pub struct PostgresConsumerProgressStore {
    pool: PgPool,
    table: String,
}

impl PostgresConsumerProgressStore {
    pub async fn connect(options: &PostgresOptions) -> StoreResult<Self> {
        let pool = connect(options).await?;
        Self::with_pool(pool, options)
    }

    pub fn with_pool(pool: PgPool, options: &PostgresOptions) -> StoreResult<Self> {
        Ok(Self {
            pool,
            table: table_name(options, "consumer_progress")?,
        })
    }
}

fn to_progress(revision: i64, from: Option<i64>, to: Option<i64>) -> Progress {
    let is_replaying = match (from, to) {
        (Some(from), Some(to)) => IsReplaying::Replaying { from, to },
        _ => IsReplaying::NotReplaying,
    };
    Progress {
        revision,
        is_replaying,
    }
}

#[async_trait]
impl ConsumerProgressStore for PostgresConsumerProgressStore {
    async fn get_progress(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Progress> {
        ensure_consumer_id(consumer_id)?;

        let row: Option<(i64, Option<i64>, Option<i64>)> = sqlx::query_as(&format!(
            "SELECT revision, replaying_from, replaying_to FROM {}
             WHERE consumer_id = $1 AND aggregate_id = $2",
            self.table
        ))
        .bind(consumer_id)
        .bind(aggregate_identifier.id())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|(revision, from, to)| to_progress(revision, from, to))
            .unwrap_or_default())
    }

    async fn set_progress(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
        revision: i64,
    ) -> StoreResult<()> {
        ensure_consumer_id(consumer_id)?;

        if revision <= 0 {
            let current = self.get_progress(consumer_id, aggregate_identifier).await?.revision;
            return Err(StoreError::RevisionTooLow { revision, current });
        }

        let updated = sqlx::query(&format!(
            "INSERT INTO {table} (consumer_id, aggregate_id, revision) VALUES ($1, $2, $3)
             ON CONFLICT (consumer_id, aggregate_id) DO UPDATE SET revision = EXCLUDED.revision
             WHERE {table}.revision < EXCLUDED.revision",
            table = self.table
        ))
        .bind(consumer_id)
        .bind(aggregate_identifier.id())
        .bind(revision)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            let current = self.get_progress(consumer_id, aggregate_identifier).await?.revision;
            return Err(StoreError::RevisionTooLow { revision, current });
        }
        Ok(())
    }

    async fn set_is_replaying(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
        is_replaying: IsReplaying,
    ) -> StoreResult<()> {
        ensure_consumer_id(consumer_id)?;
        is_replaying.validate()?;

        match is_replaying {
            IsReplaying::Replaying { from, to } => {
                let updated = sqlx::query(&format!(
                    "INSERT INTO {table} (consumer_id, aggregate_id, revision, replaying_from, replaying_to)
                     VALUES ($1, $2, 0, $3, $4)
                     ON CONFLICT (consumer_id, aggregate_id) DO UPDATE
                     SET replaying_from = EXCLUDED.replaying_from, replaying_to = EXCLUDED.replaying_to
                     WHERE {table}.replaying_from IS NULL",
                    table = self.table
                ))
                .bind(consumer_id)
                .bind(aggregate_identifier.id())
                .bind(from)
                .bind(to)
                .execute(&self.pool)
                .await?
                .rows_affected();

                if updated == 0 {
                    return Err(StoreError::FlowIsAlreadyReplaying);
                }
            }
            IsReplaying::NotReplaying => {
                sqlx::query(&format!(
                    "UPDATE {} SET replaying_from = NULL, replaying_to = NULL
                     WHERE consumer_id = $1 AND aggregate_id = $2",
                    self.table
                ))
                .bind(consumer_id)
                .bind(aggregate_identifier.id())
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    async fn reset_progress(&self, consumer_id: &str) -> StoreResult<()> {
        ensure_consumer_id(consumer_id)?;

        let removed = sqlx::query(&format!("DELETE FROM {} WHERE consumer_id = $1", self.table))
            .bind(consumer_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::info!(consumer_id = %consumer_id, removed = removed, "Reset consumer progress");
        Ok(())
    }

    async fn reset_progress_to_revision(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
        revision: i64,
    ) -> StoreResult<()> {
        ensure_consumer_id(consumer_id)?;
        ensure_reset_target(revision, i64::MAX)?;

        let updated = sqlx::query(&format!(
            "UPDATE {} SET revision = $3, replaying_from = NULL, replaying_to = NULL
             WHERE consumer_id = $1 AND aggregate_id = $2 AND revision >= $3",
            self.table
        ))
        .bind(consumer_id)
        .bind(aggregate_identifier.id())
        .bind(revision)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            let current = self.get_progress(consumer_id, aggregate_identifier).await?.revision;
            ensure_reset_target(revision, current)?;
        }
        Ok(())
    }

    async fn setup(&self) -> StoreResult<()> {
        let table = &self.table;

        execute_all(
            &self.pool,
            &[format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    consumer_id TEXT NOT NULL,
                    aggregate_id UUID NOT NULL,
                    revision BIGINT NOT NULL,
                    replaying_from BIGINT NULL,
                    replaying_to BIGINT NULL,
                    CONSTRAINT {table}_pk PRIMARY KEY (consumer_id, aggregate_id)
                )"
            )],
        )
        .await?;

        tracing::info!(table = %table, "Consumer progress store set up");
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
