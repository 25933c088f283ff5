use async_trait::async_trait;
use futures_util::stream::StreamExt;
use sqlx::postgres::{PgListener, PgPool};

use crate::backends::postgres::{connect, table_name};
use crate::config::PostgresOptions;
use crate::error::{StoreError, StoreResult};
use super::{ensure_channel, NotificationStream, Notifier};

// ============================================================================
// PostgreSQL Notifier (LISTEN / NOTIFY)
// ============================================================================
//
// Each subscription owns a dedicated listener connection that lives as long
// as the returned stream. Channel names get the table prefix so several
// deployments can share one database.
//
// ============================================================================

pub struct PostgresNotifier {
    pool: PgPool,
    options: PostgresOptions,
}

impl PostgresNotifier {
    pub async fn connect(options: &PostgresOptions) -> StoreResult<Self> {
        let pool = connect(options).await?;
        Ok(Self::with_pool(pool, options))
    }

    pub fn with_pool(pool: PgPool, options: &PostgresOptions) -> Self {
        Self {
            pool,
            options: options.clone(),
        }
    }

    fn channel_name(&self, channel: &str) -> StoreResult<String> {
        ensure_channel(channel)?;
        // Same identifier rules as table names.
        table_name(&self.options, channel)
    }
}

#[async_trait]
impl Notifier for PostgresNotifier {
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let channel = self.channel_name(channel)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(message)
            .execute(&self.pool)
            .await?;

        tracing::trace!(channel = %channel, "Published notification");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<NotificationStream> {
        let channel = self.channel_name(channel)?;

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&channel).await?;

        tracing::debug!(channel = %channel, "Listening for notifications");

        Ok(listener
            .into_stream()
            .map(|notification| {
                notification
                    .map(|notification| notification.payload().to_string())
                    .map_err(StoreError::from)
            })
            .boxed())
    }

    async fn setup(&self) -> StoreResult<()> {
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
    fn test_channel_names_are_prefixed_and_checked() {
        let options = PostgresOptions::default();
        assert_eq!(table_name(&options, "new_item").unwrap(), "cqrs_new_item");
        assert!(table_name(&options, "new-item").is_err());
    }
}
