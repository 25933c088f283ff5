use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::Postgres;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::PostgresOptions;
use crate::error::{StoreError, StoreResult};
use crate::utils::retry_with_backoff;

// ============================================================================
// PostgreSQL Plumbing
// ============================================================================
//
// Shared by every postgres-backed store:
// - pool creation with backoff
// - table naming
// - row streaming through a bounded channel
//
// ============================================================================

/// Rows buffered between the fetching task and a slow consumer
const STREAM_BUFFER: usize = 64;

pub async fn connect(options: &PostgresOptions) -> StoreResult<PgPool> {
    let connect_options = PgConnectOptions::new()
        .host(&options.host)
        .port(options.port)
        .username(&options.user)
        .password(&options.password)
        .database(&options.database);

    let pool = retry_with_backoff(&options.retry, "postgres connect", |_attempt| {
        let connect_options = connect_options.clone();
        async move {
            PgPoolOptions::new()
                .max_connections(options.max_connections)
                .connect_with(connect_options)
                .await
        }
    })
    .await
    .into_result()?;

    tracing::info!(
        host = %options.host,
        port = options.port,
        database = %options.database,
        "Connected to PostgreSQL"
    );

    Ok(pool)
}

/// `<prefix><name>`, restricted to characters safe to splice into DDL.
pub fn table_name(options: &PostgresOptions, name: &str) -> StoreResult<String> {
    let table = format!("{}{}", options.table_prefix, name);

    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());

    if !valid {
        return Err(StoreError::parameter(format!("invalid table name '{table}'")));
    }

    Ok(table)
}

/// Run DDL statements one by one; all of them are `IF NOT EXISTS`.
pub async fn execute_all(pool: &PgPool, statements: &[String]) -> StoreResult<()> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(database_error) => database_error.is_unique_violation(),
        _ => false,
    }
}

/// Owned bind value, so a query can be rebuilt inside a spawned task.
#[derive(Debug, Clone)]
pub enum Bind {
    Uuid(Uuid),
    BigInt(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Bind {
    fn apply<'q>(self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        match self {
            Bind::Uuid(value) => query.bind(value),
            Bind::BigInt(value) => query.bind(value),
            Bind::Text(value) => query.bind(value),
            Bind::Timestamp(value) => query.bind(value),
        }
    }
}

/// Stream the rows of a query lazily.
///
/// A spawned task fetches rows and pushes them into a bounded channel. When
/// the consumer drops the stream, the next send fails, the task ends and the
/// pooled connection goes back to the pool. A failing row is forwarded as an
/// error item and ends the stream.
pub fn spawn_row_stream<T, F>(
    pool: PgPool,
    sql: String,
    binds: Vec<Bind>,
    decode: F,
) -> BoxStream<'static, StoreResult<T>>
where
    T: Send + 'static,
    F: Fn(PgRow) -> StoreResult<T> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(STREAM_BUFFER);

    tokio::spawn(async move {
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = bind.apply(query);
        }

        let mut rows = query.fetch(&pool);

        while let Some(row) = rows.next().await {
            let item = row.map_err(StoreError::from).and_then(&decode);
            let failed = item.is_err();

            if failed {
                tracing::error!("Row stream failed mid-way, forwarding error to consumer");
            }
            if sender.send(item).await.is_err() {
                tracing::debug!("Row stream consumer went away, releasing connection");
                break;
            }
            if failed {
                break;
            }
        }
    });

    ReceiverStream::new(receiver).boxed()
}
