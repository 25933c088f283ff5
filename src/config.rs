use config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::event_sourcing::core::SnapshotStrategy;
use crate::utils::lenient;
use crate::utils::retry::{duration_ms, RetryConfig};

// ============================================================================
// Configuration
// ============================================================================
//
// Sources, lowest precedence first:
// 1. Built-in defaults (everything in memory)
// 2. Optional file `config/cqrs-persistence.toml` (or `$CQRS_CONFIG`)
// 3. Environment, e.g. `CQRS__LOCK_STORE__TYPE=redis`
//
// Environment values stay strings; numeric fields parse them on their own so
// that passwords, prefixes and names are never turned into numbers.
//
// Every store section is a tagged `BackendOptions`; the `type` string is
// resolved once, here, at startup.
//
// ============================================================================

const DEFAULT_CONFIG_FILE: &str = "config/cqrs-persistence";
const ENV_PREFIX: &str = "CQRS";

#[derive(Debug, Clone, PartialEq)]
pub enum BackendOptions {
    InMemory,
    Postgres(PostgresOptions),
    Redis(RedisOptions),
    Scylla(ScyllaOptions),
}

impl BackendOptions {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendOptions::InMemory => "in-memory",
            BackendOptions::Postgres(_) => "postgres",
            BackendOptions::Redis(_) => "redis",
            BackendOptions::Scylla(_) => "scylla",
        }
    }

    /// Resolve a raw section (`{ "type": "...", ...parameters }`).
    pub fn from_value(value: Value) -> StoreResult<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::DatabaseTypeInvalid("missing backend type".to_string()))?
            .to_string();

        match kind.as_str() {
            "in-memory" | "inmemory" => Ok(BackendOptions::InMemory),
            "postgres" | "postgresql" => Ok(BackendOptions::Postgres(parse_parameters(&kind, value)?)),
            "redis" => Ok(BackendOptions::Redis(parse_parameters(&kind, value)?)),
            "scylla" | "scylladb" => Ok(BackendOptions::Scylla(parse_parameters(&kind, value)?)),
            other => Err(StoreError::DatabaseTypeInvalid(other.to_string())),
        }
    }
}

fn parse_parameters<T: for<'de> Deserialize<'de>>(kind: &str, value: Value) -> StoreResult<T> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::parameter(format!("invalid {kind} options: {e}")))
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostgresOptions {
    pub host: String,
    #[serde(deserialize_with = "lenient::number")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(deserialize_with = "lenient::number")]
    pub max_connections: u32,
    /// Prepended to every table name this crate creates
    pub table_prefix: String,
    #[serde(skip)]
    pub retry: RetryConfig,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "postgres".to_string(),
            max_connections: 10,
            table_prefix: "cqrs_".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisOptions {
    pub url: String,
    pub key_prefix: String,
    #[serde(skip)]
    pub retry: RetryConfig,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "cqrs:".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScyllaOptions {
    #[serde(deserialize_with = "lenient::string_list")]
    pub known_nodes: Vec<String>,
    pub keyspace: String,
    #[serde(deserialize_with = "lenient::number")]
    pub replication_factor: u32,
    #[serde(skip)]
    pub retry: RetryConfig,
}

impl Default for ScyllaOptions {
    fn default() -> Self {
        Self {
            known_nodes: vec!["127.0.0.1:9042".to_string()],
            keyspace: "cqrs_ks".to_string(),
            replication_factor: 1,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    /// Lease duration granted by `lock_next` and `renew_lock`
    #[serde(rename = "expiration_time_ms", with = "duration_ms")]
    pub expiration_time: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            expiration_time: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    /// How often a lease holder renews while processing
    #[serde(rename = "renew_interval_ms", with = "duration_ms")]
    pub renew_interval: Duration,
    /// Fallback poll when no wake-up notification arrives
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(deserialize_with = "lenient::number")]
    pub concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            renew_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is not set
    pub filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub event_store: BackendOptions,
    pub lock_store: BackendOptions,
    pub priority_queue_store: BackendOptions,
    pub consumer_progress_store: BackendOptions,
    pub notifications: BackendOptions,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub snapshot_strategy: SnapshotStrategy,
    pub logging: LoggingSettings,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    event_store: Value,
    lock_store: Value,
    priority_queue_store: Value,
    consumer_progress_store: Value,
    notifications: Value,
    #[serde(default)]
    queue: QueueSettings,
    #[serde(default)]
    worker: WorkerSettings,
    #[serde(default)]
    snapshot_strategy: SnapshotStrategy,
    #[serde(default)]
    logging: LoggingSettings,
    #[serde(default)]
    retry: RetryConfig,
}

impl Settings {
    /// Load from defaults, optional file and environment.
    pub fn load() -> StoreResult<Self> {
        let file = std::env::var("CQRS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let config = Self::builder()?
            .add_source(File::with_name(&file).required(false))
            .add_source(environment())
            .build()
            .map_err(config_error)?;

        Self::from_config(config)
    }

    /// Defaults only; callers add their own sources on top.
    pub fn builder() -> StoreResult<config::ConfigBuilder<config::builder::DefaultState>> {
        let mut builder = Config::builder();
        for section in [
            "event_store",
            "lock_store",
            "priority_queue_store",
            "consumer_progress_store",
            "notifications",
        ] {
            builder = builder
                .set_default(format!("{section}.type"), "in-memory")
                .map_err(config_error)?;
        }
        Ok(builder)
    }

    pub fn from_config(config: Config) -> StoreResult<Self> {
        let raw: RawSettings = config.try_deserialize().map_err(config_error)?;

        let mut settings = Self {
            event_store: BackendOptions::from_value(raw.event_store)?,
            lock_store: BackendOptions::from_value(raw.lock_store)?,
            priority_queue_store: BackendOptions::from_value(raw.priority_queue_store)?,
            consumer_progress_store: BackendOptions::from_value(raw.consumer_progress_store)?,
            notifications: BackendOptions::from_value(raw.notifications)?,
            queue: raw.queue,
            worker: raw.worker,
            snapshot_strategy: raw.snapshot_strategy,
            logging: raw.logging,
            retry: raw.retry,
        };
        settings.apply_retry();

        Ok(settings)
    }

    fn apply_retry(&mut self) {
        let retry = self.retry.clone();
        for options in [
            &mut self.event_store,
            &mut self.lock_store,
            &mut self.priority_queue_store,
            &mut self.consumer_progress_store,
            &mut self.notifications,
        ] {
            match options {
                BackendOptions::Postgres(postgres) => postgres.retry = retry.clone(),
                BackendOptions::Redis(redis) => redis.retry = retry.clone(),
                BackendOptions::Scylla(scylla) => scylla.retry = retry.clone(),
                BackendOptions::InMemory => {}
            }
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
}

fn config_error(error: config::ConfigError) -> StoreError {
    StoreError::Unknown(anyhow::Error::new(error).context("failed to load configuration"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_in_memory() {
        let settings = Settings::from_config(Settings::builder().unwrap().build().unwrap()).unwrap();

        assert_eq!(settings.event_store, BackendOptions::InMemory);
        assert_eq!(settings.lock_store, BackendOptions::InMemory);
        assert_eq!(settings.queue.expiration_time, Duration::from_secs(15));
        assert_eq!(settings.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_overrides_select_backends() {
        let config = Settings::builder()
            .unwrap()
            .set_override("lock_store.type", "redis")
            .unwrap()
            .set_override("lock_store.url", "redis://cache:6379")
            .unwrap()
            .set_override("event_store.type", "postgres")
            .unwrap()
            .set_override("event_store.port", 6543)
            .unwrap()
            .set_override("queue.expiration_time_ms", 250)
            .unwrap()
            .build()
            .unwrap();

        let settings = Settings::from_config(config).unwrap();

        match &settings.lock_store {
            BackendOptions::Redis(redis) => assert_eq!(redis.url, "redis://cache:6379"),
            other => panic!("unexpected lock store: {other:?}"),
        }
        match &settings.event_store {
            BackendOptions::Postgres(postgres) => {
                assert_eq!(postgres.port, 6543);
                assert_eq!(postgres.host, "localhost");
            }
            other => panic!("unexpected event store: {other:?}"),
        }
        assert_eq!(settings.queue.expiration_time, Duration::from_millis(250));
    }

    fn from_environment(variables: &[(&str, &str)]) -> StoreResult<Settings> {
        let source: config::Map<String, String> = variables
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        let config = Settings::builder()
            .unwrap()
            .add_source(environment().source(Some(source)))
            .build()
            .unwrap();

        Settings::from_config(config)
    }

    #[test]
    fn test_environment_keeps_numeric_looking_strings() {
        let settings = from_environment(&[
            ("CQRS__EVENT_STORE__TYPE", "postgres"),
            ("CQRS__EVENT_STORE__PASSWORD", "12345"),
            ("CQRS__EVENT_STORE__USER", "007"),
            ("CQRS__EVENT_STORE__TABLE_PREFIX", "2024"),
            ("CQRS__EVENT_STORE__PORT", "6543"),
            ("CQRS__LOCK_STORE__TYPE", "redis"),
            ("CQRS__LOCK_STORE__KEY_PREFIX", "42"),
        ])
        .unwrap();

        match &settings.event_store {
            BackendOptions::Postgres(postgres) => {
                assert_eq!(postgres.password, "12345");
                assert_eq!(postgres.user, "007");
                assert_eq!(postgres.table_prefix, "2024");
                assert_eq!(postgres.port, 6543);
            }
            other => panic!("unexpected event store: {other:?}"),
        }
        match &settings.lock_store {
            BackendOptions::Redis(redis) => assert_eq!(redis.key_prefix, "42"),
            other => panic!("unexpected lock store: {other:?}"),
        }
    }

    #[test]
    fn test_environment_parses_numeric_fields() {
        let settings = from_environment(&[
            ("CQRS__EVENT_STORE__TYPE", "scylla"),
            ("CQRS__EVENT_STORE__KNOWN_NODES", "node-a:9042,node-b:9042"),
            ("CQRS__EVENT_STORE__REPLICATION_FACTOR", "3"),
            ("CQRS__QUEUE__EXPIRATION_TIME_MS", "750"),
            ("CQRS__WORKER__CONCURRENCY", "4"),
            ("CQRS__RETRY__MAX_ATTEMPTS", "2"),
        ])
        .unwrap();

        match &settings.event_store {
            BackendOptions::Scylla(scylla) => {
                assert_eq!(scylla.known_nodes, vec!["node-a:9042", "node-b:9042"]);
                assert_eq!(scylla.replication_factor, 3);
                assert_eq!(scylla.retry.max_attempts, 2);
            }
            other => panic!("unexpected event store: {other:?}"),
        }
        assert_eq!(settings.queue.expiration_time, Duration::from_millis(750));
        assert_eq!(settings.worker.concurrency, 4);
    }

    #[test]
    fn test_unknown_type_is_database_type_invalid() {
        let result = BackendOptions::from_value(json!({ "type": "mongodb" }));
        assert!(matches!(result, Err(StoreError::DatabaseTypeInvalid(kind)) if kind == "mongodb"));

        let missing = BackendOptions::from_value(json!({ "host": "x" }));
        assert!(matches!(missing, Err(StoreError::DatabaseTypeInvalid(_))));
    }

    #[test]
    fn test_bad_parameters_are_parameter_invalid() {
        let result = BackendOptions::from_value(json!({ "type": "postgres", "port": "not a port" }));
        assert!(matches!(result, Err(StoreError::ParameterInvalid(_))));
    }
}
