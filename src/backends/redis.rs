use redis::aio::MultiplexedConnection;

use crate::config::RedisOptions;
use crate::error::{StoreError, StoreResult};
use crate::utils::retry_with_backoff;

// ============================================================================
// Redis Plumbing
// ============================================================================

pub async fn connect(options: &RedisOptions) -> StoreResult<MultiplexedConnection> {
    let client = redis::Client::open(options.url.as_str())?;

    let connection = retry_with_backoff(&options.retry, "redis connect", |_attempt| {
        let client = client.clone();
        async move { client.get_multiplexed_async_connection().await }
    })
    .await
    .into_result()?;

    tracing::info!(url = %options.url, "Connected to Redis");
    Ok(connection)
}

/// Namespaced key, e.g. `cqrs:lock:<hash>`.
pub fn key(options: &RedisOptions, kind: &str, id: &str) -> StoreResult<String> {
    if kind.is_empty() || id.is_empty() {
        return Err(StoreError::parameter("redis key parts must not be empty"));
    }
    Ok(format!("{}{}:{}", options.key_prefix, kind, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_namespaced() {
        let options = RedisOptions::default();
        assert_eq!(key(&options, "lock", "abc").unwrap(), "cqrs:lock:abc");
        assert!(key(&options, "lock", "").is_err());
    }
}
