use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;

use crate::config::ScyllaOptions;
use crate::error::{StoreError, StoreResult};
use crate::utils::retry_with_backoff;

// ============================================================================
// ScyllaDB Plumbing
// ============================================================================

pub async fn connect(options: &ScyllaOptions) -> StoreResult<Session> {
    validate_keyspace(&options.keyspace)?;

    let session = retry_with_backoff(&options.retry, "scylla connect", |_attempt| {
        let mut builder = SessionBuilder::new();
        for node in &options.known_nodes {
            builder = builder.known_node(node);
        }
        async move { builder.build().await }
    })
    .await
    .into_result()
    .map_err(StoreError::backend)?;

    session
        .query_unpaged(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                 {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                options.keyspace, options.replication_factor
            ),
            (),
        )
        .await
        .map_err(StoreError::backend)?;

    session
        .use_keyspace(&options.keyspace, false)
        .await
        .map_err(StoreError::backend)?;

    tracing::info!(
        nodes = ?options.known_nodes,
        keyspace = %options.keyspace,
        "Connected to ScyllaDB"
    );

    Ok(session)
}

pub fn validate_keyspace(keyspace: &str) -> StoreResult<()> {
    let valid = !keyspace.is_empty()
        && keyspace.len() <= 48
        && keyspace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StoreError::parameter(format!("invalid keyspace '{keyspace}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_validation() {
        assert!(validate_keyspace("cqrs_ks").is_ok());
        assert!(validate_keyspace("bad-name").is_err());
        assert!(validate_keyspace("").is_err());
    }
}
