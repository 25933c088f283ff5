use uuid::Uuid;

// ============================================================================
// Store Errors
// ============================================================================
//
// Shared error taxonomy for every store and every backend.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Parameter invalid: {0}")]
    ParameterInvalid(String),

    #[error("Expiration must be in the future")]
    ExpirationInPast,

    #[error("Revision {revision} already exists for aggregate {aggregate_id}")]
    RevisionAlreadyExists { aggregate_id: Uuid, revision: i64 },

    #[error("Revision {revision} is too low, current revision is {current}")]
    RevisionTooLow { revision: i64, current: i64 },

    #[error("Failed to acquire lock")]
    LockAcquireFailed,

    #[error("Failed to renew lock")]
    LockRenewalFailed,

    #[error("Token mismatch for discriminator '{0}'")]
    TokenMismatch(String),

    #[error("Item not found for discriminator '{0}'")]
    ItemNotFound(String),

    #[error("Flow is already replaying")]
    FlowIsAlreadyReplaying,

    #[error("Database type invalid: {0}")]
    DatabaseTypeInvalid(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Wrap any backend failure, keeping it as the source.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Unknown(anyhow::Error::new(error))
    }

    pub fn parameter(message: impl Into<String>) -> Self {
        StoreError::ParameterInvalid(message.into())
    }

    /// Kinds a caller may reasonably try again after re-reading state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::RevisionAlreadyExists { .. }
                | StoreError::LockAcquireFailed
                | StoreError::Unknown(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError::Unknown(anyhow::Error::new(error).context("postgres operation failed"))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        StoreError::Unknown(anyhow::Error::new(error).context("redis operation failed"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Unknown(anyhow::Error::new(error).context("json (de)serialization failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let conflict = StoreError::RevisionAlreadyExists {
            aggregate_id: Uuid::new_v4(),
            revision: 4,
        };
        assert!(conflict.is_retryable());
        assert!(StoreError::LockAcquireFailed.is_retryable());
        assert!(!StoreError::ExpirationInPast.is_retryable());
        assert!(!StoreError::TokenMismatch("a".to_string()).is_retryable());
        assert!(!StoreError::parameter("bad").is_retryable());
    }

    #[test]
    fn test_unknown_keeps_cause() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = StoreError::from(json_error);

        match &error {
            StoreError::Unknown(inner) => {
                assert!(inner.chain().count() >= 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
