// ============================================================================
// Consumer Progress Store
// ============================================================================
//
// Per (consumer, aggregate) watermark plus the replay window a consumer is
// currently catching up on. The watermark only moves forward, except through
// an explicit reset.
//
// ============================================================================

mod in_memory;
mod postgres;

pub use in_memory::InMemoryConsumerProgressStore;
pub use postgres::PostgresConsumerProgressStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::event_sourcing::AggregateIdentifier;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum IsReplaying {
    #[default]
    NotReplaying,
    Replaying { from: i64, to: i64 },
}

impl IsReplaying {
    pub fn is_replaying(&self) -> bool {
        matches!(self, IsReplaying::Replaying { .. })
    }

    fn validate(&self) -> StoreResult<()> {
        match *self {
            IsReplaying::Replaying { from, to } if from < 1 || from > to => Err(
                StoreError::parameter(format!("invalid replay window {from}..={to}")),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Highest revision the consumer has processed, 0 if none
    pub revision: i64,
    pub is_replaying: IsReplaying,
}

#[async_trait]
pub trait ConsumerProgressStore: Send + Sync {
    async fn get_progress(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Progress>;

    /// Advance the watermark. Fails with `RevisionTooLow` unless `revision`
    /// is above the current one.
    async fn set_progress(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
        revision: i64,
    ) -> StoreResult<()>;

    async fn set_is_replaying(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
        is_replaying: IsReplaying,
    ) -> StoreResult<()>;

    /// Forget everything about a consumer.
    async fn reset_progress(&self, consumer_id: &str) -> StoreResult<()>;

    /// Move the watermark back and leave replay mode.
    async fn reset_progress_to_revision(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
        revision: i64,
    ) -> StoreResult<()>;

    async fn setup(&self) -> StoreResult<()>;

    async fn destroy(&self) -> StoreResult<()>;
}

pub(crate) fn ensure_consumer_id(consumer_id: &str) -> StoreResult<()> {
    if consumer_id.is_empty() {
        return Err(StoreError::parameter("consumer id must not be empty"));
    }
    Ok(())
}

pub(crate) fn ensure_reset_target(revision: i64, current: i64) -> StoreResult<()> {
    if revision < 0 {
        return Err(StoreError::parameter("revision must not be negative"));
    }
    if revision > current {
        return Err(StoreError::parameter(format!(
            "cannot reset to revision {revision}, current revision is {current}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_window_validation() {
        assert!(IsReplaying::NotReplaying.validate().is_ok());
        assert!(IsReplaying::Replaying { from: 1, to: 1 }.validate().is_ok());
        assert!(IsReplaying::Replaying { from: 0, to: 3 }.validate().is_err());
        assert!(IsReplaying::Replaying { from: 4, to: 3 }.validate().is_err());
    }

    #[test]
    fn test_progress_wire_shape() {
        let progress = Progress {
            revision: 7,
            is_replaying: IsReplaying::Replaying { from: 2, to: 5 },
        };
        let json = serde_json::to_value(progress).unwrap();

        assert_eq!(json["revision"], 7);
        assert_eq!(json["isReplaying"]["state"], "replaying");
        assert_eq!(json["isReplaying"]["from"], 2);
    }
}
