use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::event_sourcing::AggregateIdentifier;
use super::{ensure_consumer_id, ensure_reset_target, ConsumerProgressStore, IsReplaying, Progress};

type ProgressKey = (String, Uuid);

#[derive(Default, Clone)]
pub struct InMemoryConsumerProgressStore {
    progress: Arc<Mutex<HashMap<ProgressKey, Progress>>>,
}

impl InMemoryConsumerProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(consumer_id: &str, aggregate_identifier: &AggregateIdentifier) -> ProgressKey {
    (consumer_id.to_string(), aggregate_identifier.id())
}

#[async_trait]
impl ConsumerProgressStore for InMemoryConsumerProgressStore {
    async fn get_progress(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
    ) -> StoreResult<Progress> {
        ensure_consumer_id(consumer_id)?;

        let progress = self.progress.lock().await;
        Ok(progress
            .get(&key(consumer_id, aggregate_identifier))
            .copied()
            .unwrap_or_default())
    }

    async fn set_progress(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
        revision: i64,
    ) -> StoreResult<()> {
        ensure_consumer_id(consumer_id)?;

        let mut progress = self.progress.lock().await;
        let entry = progress.entry(key(consumer_id, aggregate_identifier)).or_default();

        if revision <= entry.revision {
            return Err(StoreError::RevisionTooLow {
                revision,
                current: entry.revision,
            });
        }

        entry.revision = revision;
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

        let mut progress = self.progress.lock().await;
        let entry = progress.entry(key(consumer_id, aggregate_identifier)).or_default();

        if is_replaying.is_replaying() && entry.is_replaying.is_replaying() {
            return Err(StoreError::FlowIsAlreadyReplaying);
        }

        entry.is_replaying = is_replaying;
        Ok(())
    }

    async fn reset_progress(&self, consumer_id: &str) -> StoreResult<()> {
        ensure_consumer_id(consumer_id)?;

        let mut progress = self.progress.lock().await;
        progress.retain(|(consumer, _), _| consumer != consumer_id);
        Ok(())
    }

    async fn reset_progress_to_revision(
        &self,
        consumer_id: &str,
        aggregate_identifier: &AggregateIdentifier,
        revision: i64,
    ) -> StoreResult<()> {
        ensure_consumer_id(consumer_id)?;

        let mut progress = self.progress.lock().await;
        let key = key(consumer_id, aggregate_identifier);
        let current = progress.get(&key).map_or(0, |entry| entry.revision);

        ensure_reset_target(revision, current)?;

        if let Some(entry) = progress.get_mut(&key) {
            entry.revision = revision;
            entry.is_replaying = IsReplaying::NotReplaying;
        }
        Ok(())
    }

    async fn setup(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.progress.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate() -> AggregateIdentifier {
        AggregateIdentifier::new("sales", "order", Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_unknown_progress_is_zero() {
        let store = InMemoryConsumerProgressStore::new();
        let progress = store.get_progress("view", &aggregate()).await.unwrap();

        assert_eq!(progress, Progress::default());
        assert_eq!(progress.revision, 0);
        assert!(!progress.is_replaying.is_replaying());
    }

    #[tokio::test]
    async fn test_watermark_only_moves_forward() {
        let store = InMemoryConsumerProgressStore::new();
        let aggregate = aggregate();

        store.set_progress("view", &aggregate, 3).await.unwrap();

        let same = store.set_progress("view", &aggregate, 3).await;
        assert!(matches!(same, Err(StoreError::RevisionTooLow { revision: 3, current: 3 })));
        let lower = store.set_progress("view", &aggregate, 2).await;
        assert!(matches!(lower, Err(StoreError::RevisionTooLow { current: 3, .. })));

        store.set_progress("view", &aggregate, 5).await.unwrap();
        assert_eq!(store.get_progress("view", &aggregate).await.unwrap().revision, 5);
    }

    #[tokio::test]
    async fn test_consumers_are_independent() {
        let store = InMemoryConsumerProgressStore::new();
        let aggregate = aggregate();

        store.set_progress("view", &aggregate, 4).await.unwrap();
        store.set_progress("flow", &aggregate, 1).await.unwrap();

        assert_eq!(store.get_progress("view", &aggregate).await.unwrap().revision, 4);
        assert_eq!(store.get_progress("flow", &aggregate).await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_replay_cannot_be_entered_twice() {
        let store = InMemoryConsumerProgressStore::new();
        let aggregate = aggregate();
        let window = IsReplaying::Replaying { from: 2, to: 6 };

        store.set_is_replaying("flow", &aggregate, window).await.unwrap();
        let again = store.set_is_replaying("flow", &aggregate, window).await;
        assert!(matches!(again, Err(StoreError::FlowIsAlreadyReplaying)));

        store
            .set_is_replaying("flow", &aggregate, IsReplaying::NotReplaying)
            .await
            .unwrap();
        store.set_is_replaying("flow", &aggregate, window).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_replay_window() {
        let store = InMemoryConsumerProgressStore::new();
        let result = store
            .set_is_replaying("flow", &aggregate(), IsReplaying::Replaying { from: 5, to: 3 })
            .await;
        assert!(matches!(result, Err(StoreError::ParameterInvalid(_))));
    }

    #[tokio::test]
    async fn test_reset_to_revision_moves_back_and_clears_replay() {
        let store = InMemoryConsumerProgressStore::new();
        let aggregate = aggregate();

        store.set_progress("flow", &aggregate, 8).await.unwrap();
        store
            .set_is_replaying("flow", &aggregate, IsReplaying::Replaying { from: 1, to: 8 })
            .await
            .unwrap();

        let forward = store.reset_progress_to_revision("flow", &aggregate, 9).await;
        assert!(matches!(forward, Err(StoreError::ParameterInvalid(_))));
        let negative = store.reset_progress_to_revision("flow", &aggregate, -1).await;
        assert!(matches!(negative, Err(StoreError::ParameterInvalid(_))));

        store.reset_progress_to_revision("flow", &aggregate, 2).await.unwrap();

        let progress = store.get_progress("flow", &aggregate).await.unwrap();
        assert_eq!(progress.revision, 2);
        assert_eq!(progress.is_replaying, IsReplaying::NotReplaying);
    }

    #[tokio::test]
    async fn test_reset_progress_drops_only_that_consumer() {
        let store = InMemoryConsumerProgressStore::new();
        let aggregate = aggregate();

        store.set_progress("view", &aggregate, 4).await.unwrap();
        store.set_progress("flow", &aggregate, 4).await.unwrap();

        store.reset_progress("view").await.unwrap();

        assert_eq!(store.get_progress("view", &aggregate).await.unwrap().revision, 0);
        assert_eq!(store.get_progress("flow", &aggregate).await.unwrap().revision, 4);
    }
}
