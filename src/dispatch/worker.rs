use chrono::Utc;
use futures_util::stream::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerSettings;
use crate::error::{StoreError, StoreResult};
use crate::metrics::Metrics;
use crate::notifications::{NotificationStream, Notifier, NEW_ITEM_CHANNEL};
use crate::priority_queue::{LeasedItem, PriorityQueueStore};
use super::lease_keeper::LeaseKeeper;

// ============================================================================
// Dispatcher & Worker
// ============================================================================
//
// Dispatcher: enqueue an item for its discriminator and announce it.
//
// Worker, per item:
// 1. lease the next eligible item (or wait for a wake-up / poll interval)
// 2. run the handler while a LeaseKeeper renews the lease
// 3. acknowledge on success, defer on failure
//
// ============================================================================

/// First-come first-served: priority is the enqueue time in ms.
fn now_priority() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct Dispatcher<T> {
    queue: Arc<dyn PriorityQueueStore<T>>,
    notifier: Arc<dyn Notifier>,
}

impl<T> Dispatcher<T>
where
    T: Send + 'static,
{
    pub fn new(queue: Arc<dyn PriorityQueueStore<T>>, notifier: Arc<dyn Notifier>) -> Self {
        Self { queue, notifier }
    }

    pub async fn dispatch(&self, item: T, discriminator: &str) -> StoreResult<()> {
        self.queue.enqueue(item, discriminator, now_priority()).await?;

        // Advisory: workers fall back to polling.
        if let Err(error) = self.notifier.publish(NEW_ITEM_CHANNEL, discriminator).await {
            tracing::warn!(error = %error, "Failed to announce new queue item");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Acknowledged,
    Deferred,
    /// The lease expired or was taken over while the handler ran
    LeaseLost,
}

pub struct Worker<T> {
    queue: Arc<dyn PriorityQueueStore<T>>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<Metrics>,
    settings: WorkerSettings,
    subscription: Mutex<Option<NotificationStream>>,
}

impl<T> Worker<T>
where
    T: Send + 'static,
{
    pub fn new(
        queue: Arc<dyn PriorityQueueStore<T>>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<Metrics>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            notifier,
            metrics,
            settings,
            subscription: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Process at most one item. `None` means nothing was eligible; the call
    /// has then already waited for a wake-up or the poll interval.
    pub async fn process_next<F, Fut>(&self, handler: &F) -> StoreResult<Option<ProcessOutcome>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let Some(leased) = self.queue.lock_next().await? else {
            self.wait_for_work().await;
            return Ok(None);
        };
        self.metrics.items_leased.inc();

        let LeasedItem { item, metadata } = leased;
        tracing::debug!(discriminator = %metadata.discriminator, "Processing queue item");

        let keeper = LeaseKeeper::spawn(
            Arc::clone(&self.queue),
            metadata.clone(),
            self.settings.renew_interval,
            Arc::clone(&self.metrics),
        );

        let started = Instant::now();
        let result = handler(item).await;
        let still_held = keeper.stop().await;
        let elapsed = started.elapsed().as_secs_f64();

        if !still_held {
            tracing::warn!(
                discriminator = %metadata.discriminator,
                "Lease lost while processing, leaving the item to its new owner"
            );
            return Ok(Some(ProcessOutcome::LeaseLost));
        }

        if let Err(error) = &result {
            if matches!(
                error.downcast_ref::<StoreError>(),
                Some(StoreError::RevisionAlreadyExists { .. })
            ) {
                self.metrics.revision_conflicts.inc();
            }
            tracing::warn!(
                discriminator = %metadata.discriminator,
                error = %error,
                "Handler failed, deferring item"
            );
        }

        let settled = match &result {
            Ok(()) => {
                self.queue
                    .acknowledge(&metadata.discriminator, metadata.token)
                    .await
            }
            Err(_) => {
                self.queue
                    .defer(&metadata.discriminator, metadata.token, now_priority())
                    .await
            }
        };

        match settled {
            Ok(()) => {}
            Err(StoreError::TokenMismatch(_)) | Err(StoreError::ItemNotFound(_)) => {
                tracing::warn!(
                    discriminator = %metadata.discriminator,
                    "Lease went stale before the item was settled"
                );
                return Ok(Some(ProcessOutcome::LeaseLost));
            }
            Err(error) => return Err(error),
        }

        self.metrics.record_processed(elapsed, result.is_ok());

        Ok(Some(if result.is_ok() {
            ProcessOutcome::Acknowledged
        } else {
            ProcessOutcome::Deferred
        }))
    }

    /// Process items until `shutdown` fires. An item in flight is finished
    /// first.
    pub async fn run<F, Fut>(&self, handler: F, shutdown: CancellationToken)
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        tracing::info!("Worker started");

        while !shutdown.is_cancelled() {
            if let Err(error) = self.process_next(&handler).await {
                tracing::error!(error = %error, "Worker iteration failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }

        tracing::info!("Worker stopped");
    }

    async fn wait_for_work(&self) {
        let mut subscription = self.subscription.lock().await;

        if subscription.is_none() {
            match self.notifier.subscribe(NEW_ITEM_CHANNEL).await {
                Ok(stream) => *subscription = Some(stream),
                Err(error) => {
                    tracing::warn!(error = %error, "Could not subscribe to queue notifications");
                }
            }
        }

        let closed = match subscription.as_mut() {
            Some(stream) => tokio::select! {
                message = stream.next() => matches!(message, None | Some(Err(_))),
                _ = tokio::time::sleep(self.settings.poll_interval) => false,
            },
            None => {
                tokio::time::sleep(self.settings.poll_interval).await;
                false
            }
        };

        if closed {
            // Resubscribe on the next wait.
            *subscription = None;
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::InMemoryNotifier;
    use crate::priority_queue::InMemoryPriorityQueueStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        queue: Arc<dyn PriorityQueueStore<String>>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<Metrics>,
    }

    fn harness() -> Harness {
        Harness {
            queue: Arc::new(InMemoryPriorityQueueStore::new(Duration::from_secs(15))),
            notifier: Arc::new(InMemoryNotifier::new()),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn settings(poll_interval: Duration) -> WorkerSettings {
        WorkerSettings {
            renew_interval: Duration::from_millis(10),
            poll_interval,
            concurrency: 1,
        }
    }

    impl Harness {
        fn dispatcher(&self) -> Dispatcher<String> {
            Dispatcher::new(Arc::clone(&self.queue), Arc::clone(&self.notifier))
        }

        fn worker(&self, poll_interval: Duration) -> Worker<String> {
            Worker::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.notifier),
                Arc::clone(&self.metrics),
                settings(poll_interval),
            )
        }
    }

    #[tokio::test]
    async fn test_successful_item_is_acknowledged() {
        let harness = harness();
        harness.dispatcher().dispatch("execute".to_string(), "A").await.unwrap();

        let worker = harness.worker(Duration::from_millis(10));
        let outcome = worker
            .process_next(&|item: String| async move {
                assert_eq!(item, "execute");
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::Acknowledged));
        assert_eq!(harness.metrics.items_acknowledged.get(), 1);
        assert!(harness.queue.lock_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_item_is_deferred_and_retried() {
        let harness = harness();
        harness.dispatcher().dispatch("execute".to_string(), "A").await.unwrap();

        let worker = harness.worker(Duration::from_millis(10));
        let outcome = worker
            .process_next(&|_item: String| async move {
                Err(anyhow::Error::new(StoreError::RevisionAlreadyExists {
                    aggregate_id: uuid::Uuid::new_v4(),
                    revision: 2,
                }))
            })
            .await
            .unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::Deferred));
        assert_eq!(harness.metrics.items_deferred.get(), 1);
        assert_eq!(harness.metrics.revision_conflicts.get(), 1);

        let retried = harness.queue.lock_next().await.unwrap().unwrap();
        assert_eq!(retried.item, "execute");
    }

    #[tokio::test]
    async fn test_empty_queue_waits_for_poll_interval() {
        let harness = harness();
        let worker = harness.worker(Duration::from_millis(20));

        let started = Instant::now();
        let outcome = worker.process_next(&|_item: String| async { Ok(()) }).await.unwrap();

        assert!(outcome.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_dispatch_wakes_waiting_worker() {
        let harness = harness();
        let worker = harness.worker(Duration::from_secs(30));
        let dispatcher = harness.dispatcher();

        let waiting = async {
            tokio::time::timeout(
                Duration::from_secs(5),
                worker.process_next(&|_item: String| async { Ok(()) }),
            )
            .await
        };
        let dispatching = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            dispatcher.dispatch("execute".to_string(), "A").await.unwrap();
        };

        let (woken, ()) = tokio::join!(waiting, dispatching);
        assert!(woken.unwrap().unwrap().is_none());

        let outcome = worker.process_next(&|_item: String| async { Ok(()) }).await.unwrap();
        assert_eq!(outcome, Some(ProcessOutcome::Acknowledged));
    }

    #[tokio::test]
    async fn test_items_of_one_discriminator_are_processed_in_order() {
        let harness = harness();
        let dispatcher = harness.dispatcher();
        for step in ["first", "second", "third"] {
            dispatcher.dispatch(step.to_string(), "A").await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let worker = harness.worker(Duration::from_millis(10));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            worker
                .process_next(&move |item: String| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(item);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let harness = harness();
        let dispatcher = harness.dispatcher();
        for discriminator in ["A", "B", "C"] {
            dispatcher
                .dispatch(discriminator.to_string(), discriminator)
                .await
                .unwrap();
        }

        let worker = Arc::new(harness.worker(Duration::from_millis(10)));
        let processed = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let running = {
            let worker = Arc::clone(&worker);
            let processed = Arc::clone(&processed);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker
                    .run(
                        move |_item: String| {
                            let processed = Arc::clone(&processed);
                            async move {
                                processed.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        },
                        shutdown,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 3);
    }
}
