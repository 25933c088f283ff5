use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::priority_queue::{LeaseMetadata, PriorityQueueStore};

// ============================================================================
// Lease Keeper
// ============================================================================
//
// Renews a queue lease in the background while its item is processed. The
// task ends when `stop()` is called, when the keeper is dropped, or on the
// first failed renewal (the lease then counts as lost).
//
// ============================================================================

pub struct LeaseKeeper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl LeaseKeeper {
    pub fn spawn<T>(
        queue: Arc<dyn PriorityQueueStore<T>>,
        lease: LeaseMetadata,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self
    where
        T: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        let task_cancel = cancel.clone();
        let task_lost = Arc::clone(&lost);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match queue.renew_lock(&lease.discriminator, lease.token).await {
                            Ok(()) => metrics.record_renewal(true),
                            Err(error) => {
                                tracing::warn!(
                                    discriminator = %lease.discriminator,
                                    error = %error,
                                    "Lease renewal failed, giving up the item"
                                );
                                metrics.record_renewal(false);
                                task_lost.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
            lost,
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and wait for the task to finish. Returns whether the
    /// lease was still held.
    pub async fn stop(mut self) -> bool {
        self.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, "Lease keeper task failed");
                return false;
            }
        }

        !self.is_lost()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
