use chrono::Utc;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cqrs_persistence::config::Settings;
use cqrs_persistence::consumer_progress::ConsumerProgressStore;
use cqrs_persistence::dispatch::{Dispatcher, Worker};
use cqrs_persistence::event_sourcing::{
    AggregateIdentifier, DomainEvent, DomainEventStore, Snapshot, SnapshotStrategy,
};
use cqrs_persistence::metrics::Metrics;
use cqrs_persistence::utils::LockKey;
use cqrs_persistence::{factory, telemetry, StoreError};

/// Attempts per command when another writer claims the next revision first
const APPEND_ATTEMPTS: u32 = 3;

const CONSUMER_ID: &str = "demo-view";

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct Command {
    id: Uuid,
    aggregate_identifier: AggregateIdentifier,
    name: String,
    data: Value,
}

struct Handler {
    event_store: Arc<dyn DomainEventStore>,
    progress: Arc<dyn ConsumerProgressStore>,
    metrics: Arc<Metrics>,
    snapshot_strategy: SnapshotStrategy,
}

impl Handler {
    /// Append one event for the command, re-reading the head on conflicts.
    async fn handle(&self, command: Command) -> anyhow::Result<()> {
        let mut attempt = 0;

        let event = loop {
            attempt += 1;

            let revision = self
                .event_store
                .get_last_domain_event(&command.aggregate_identifier)
                .await?
                .map_or(1, |last| last.revision() + 1);

            let event = DomainEvent::new(
                command.aggregate_identifier.clone(),
                format!("{}Executed", command.name),
                &command.data,
                revision,
            )?
            .with_causation_id(command.id)
            .with_correlation_id(command.id);

            match self.event_store.store_domain_events(vec![event.clone()]).await {
                Ok(()) => break event,
                Err(error @ StoreError::RevisionAlreadyExists { .. }) if attempt < APPEND_ATTEMPTS => {
                    self.metrics.revision_conflicts.inc();
                    tracing::warn!(attempt = attempt, error = %error, "Revision taken, retrying");
                }
                Err(error) => return Err(error.into()),
            }
        };

        self.progress
            .set_progress(CONSUMER_ID, &command.aggregate_identifier, event.revision())
            .await?;

        self.maybe_snapshot(&command.aggregate_identifier).await?;

        tracing::info!(
            aggregate = %command.aggregate_identifier,
            revision = event.revision(),
            event = %event.name,
            "✅ Command handled"
        );
        Ok(())
    }

    async fn maybe_snapshot(&self, aggregate: &AggregateIdentifier) -> anyhow::Result<()> {
        let snapshot = self.event_store.get_snapshot(aggregate).await?;
        let from_revision = snapshot.as_ref().map_or(1, |snapshot| snapshot.revision + 1);
        let mut count = snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.state["handled"].as_i64())
            .unwrap_or(0);

        let started = Instant::now();
        let replayed: Vec<DomainEvent> = self
            .event_store
            .get_replay_for_aggregate(aggregate.id(), Some(from_revision), None)
            .await?
            .try_collect()
            .await?;

        let Some(last) = replayed.last() else {
            return Ok(());
        };
        count += replayed.len() as i64;

        if self
            .snapshot_strategy
            .should_snapshot(replayed.len() as i64, started.elapsed())
        {
            let snapshot = Snapshot::new(aggregate.clone(), last.revision(), &json!({ "handled": count }))?;
            self.event_store.store_snapshot(snapshot).await?;
            tracing::debug!(aggregate = %aggregate, revision = last.revision(), "Snapshot stored");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    telemetry::init_tracing(&settings.logging);

    tracing::info!("🚀 Starting cqrs-persistence demo");
    tracing::info!(
        event_store = settings.event_store.kind(),
        lock_store = settings.lock_store.kind(),
        priority_queue_store = settings.priority_queue_store.kind(),
        consumer_progress_store = settings.consumer_progress_store.kind(),
        notifications = settings.notifications.kind(),
        "Backends selected"
    );

    // === 1. Build stores ===
    let event_store = factory::create_event_store(&settings.event_store).await?;
    let lock_store = factory::create_lock_store(&settings.lock_store).await?;
    let queue = factory::create_priority_queue_store::<Command>(
        &settings.priority_queue_store,
        settings.queue.expiration_time,
    )
    .await?;
    let progress = factory::create_consumer_progress_store(&settings.consumer_progress_store).await?;
    let notifier = factory::create_notifier(&settings.notifications).await?;

    // === 2. Schema setup under a lock ===
    let setup_lock = LockKey::from_value(&json!({ "name": "schema-setup" }))?;
    lock_store.setup().await?;
    lock_store
        .acquire_lock(&setup_lock, Utc::now() + chrono::Duration::seconds(30))
        .await?;

    event_store.setup().await?;
    queue.setup().await?;
    progress.setup().await?;
    notifier.setup().await?;

    lock_store.release_lock(&setup_lock).await?;
    tracing::info!("📦 Schema ready");

    // === 3. Dispatch demo commands ===
    let metrics = Arc::new(Metrics::new()?);
    let dispatcher = Dispatcher::new(Arc::clone(&queue), Arc::clone(&notifier));

    let aggregates = [
        AggregateIdentifier::new("sales", "order", Uuid::new_v4()),
        AggregateIdentifier::new("sales", "order", Uuid::new_v4()),
    ];
    let commands_per_aggregate = 3;

    for step in 0..commands_per_aggregate {
        for aggregate in &aggregates {
            let command = Command {
                id: Uuid::new_v4(),
                aggregate_identifier: aggregate.clone(),
                name: "advance".to_string(),
                data: json!({ "step": step }),
            };
            dispatcher.dispatch(command, &aggregate.discriminator()).await?;
        }
    }
    let expected = (aggregates.len() * commands_per_aggregate) as u64;
    tracing::info!(commands = expected, "📝 Commands dispatched");

    // === 4. Run workers ===
    let handler = Arc::new(Handler {
        event_store: Arc::clone(&event_store),
        progress: Arc::clone(&progress),
        metrics: Arc::clone(&metrics),
        snapshot_strategy: settings.snapshot_strategy.clone(),
    });
    let shutdown = CancellationToken::new();

    let workers: Vec<_> = (0..settings.worker.concurrency.max(1))
        .map(|index| {
            let worker = Worker::new(
                Arc::clone(&queue),
                Arc::clone(&notifier),
                Arc::clone(&metrics),
                settings.worker.clone(),
            );
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                tracing::debug!(worker = index, "Spawning worker");
                worker
                    .run(
                        move |command: Command| {
                            let handler = Arc::clone(&handler);
                            async move { handler.handle(command).await }
                        },
                        shutdown,
                    )
                    .await;
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(30);
    while metrics.items_acknowledged.get() < expected && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
    for worker in workers {
        worker.await?;
    }

    // === 5. Replay ===
    for aggregate in &aggregates {
        let events: Vec<DomainEvent> = event_store
            .get_replay_for_aggregate(aggregate.id(), None, None)
            .await?
            .try_collect()
            .await?;

        let watermark = progress.get_progress(CONSUMER_ID, aggregate).await?;
        tracing::info!(
            aggregate = %aggregate,
            events = events.len(),
            watermark = watermark.revision,
            "🔁 Replayed aggregate"
        );
        for event in &events {
            tracing::info!(revision = event.revision(), name = %event.name, data = %event.data, "  event");
        }
    }

    let known: Vec<AggregateIdentifier> = event_store
        .get_aggregate_identifiers_by_name("sales", "order")
        .await?
        .try_collect()
        .await?;
    tracing::info!(aggregates = known.len(), "Known aggregates");

    // === 6. Metrics & teardown ===
    tracing::info!("📊 Metrics\n{}", metrics.render()?);

    notifier.destroy().await?;
    progress.destroy().await?;
    queue.destroy().await?;
    event_store.destroy().await?;
    lock_store.destroy().await?;

    tracing::info!("🎉 Demo complete!");
    Ok(())
}
