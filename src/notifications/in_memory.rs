use async_trait::async_trait;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::StoreResult;
use super::{ensure_channel, NotificationStream, Notifier};

/// Per-channel capacity; slow subscribers skip what they missed
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        ensure_channel(channel)?;

        // No receivers is fine; nobody is waiting.
        let delivered = self.sender(channel).await.send(message.to_string()).unwrap_or(0);
        tracing::trace!(channel = %channel, delivered = delivered, "Published notification");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<NotificationStream> {
        ensure_channel(channel)?;

        let receiver = self.sender(channel).await.subscribe();
        let channel = channel.to_string();

        Ok(BroadcastStream::new(receiver)
            .filter_map(move |message| {
                let message = match message {
                    Ok(message) => Some(Ok(message)),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::debug!(channel = %channel, skipped = skipped, "Subscriber lagged");
                        None
                    }
                };
                futures_util::future::ready(message)
            })
            .boxed())
    }

    async fn setup(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        // Dropping the senders ends every open subscription.
        self.channels.lock().await.clear();
        Ok(())
    }
}
