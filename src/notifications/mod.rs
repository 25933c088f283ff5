// ============================================================================
// Notifications
// ============================================================================
//
// Advisory wake-up channel: publishers announce that something changed,
// subscribers stop waiting and re-poll. Messages may be dropped; nothing
// relies on receiving every one of them.
//
// ============================================================================

mod in_memory;
mod postgres;

pub use in_memory::InMemoryNotifier;
pub use postgres::PostgresNotifier;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::{StoreError, StoreResult};

/// Channel the dispatcher announces new queue items on.
pub const NEW_ITEM_CHANNEL: &str = "new_item";

pub type NotificationStream = BoxStream<'static, StoreResult<String>>;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    /// Messages published after this call returns.
    async fn subscribe(&self, channel: &str) -> StoreResult<NotificationStream>;

    async fn setup(&self) -> StoreResult<()>;

    async fn destroy(&self) -> StoreResult<()>;
}

pub(crate) fn ensure_channel(channel: &str) -> StoreResult<()> {
    if channel.is_empty() {
        return Err(StoreError::parameter("channel must not be empty"));
    }
    Ok(())
}
