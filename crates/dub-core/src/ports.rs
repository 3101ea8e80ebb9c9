use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChatId, Event, UserId},
    reply::Reply,
    Result,
};

/// Upstream update feed (Telegram long polling today).
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch the next batch of events with `update_id > offset`.
    ///
    /// May block for the source's own long-poll timeout. The pipeline drops this
    /// future on shutdown, so implementations must be cancel-safe.
    async fn poll(&self, offset: u64) -> Result<Vec<Event>>;

    /// Called once after the last poll, when any in-flight poll future has
    /// already been dropped. Sources holding resources beyond that future release them here.
    async fn stop(&self) {}
}

/// Outbound reply channel. Errors are logged by callers, never retried by them.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, reply: &Reply) -> Result<()>;
}

/// Chat membership lookups used for admin-only commands.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn is_admin(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;
}

/// The unit of work run by the dispatch pipeline for every event.
///
/// Errors are logged by the pipeline and never re-raised.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, event: Event) -> Result<()>;
}
