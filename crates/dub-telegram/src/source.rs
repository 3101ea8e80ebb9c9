use std::time::Duration;

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{AllowedUpdate, Chat, Update, UpdateKind},
};
use tracing::debug;

use dub_core::{
    domain::{ChatId, ChatKind, Event, EventKind, IncomingMessage, MessageId, Sender, UserId},
    errors::Error,
    ports::EventSource,
    Result,
};

/// `getUpdates` long polling.
#[derive(Clone)]
pub struct TelegramSource {
    bot: Bot,
    timeout: Duration,
}

impl TelegramSource {
    /// `bot` should come from [`crate::build_bot`] so its HTTP timeout exceeds `timeout`.
    pub fn new(bot: Bot, timeout: Duration) -> Self {
        Self { bot, timeout }
    }
}

#[async_trait]
impl EventSource for TelegramSource {
    async fn poll(&self, offset: u64) -> Result<Vec<Event>> {
        let next = i32::try_from(offset.saturating_add(1))
            .map_err(|_| Error::External(format!("update offset {offset} out of range")))?;
        let timeout = u32::try_from(self.timeout.as_secs()).unwrap_or(u32::MAX);

        let updates = self
            .bot
            .get_updates()
            .offset(next)
            .timeout(timeout)
            .allowed_updates(vec![AllowedUpdate::Message])
            .await
            .map_err(|e| Error::External(format!("getUpdates failed: {e}")))?;

        debug!(offset, count = updates.len(), "polled updates");
        Ok(updates.into_iter().filter_map(to_event).collect())
    }

    /// Nothing to release: an in-flight `getUpdates` is aborted when the pipeline
    /// drops its future, and unacknowledged updates stay queued on Telegram's side.
    async fn stop(&self) {
        debug!("telegram long polling stopped");
    }
}

fn chat_kind(chat: &Chat) -> ChatKind {
    if chat.is_private() {
        ChatKind::Private
    } else if chat.is_supergroup() {
        ChatKind::SuperGroup
    } else if chat.is_group() {
        ChatKind::Group
    } else {
        ChatKind::Channel
    }
}

/// Updates with a negative id cannot be acknowledged and are skipped.
fn to_event(update: Update) -> Option<Event> {
    let update_id = u64::try_from(update.id).ok()?;

    let kind = match update.kind {
        UpdateKind::Message(msg) => match (msg.from(), msg.text()) {
            (Some(user), Some(text)) => match i64::try_from(user.id.0) {
                Ok(sender_id) => EventKind::Message(IncomingMessage {
                    chat_id: ChatId(msg.chat.id.0),
                    chat_kind: chat_kind(&msg.chat),
                    message_id: MessageId(msg.id.0),
                    sender: Sender {
                        id: UserId(sender_id),
                        username: user.username.clone(),
                    },
                    text: text.to_string(),
                }),
                Err(_) => EventKind::Other,
            },
            _ => EventKind::Other,
        },
        _ => EventKind::Other,
    };

    Some(Event { update_id, kind })
}
