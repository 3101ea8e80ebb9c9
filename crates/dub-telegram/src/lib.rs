//! Telegram adapter (teloxide).
//!
//! Implements the `dub-core` ports over the Telegram Bot API: long polling as an
//! [`EventSource`](dub_core::ports::EventSource), and sending plus member lookups
//! on [`TelegramMessenger`].

use std::time::Duration;

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{KeyboardButton, KeyboardMarkup, ParseMode},
};
use tokio::time::sleep;

mod source;

pub use source::TelegramSource;

use dub_core::{
    domain::{ChatId, UserId},
    errors::Error,
    ports::{MemberDirectory, ReplySink},
    reply::{Reply, ReplyKeyboard},
    Result,
};

/// Slack on top of the long-poll timeout before the HTTP client gives up.
const HTTP_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Build a bot whose HTTP client outlives a `poll_timeout` long poll.
pub fn build_bot(token: &str, poll_timeout: Duration) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(poll_timeout + HTTP_TIMEOUT_MARGIN)
        .build()
        .map_err(|e| Error::External(format!("failed to build http client: {e}")))?;
    Ok(Bot::with_client(token, client))
}

/// The bot's own username, without the leading `@`.
pub async fn bot_username(bot: &Bot) -> Result<String> {
    let me = bot.get_me().await.map_err(TelegramMessenger::map_err)?;
    Ok(me.username().to_string())
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

fn keyboard_markup(keyboard: &ReplyKeyboard) -> KeyboardMarkup {
    let rows: Vec<Vec<KeyboardButton>> = keyboard
        .rows
        .iter()
        .map(|row| row.iter().map(|label| KeyboardButton::new(label.clone())).collect())
        .collect();
    KeyboardMarkup::new(rows).resize_keyboard(true)
}

#[async_trait]
impl ReplySink for TelegramMessenger {
    async fn send(&self, reply: &Reply) -> Result<()> {
        let markup = reply.keyboard.as_ref().map(keyboard_markup);

        self.with_retry(|| {
            let mut req = self
                .bot
                .send_message(Self::tg_chat(reply.chat_id), reply.html.clone())
                .parse_mode(ParseMode::Html);
            if let Some(id) = reply.reply_to {
                req = req.reply_to_message_id(teloxide::types::MessageId(id.0));
            }
            if let Some(markup) = &markup {
                req = req.reply_markup(markup.clone());
            }
            req
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MemberDirectory for TelegramMessenger {
    async fn is_admin(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let user = u64::try_from(user_id.0)
            .map(teloxide::types::UserId)
            .map_err(|_| Error::External(format!("invalid user id {}", user_id.0)))?;

        let member = self
            .with_retry(|| self.bot.get_chat_member(Self::tg_chat(chat_id), user))
            .await?;
        Ok(member.kind.is_privileged())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_rows_keep_their_layout() {
        let kb = ReplyKeyboard::new(&[&["Start", "Roll the dice"], &["My balance"]]);
        let markup = keyboard_markup(&kb);

        let texts: Vec<Vec<&str>> = markup
            .keyboard
            .iter()
            .map(|row| row.iter().map(|b| b.text.as_str()).collect())
            .collect();
        assert_eq!(texts, vec![vec!["Start", "Roll the dice"], vec!["My balance"]]);
    }

    #[test]
    fn builds_a_bot_with_a_long_poll_friendly_client() {
        assert!(build_bot("123:abc", Duration::from_secs(60)).is_ok());
    }
}
