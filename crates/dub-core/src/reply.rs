//! Outgoing replies and the transforms applied to them before sending.

use crate::{
    commands::labels,
    domain::{ChatId, ChatKind, IncomingMessage, MessageId},
};

/// Reply keyboard shown under the input field. Each inner vec is one row of button labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyKeyboard {
    pub rows: Vec<Vec<String>>,
}

impl ReplyKeyboard {
    pub fn new(rows: &[&[&str]]) -> Self {
        Self {
            rows: rows
                .iter()
                .map(|row| row.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }
}

/// An HTML message to post back into a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub chat_id: ChatId,
    pub html: String,
    pub reply_to: Option<MessageId>,
    pub keyboard: Option<ReplyKeyboard>,
}

impl Reply {
    pub fn html(chat_id: ChatId, html: impl Into<String>) -> Self {
        Self {
            chat_id,
            html: html.into(),
            reply_to: None,
            keyboard: None,
        }
    }
}

/// What a transform may look at. Computed once per message, before the transforms run.
#[derive(Clone, Copy, Debug)]
pub struct ReplyContext<'a> {
    pub message: &'a IncomingMessage,
    /// Whether the sender already has a wallet in this chat.
    pub sender_registered: bool,
}

pub type ReplyTransform = fn(Reply, &ReplyContext<'_>) -> Reply;

pub fn apply_transforms(reply: Reply, ctx: &ReplyContext<'_>, transforms: &[ReplyTransform]) -> Reply {
    transforms.iter().fold(reply, |reply, t| t(reply, ctx))
}

/// Attach the main menu keyboard.
pub fn with_main_menu(mut reply: Reply, ctx: &ReplyContext<'_>) -> Reply {
    reply.keyboard = Some(main_menu(ctx.message.chat_kind, ctx.sender_registered));
    reply
}

/// Quote the message that triggered the reply.
pub fn reply_to_source(mut reply: Reply, ctx: &ReplyContext<'_>) -> Reply {
    reply.reply_to = Some(ctx.message.message_id);
    reply
}

pub fn main_menu(chat_kind: ChatKind, registered: bool) -> ReplyKeyboard {
    if chat_kind == ChatKind::Private && !registered {
        return ReplyKeyboard::new(&[&[labels::START]]);
    }

    if registered {
        ReplyKeyboard::new(&[&[labels::DICE], &[labels::BALANCE, labels::SEND]])
    } else {
        ReplyKeyboard::new(&[
            &[labels::START, labels::DICE],
            &[labels::BALANCE, labels::SEND],
        ])
    }
}
