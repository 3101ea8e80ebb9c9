/// Telegram chat id (numeric). Doubles as the ledger scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram user id (numeric). Doubles as the ledger account id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChatKind {
    Private,
    Group,
    SuperGroup,
    Channel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sender {
    pub id: UserId,
    pub username: Option<String>,
}

/// A text message as seen by the command router.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub message_id: MessageId,
    pub sender: Sender,
    pub text: String,
}

#[derive(Clone, Debug)]
pub enum EventKind {
    Message(IncomingMessage),
    /// Anything we do not handle. Still carries an update id so the cursor moves past it.
    Other,
}

/// One upstream update, ordered by `update_id`.
#[derive(Clone, Debug)]
pub struct Event {
    pub update_id: u64,
    pub kind: EventKind,
}
