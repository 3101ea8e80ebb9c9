//! The wallet/dice bot: the handler the dispatch pipeline runs for every event.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    commands::{
        command_params, parse_amount, sanitize_username, Action, CommandError, CommandSpec,
        CommandTable, Resolution,
    },
    domain::{ChatKind, Event, EventKind, IncomingMessage, UserId},
    errors::Error,
    formatting::{escape_html, mention},
    ledger::{Ledger, LedgerError},
    ports::{MemberDirectory, ReplySink, UpdateHandler},
    reply::{apply_transforms, reply_to_source, with_main_menu, Reply, ReplyContext, ReplyTransform},
    Result,
};

mod texts {
    pub const NOT_IMPLEMENTED: &str =
        "Hi! I am a D&amp;D helper bot. I can't do that yet, but I'm glad to see you! 😀";
    pub const RIGHTS_VIOLATION: &str = "Whoa, slow down. Who allowed you to do that? 🚨";
    pub const INVALID_INTEGER: &str = "That number doesn't look right. Think again.";
    pub const SELF_TRANSFER: &str = "You call that a transaction? Don't let me see that again.";
    pub const INSUFFICIENT_MONEY: &str = "Not enough money in the wallet for that. 💸";
    pub const BALANCE_OVERFLOW: &str = "That much money won't fit into one wallet. 🏦";
    pub const USERNAME_HIDDEN: &str =
        "Your username is hidden. Set a public @username in Telegram settings to send money.";
    pub const NOT_REGISTERED: &str = "That player hasn't opened a wallet in this chat yet.";
}

const ERROR_TRANSFORMS: &[ReplyTransform] = &[with_main_menu, reply_to_source];

const KEYCAPS: [&str; 10] = ["0️⃣", "1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣"];

pub fn roll_d20() -> u8 {
    rand::thread_rng().gen_range(1..=20)
}

/// Keycap digits for a d20 result, e.g. `1️⃣7️⃣`. Anything outside 1..=20 is a plain die.
pub fn d20_emoji(roll: u8) -> String {
    match roll {
        10 => "🔟".to_string(),
        1..=20 => roll
            .to_string()
            .bytes()
            .map(|d| KEYCAPS[usize::from(d - b'0')])
            .collect(),
        _ => "🎲".to_string(),
    }
}

pub struct LedgerBot {
    ledger: Arc<dyn Ledger>,
    sink: Arc<dyn ReplySink>,
    directory: Arc<dyn MemberDirectory>,
    commands: Arc<CommandTable>,
    bot_name: Option<String>,
}

impl LedgerBot {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        sink: Arc<dyn ReplySink>,
        directory: Arc<dyn MemberDirectory>,
        commands: Arc<CommandTable>,
        bot_name: Option<String>,
    ) -> Self {
        Self {
            ledger,
            sink,
            directory,
            commands,
            bot_name,
        }
    }

    /// Map the sender's username and open a zero wallet in this chat if needed.
    ///
    /// Returns whether the sender ends up registered. Storage errors are logged by the ledger.
    async fn register_if_needed(&self, msg: &IncomingMessage) -> bool {
        let sender = &msg.sender;
        if let Some(name) = sender.username.as_deref() {
            if self.ledger.get_account_id(name).await.is_none()
                && self.ledger.save_name_mapping(name, sender.id).await.is_ok()
            {
                debug!(user_id = sender.id.0, "saved name mapping for @{name}");
            }
        }

        match self.ledger.open_account(msg.chat_id, sender.id).await {
            Ok(created) => {
                if created {
                    info!(
                        chat_id = msg.chat_id.0,
                        user_id = sender.id.0,
                        "opened wallet"
                    );
                }
                true
            }
            Err(_) => false,
        }
    }

    async fn account(&self, name: &str) -> std::result::Result<UserId, CommandError> {
        self.ledger
            .get_account_id(sanitize_username(name))
            .await
            .ok_or_else(|| CommandError::UnknownUser(name.to_string()))
    }

    async fn execute(
        &self,
        spec: &CommandSpec,
        msg: &IncomingMessage,
    ) -> std::result::Result<String, CommandError> {
        let scope = msg.chat_id;
        let params = command_params(&msg.text, self.bot_name.as_deref());

        match spec.action {
            Action::Start => {
                let balance = self.ledger.get_balance(scope, msg.sender.id).await?;
                Ok(format!(
                    "Hi! I am a D&amp;D helper bot. Your wallet is open. You have {balance} 💰."
                ))
            }
            Action::Help => Ok(self
                .commands
                .help_html(msg.chat_kind)
                .unwrap_or_default()
                .to_string()),
            Action::Balance => {
                let balance = self.ledger.get_balance(scope, msg.sender.id).await?;
                Ok(format!("Your balance: {balance} 💰"))
            }
            Action::SendPrompt => {
                let usage = self
                    .commands
                    .spec(msg.chat_kind, Action::Send)
                    .map(|s| s.usage_text())
                    .unwrap_or_else(|| "/send @username 123".to_string());
                Ok(format!(
                    "To send money to a player, write:\n<code>{}</code>",
                    escape_html(&usage)
                ))
            }
            Action::Send => {
                if params.len() < 3 {
                    return Err(CommandError::InvalidParameters);
                }
                let amount = parse_amount(params[2], false)?;
                let from_name = msg
                    .sender
                    .username
                    .as_deref()
                    .ok_or(CommandError::UsernameHidden)?;
                let to = self.account(params[1]).await?;

                self.ledger.transfer(scope, msg.sender.id, to, amount).await?;
                Ok(format!(
                    "{amount} 💰 went from {} to {}",
                    mention(from_name),
                    mention(params[1])
                ))
            }
            Action::Dice => {
                let roll = roll_d20();
                Ok(format!("🎲 {} ({roll})", d20_emoji(roll)))
            }
            Action::GetUserBalance => {
                if params.len() < 2 {
                    return Err(CommandError::InvalidParameters);
                }
                let account = self.account(params[1]).await?;
                let balance = self.ledger.get_balance(scope, account).await?;
                Ok(format!("Balance of {}: {balance} 💰", mention(params[1])))
            }
            Action::SetUserBalance => {
                if params.len() < 3 {
                    return Err(CommandError::InvalidParameters);
                }
                let amount = parse_amount(params[2], true)?;
                let account = self.account(params[1]).await?;
                self.ledger.set_balance(scope, account, amount).await?;
                Ok(format!(
                    "Balance of {} is now {amount} 💰",
                    mention(params[1])
                ))
            }
            Action::Transaction => {
                if params.len() < 4 {
                    return Err(CommandError::InvalidParameters);
                }
                let amount = parse_amount(params[3], false)?;
                let from = self.account(params[1]).await?;
                let to = self.account(params[2]).await?;
                self.ledger.transfer(scope, from, to, amount).await?;
                Ok(format!(
                    "{amount} 💰 went from {} to {}",
                    mention(params[1]),
                    mention(params[2])
                ))
            }
        }
    }

    async fn send(&self, reply: Reply) {
        if let Err(e) = self.sink.send(&reply).await {
            warn!(chat_id = reply.chat_id.0, "failed to send reply: {e}");
        }
    }
}

/// User-facing text for expected failures. `None` for storage failures.
fn error_text(spec: &CommandSpec, err: &CommandError) -> Option<String> {
    let text = match err {
        CommandError::InvalidParameters => format!(
            "Those parameters are wrong. Here is how it's done:\n<code>{}</code>",
            escape_html(&spec.usage_text())
        ),
        CommandError::InvalidIntegerParameter => texts::INVALID_INTEGER.to_string(),
        CommandError::UsernameHidden => texts::USERNAME_HIDDEN.to_string(),
        CommandError::UnknownUser(name) => format!(
            "Player {} hasn't registered yet, so no transaction for you :)",
            mention(name)
        ),
        CommandError::Ledger(e) => match e {
            LedgerError::NotRegistered => texts::NOT_REGISTERED.to_string(),
            LedgerError::InsufficientMoney => texts::INSUFFICIENT_MONEY.to_string(),
            LedgerError::BalanceOverflow => texts::BALANCE_OVERFLOW.to_string(),
            LedgerError::InvalidTransactionParameters => texts::SELF_TRANSFER.to_string(),
            LedgerError::Storage(_) | LedgerError::Corrupt(_) => return None,
        },
    };
    Some(text)
}

#[async_trait]
impl UpdateHandler for LedgerBot {
    async fn handle(&self, _cancel: &CancellationToken, event: Event) -> Result<()> {
        let EventKind::Message(msg) = event.kind else {
            return Ok(());
        };
        if msg.chat_kind == ChatKind::Channel {
            return Ok(());
        }

        let registered = self.register_if_needed(&msg).await;

        let (html, transforms) = match self.commands.resolve(&msg, self.directory.as_ref()).await {
            Resolution::Unresolved => return Ok(()),
            Resolution::NotImplemented => (texts::NOT_IMPLEMENTED.to_string(), ERROR_TRANSFORMS),
            Resolution::RightsViolation => {
                info!(
                    chat_id = msg.chat_id.0,
                    user_id = msg.sender.id.0,
                    "rejected admin command"
                );
                (texts::RIGHTS_VIOLATION.to_string(), ERROR_TRANSFORMS)
            }
            Resolution::Command(spec) => match self.execute(spec, &msg).await {
                Ok(html) => (html, spec.transforms),
                Err(err) => match error_text(spec, &err) {
                    Some(text) => {
                        debug!(command = spec.key, "command rejected: {err}");
                        (text, ERROR_TRANSFORMS)
                    }
                    None => {
                        return Err(match err {
                            CommandError::Ledger(e) => Error::Ledger(e),
                            other => Error::External(other.to_string()),
                        })
                    }
                },
            },
        };

        let ctx = ReplyContext {
            message: &msg,
            sender_registered: registered,
        };
        let reply = apply_transforms(Reply::html(msg.chat_id, html), &ctx, transforms);
        self.send(reply).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId, Sender};
    use crate::ledger::{LedgerResult, SqliteLedger, TransferOutcome};
    use std::sync::Mutex;

    const GROUP: ChatId = ChatId(-500);
    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    #[derive(Default)]
    struct FakeSink {
        sent: Mutex<Vec<Reply>>,
    }

    impl FakeSink {
        fn take(&self) -> Vec<Reply> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl ReplySink for FakeSink {
        async fn send(&self, reply: &Reply) -> Result<()> {
            self.sent.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    struct FakeDirectory {
        admin: bool,
    }

    #[async_trait]
    impl MemberDirectory for FakeDirectory {
        async fn is_admin(&self, _: ChatId, _: UserId) -> Result<bool> {
            Ok(self.admin)
        }
    }

    struct Harness {
        bot: LedgerBot,
        ledger: Arc<SqliteLedger>,
        sink: Arc<FakeSink>,
        next_id: std::sync::atomic::AtomicU64,
    }

    /// Always reports "not registered", as when the registration read fails.
    struct StaleReadLedger {
        inner: Arc<SqliteLedger>,
    }

    #[async_trait]
    impl Ledger for StaleReadLedger {
        async fn get_balance(&self, scope: ChatId, account: UserId) -> LedgerResult<u32> {
            self.inner.get_balance(scope, account).await
        }

        async fn set_balance(&self, scope: ChatId, account: UserId, amount: u64) -> LedgerResult<()> {
            self.inner.set_balance(scope, account, amount).await
        }

        async fn transfer(
            &self,
            scope: ChatId,
            from: UserId,
            to: UserId,
            amount: u64,
        ) -> LedgerResult<TransferOutcome> {
            self.inner.transfer(scope, from, to, amount).await
        }

        async fn is_registered(&self, _: ChatId, _: UserId) -> bool {
            false
        }

        async fn open_account(&self, scope: ChatId, account: UserId) -> LedgerResult<bool> {
            self.inner.open_account(scope, account).await
        }

        async fn get_account_id(&self, name: &str) -> Option<UserId> {
            self.inner.get_account_id(name).await
        }

        async fn save_name_mapping(&self, name: &str, account: UserId) -> LedgerResult<()> {
            self.inner.save_name_mapping(name, account).await
        }
    }

    impl Harness {
        fn new(admin: bool) -> Self {
            let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
            Self::with_ledger(admin, ledger.clone(), ledger)
        }

        /// `bot_ledger` is what the bot talks to; `ledger` is the store underneath it.
        fn with_ledger(
            admin: bool,
            bot_ledger: Arc<dyn Ledger>,
            ledger: Arc<SqliteLedger>,
        ) -> Self {
            let sink = Arc::new(FakeSink::default());
            let bot = LedgerBot::new(
                bot_ledger,
                sink.clone(),
                Arc::new(FakeDirectory { admin }),
                Arc::new(CommandTable::standard()),
                Some("dnd_bot".to_string()),
            );
            Self {
                bot,
                ledger,
                sink,
                next_id: Default::default(),
            }
        }

        async fn say_in(
            &self,
            chat_id: ChatId,
            chat_kind: ChatKind,
            from: UserId,
            username: Option<&str>,
            text: &str,
        ) -> Vec<Reply> {
            let id = self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let event = Event {
                update_id: id,
                kind: EventKind::Message(IncomingMessage {
                    chat_id,
                    chat_kind,
                    message_id: MessageId(id as i32 + 100),
                    sender: Sender {
                        id: from,
                        username: username.map(str::to_string),
                    },
                    text: text.to_string(),
                }),
            };
            self.bot
                .handle(&CancellationToken::new(), event)
                .await
                .unwrap();
            self.sink.take()
        }

        async fn say(&self, from: UserId, username: &str, text: &str) -> Vec<Reply> {
            self.say_in(GROUP, ChatKind::Group, from, Some(username), text)
                .await
        }

        async fn balance(&self, who: UserId) -> u32 {
            self.ledger.get_balance(GROUP, who).await.unwrap()
        }
    }

    #[tokio::test]
    async fn start_opens_a_wallet_and_maps_the_name() {
        let h = Harness::new(false);
        let replies = h.say(ALICE, "alice", "/start@dnd_bot").await;

        assert_eq!(replies.len(), 1);
        assert!(replies[0].html.contains("You have 0"), "{}", replies[0].html);
        assert!(replies[0].keyboard.is_some());
        assert!(h.ledger.is_registered(GROUP, ALICE).await);
        assert_eq!(h.ledger.get_account_id("alice").await, Some(ALICE));
    }

    #[tokio::test]
    async fn registration_never_resets_an_existing_balance() {
        let store = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let h = Harness::with_ledger(
            false,
            Arc::new(StaleReadLedger {
                inner: store.clone(),
            }),
            store,
        );
        h.ledger.set_balance(GROUP, BOB, 500).await.unwrap();

        h.say(BOB, "bob", "hello again").await;
        assert_eq!(h.balance(BOB).await, 500);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_messages_race_with_incoming_transfers() {
        let h = Arc::new(Harness::new(false));
        h.ledger.set_balance(GROUP, ALICE, 100).await.unwrap();

        let mut chatter = Vec::new();
        let mut credits = Vec::new();
        for _ in 0..20 {
            let bot = h.clone();
            chatter.push(tokio::spawn(async move {
                bot.say(BOB, "bob", "hi").await;
            }));
            let ledger = h.ledger.clone();
            credits.push(tokio::spawn(async move {
                ledger.transfer(GROUP, ALICE, BOB, 1).await.is_ok()
            }));
        }
        for t in chatter {
            t.await.unwrap();
        }
        let mut moved = 0;
        for t in credits {
            if t.await.unwrap() {
                moved += 1;
            }
        }

        assert_eq!(h.balance(BOB).await, moved);
        assert_eq!(h.balance(ALICE).await, 100 - moved);
    }

    #[tokio::test]
    async fn plain_chatter_registers_silently() {
        let h = Harness::new(false);
        let replies = h.say(BOB, "bob", "good evening, tavern").await;

        assert!(replies.is_empty());
        assert!(h.ledger.is_registered(GROUP, BOB).await);
    }

    #[tokio::test]
    async fn send_moves_money_and_quotes_the_command() {
        let h = Harness::new(false);
        h.say(BOB, "bob", "hi").await;
        h.ledger.set_balance(GROUP, ALICE, 100).await.unwrap();

        let replies = h.say(ALICE, "alice", "/send @bob 40").await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].html.contains("40"));
        assert!(replies[0].html.contains("@alice"));
        assert!(replies[0].html.contains("@bob"));
        assert!(replies[0].reply_to.is_some());
        assert_eq!(h.balance(ALICE).await, 60);
        assert_eq!(h.balance(BOB).await, 40);

        let replies = h.say(ALICE, "alice", "/send @bob 1000").await;
        assert_eq!(replies[0].html, texts::INSUFFICIENT_MONEY);
        assert_eq!(h.balance(ALICE).await, 60);
        assert_eq!(h.balance(BOB).await, 40);
    }

    #[tokio::test]
    async fn send_rejects_bad_input() {
        let h = Harness::new(false);
        h.say(BOB, "bob", "hi").await;

        let replies = h.say(ALICE, "alice", "/send @bob").await;
        assert!(replies[0].html.contains("/send @username 123"));

        let replies = h.say(ALICE, "alice", "/send @bob -5").await;
        assert_eq!(replies[0].html, texts::INVALID_INTEGER);

        let replies = h.say(ALICE, "alice", "/send @nobody 5").await;
        assert!(replies[0].html.contains("@nobody"));

        let replies = h.say(ALICE, "alice", "/send @alice 0").await;
        assert_eq!(replies[0].html, texts::INVALID_INTEGER);

        let replies = h.say(ALICE, "alice", "/send @alice 5").await;
        assert_eq!(replies[0].html, texts::SELF_TRANSFER);

        let replies = h
            .say_in(GROUP, ChatKind::Group, UserId(3), None, "/send @bob 5")
            .await;
        assert_eq!(replies[0].html, texts::USERNAME_HIDDEN);
    }

    #[tokio::test]
    async fn admin_commands_need_rights() {
        let h = Harness::new(false);
        h.say(BOB, "bob", "hi").await;

        let replies = h.say(ALICE, "alice", "/set_balance @bob 500").await;
        assert_eq!(replies[0].html, texts::RIGHTS_VIOLATION);
        assert_eq!(h.balance(BOB).await, 0);
    }

    #[tokio::test]
    async fn admins_manage_balances() {
        let h = Harness::new(true);
        h.say(BOB, "bob", "hi").await;
        h.say(ALICE, "alice", "hi").await;

        let replies = h.say(ALICE, "alice", "/set_balance @bob 500").await;
        assert!(replies[0].html.contains("500"));
        assert_eq!(h.balance(BOB).await, 500);

        h.say(ALICE, "alice", "/transaction @bob @alice 120").await;
        assert_eq!(h.balance(BOB).await, 380);
        assert_eq!(h.balance(ALICE).await, 120);

        let replies = h.say(ALICE, "alice", "/get_balance @bob").await;
        assert!(replies[0].html.contains("380"));

        let replies = h
            .say(ALICE, "alice", "/set_balance @bob 4294967296")
            .await;
        assert_eq!(replies[0].html, texts::BALANCE_OVERFLOW);
        assert_eq!(h.balance(BOB).await, 380);
    }

    #[tokio::test]
    async fn buttons_resolve_like_commands() {
        let h = Harness::new(false);
        let replies = h
            .say(ALICE, "alice", crate::commands::labels::BALANCE)
            .await;
        assert_eq!(replies[0].html, "Your balance: 0 💰");
    }

    #[tokio::test]
    async fn dice_replies_to_the_roll_in_private_chats() {
        let h = Harness::new(false);
        let replies = h
            .say_in(ChatId(42), ChatKind::Private, ALICE, Some("alice"), "/dice")
            .await;

        assert_eq!(replies.len(), 1);
        assert!(replies[0].html.starts_with("🎲"));
        assert!(replies[0].reply_to.is_some());
        assert!(replies[0].html.contains('\u{20e3}') || replies[0].html.contains("🔟"));
    }

    #[tokio::test]
    async fn channels_and_other_updates_are_ignored() {
        let h = Harness::new(false);
        h.say_in(ChatId(-9), ChatKind::Channel, ALICE, Some("alice"), "/start")
            .await;
        assert!(!h.ledger.is_registered(ChatId(-9), ALICE).await);

        h.bot
            .handle(
                &CancellationToken::new(),
                Event {
                    update_id: 99,
                    kind: EventKind::Other,
                },
            )
            .await
            .unwrap();
        assert!(h.sink.take().is_empty());
    }

    #[test]
    fn d20_rolls_stay_in_range() {
        for _ in 0..500 {
            let r = roll_d20();
            assert!((1..=20).contains(&r));
            assert_ne!(d20_emoji(r), "🎲");
        }
    }

    #[test]
    fn d20_results_render_as_keycap_digits() {
        assert_eq!(d20_emoji(7), "7️⃣");
        assert_eq!(d20_emoji(10), "🔟");
        assert_eq!(d20_emoji(15), "1️⃣5️⃣");
        assert_eq!(d20_emoji(20), "2️⃣0️⃣");
        assert_eq!(d20_emoji(0), "🎲");
        assert_eq!(d20_emoji(21), "🎲");
    }
}
