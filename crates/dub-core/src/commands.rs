//! Command table and text parsing.
//!
//! The table is built once at startup and shared read-only; lookups go by
//! `/command` key first and by keyboard button label second.

use std::collections::HashMap;

use tracing::warn;

use crate::{
    domain::{ChatKind, IncomingMessage},
    formatting::escape_html,
    ledger::LedgerError,
    ports::MemberDirectory,
    reply::{reply_to_source, with_main_menu, ReplyTransform},
};

/// Keyboard button labels. Pressing a button sends its label as plain text.
pub mod labels {
    pub const START: &str = "Start";
    pub const DICE: &str = "Roll the dice";
    pub const BALANCE: &str = "My balance";
    pub const SEND: &str = "Send money";
    pub const GET_USER_BALANCE: &str = "(Admin) Player balance";
    pub const SET_USER_BALANCE: &str = "(Admin) Set player balance";
    pub const TRANSACTION: &str = "(Admin) Transfer between players";
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid command parameters")]
    InvalidParameters,

    #[error("invalid integer parameter")]
    InvalidIntegerParameter,

    #[error("sender has no public username")]
    UsernameHidden,

    #[error("user {0} is not registered")]
    UnknownUser(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Start,
    Help,
    Balance,
    Send,
    SendPrompt,
    Dice,
    GetUserBalance,
    SetUserBalance,
    Transaction,
}

#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub key: &'static str,
    pub action: Action,
    pub label: Option<&'static str>,
    pub usage: Option<&'static str>,
    pub description: &'static str,
    pub needs_admin: bool,
    pub transforms: &'static [ReplyTransform],
}

impl CommandSpec {
    /// Usage line shown in help and error replies.
    pub fn usage_text(&self) -> String {
        match self.usage {
            Some(u) => u.to_string(),
            None => format!("/{}", self.key),
        }
    }
}

const MENU: &[ReplyTransform] = &[with_main_menu];
const MENU_QUOTED: &[ReplyTransform] = &[with_main_menu, reply_to_source];

const START: CommandSpec = CommandSpec {
    key: "start",
    action: Action::Start,
    label: Some(labels::START),
    usage: None,
    description: "open a wallet",
    needs_admin: false,
    transforms: MENU,
};
const HELP: CommandSpec = CommandSpec {
    key: "help",
    action: Action::Help,
    label: None,
    usage: None,
    description: "list commands",
    needs_admin: false,
    transforms: MENU,
};
const BALANCE: CommandSpec = CommandSpec {
    key: "balance",
    action: Action::Balance,
    label: Some(labels::BALANCE),
    usage: None,
    description: "show your balance",
    needs_admin: false,
    transforms: MENU,
};
const SEND: CommandSpec = CommandSpec {
    key: "send",
    action: Action::Send,
    label: None,
    usage: Some("/send @username 123"),
    description: "send money to a player",
    needs_admin: false,
    transforms: MENU_QUOTED,
};
const SEND_PROMPT: CommandSpec = CommandSpec {
    key: "send_prompt",
    action: Action::SendPrompt,
    label: Some(labels::SEND),
    usage: None,
    description: "how to send money",
    needs_admin: false,
    transforms: MENU,
};
const DICE: CommandSpec = CommandSpec {
    key: "dice",
    action: Action::Dice,
    label: Some(labels::DICE),
    usage: None,
    description: "roll a d20",
    needs_admin: false,
    transforms: MENU_QUOTED,
};
const GET_USER_BALANCE: CommandSpec = CommandSpec {
    key: "get_balance",
    action: Action::GetUserBalance,
    label: Some(labels::GET_USER_BALANCE),
    usage: Some("/get_balance @username"),
    description: "show a player's balance",
    needs_admin: true,
    transforms: MENU,
};
const SET_USER_BALANCE: CommandSpec = CommandSpec {
    key: "set_balance",
    action: Action::SetUserBalance,
    label: Some(labels::SET_USER_BALANCE),
    usage: Some("/set_balance @username 123"),
    description: "set a player's balance",
    needs_admin: true,
    transforms: MENU,
};
const TRANSACTION: CommandSpec = CommandSpec {
    key: "transaction",
    action: Action::Transaction,
    label: Some(labels::TRANSACTION),
    usage: Some("/transaction @from @to 123"),
    description: "move money between players",
    needs_admin: true,
    transforms: MENU,
};

struct ChatCommands {
    commands: Vec<CommandSpec>,
    help_html: String,
}

/// Result of matching a message against the table.
#[derive(Debug)]
pub enum Lookup<'a> {
    Found(&'a CommandSpec),
    /// The chat kind has no commands at all.
    NoCommands,
    /// Neither a known key nor a button label.
    Unknown,
}

#[derive(Debug)]
pub enum Resolution<'a> {
    Command(&'a CommandSpec),
    NotImplemented,
    RightsViolation,
    /// Not a command, or it could not be authorized. Ignored silently.
    Unresolved,
}

pub struct CommandTable {
    by_kind: HashMap<ChatKind, ChatCommands>,
}

impl CommandTable {
    pub fn new(tables: Vec<(ChatKind, Vec<CommandSpec>)>) -> Self {
        let by_kind = tables
            .into_iter()
            .map(|(kind, commands)| {
                let help_html = build_help(&commands);
                (
                    kind,
                    ChatCommands {
                        commands,
                        help_html,
                    },
                )
            })
            .collect();
        Self { by_kind }
    }

    pub fn standard() -> Self {
        let group = vec![
            START,
            HELP,
            BALANCE,
            SEND,
            SEND_PROMPT,
            DICE,
            GET_USER_BALANCE,
            SET_USER_BALANCE,
            TRANSACTION,
        ];
        Self::new(vec![
            (ChatKind::Group, group.clone()),
            (ChatKind::SuperGroup, group),
            (ChatKind::Private, vec![START, HELP, DICE]),
        ])
    }

    pub fn lookup(&self, msg: &IncomingMessage) -> Lookup<'_> {
        let Some(chat) = self.by_kind.get(&msg.chat_kind) else {
            return Lookup::NoCommands;
        };

        let by_key = parse_command(&msg.text)
            .and_then(|(key, _)| chat.commands.iter().find(|c| c.key == key));
        let found = by_key.or_else(|| {
            let text = msg.text.trim();
            chat.commands.iter().find(|c| c.label == Some(text))
        });

        match found {
            Some(c) => Lookup::Found(c),
            None => Lookup::Unknown,
        }
    }

    /// Match the message and check admin rights for privileged commands.
    pub async fn resolve(
        &self,
        msg: &IncomingMessage,
        directory: &dyn MemberDirectory,
    ) -> Resolution<'_> {
        let spec = match self.lookup(msg) {
            Lookup::Found(spec) => spec,
            Lookup::NoCommands => return Resolution::NotImplemented,
            Lookup::Unknown => return Resolution::Unresolved,
        };

        if !spec.needs_admin || msg.chat_kind == ChatKind::Private {
            return Resolution::Command(spec);
        }

        match directory.is_admin(msg.chat_id, msg.sender.id).await {
            Ok(true) => Resolution::Command(spec),
            Ok(false) => Resolution::RightsViolation,
            Err(e) => {
                warn!(
                    chat_id = msg.chat_id.0,
                    user_id = msg.sender.id.0,
                    "admin check failed: {e}"
                );
                Resolution::Unresolved
            }
        }
    }

    pub fn help_html(&self, kind: ChatKind) -> Option<&str> {
        self.by_kind.get(&kind).map(|c| c.help_html.as_str())
    }

    pub fn spec(&self, kind: ChatKind, action: Action) -> Option<&CommandSpec> {
        self.by_kind
            .get(&kind)?
            .commands
            .iter()
            .find(|c| c.action == action)
    }
}

/// Regular commands first, shortest lines first; admin commands after a separator.
fn build_help(commands: &[CommandSpec]) -> String {
    let mut entries: Vec<(String, bool)> = commands
        .iter()
        .map(|c| {
            let usage = format!("<code>{}</code>", escape_html(&c.usage_text()));
            let line = if c.description.is_empty() {
                usage
            } else {
                format!("{usage} - {}", escape_html(c.description))
            };
            (line, c.needs_admin)
        })
        .collect();
    entries.sort_by_key(|(line, admin)| (*admin, line.len()));

    let mut out = Vec::with_capacity(entries.len() + 3);
    let mut separated = false;
    for (line, admin) in entries {
        if admin && !separated {
            out.push(String::new());
            out.push("<b>Administrative commands</b>".to_string());
            out.push(String::new());
            separated = true;
        }
        out.push(line);
    }
    out.join("\n")
}

/// Split `/cmd@botname rest` into `("cmd", "rest")`. Non-command text yields `None`.
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }

    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();
    if cmd.is_empty() {
        return None;
    }

    Some((cmd, rest))
}

/// Whitespace-separated words with empties and mentions of the bot removed.
///
/// Index 0 is the command itself.
pub fn command_params<'a>(text: &'a str, bot_name: Option<&str>) -> Vec<&'a str> {
    text.split_whitespace()
        .filter(|s| match bot_name {
            Some(bot) => *s != bot && s.strip_prefix('@') != Some(bot),
            None => true,
        })
        .collect()
}

pub fn parse_amount(raw: &str, allow_zero: bool) -> Result<u64, CommandError> {
    let amount = raw
        .parse::<u64>()
        .map_err(|_| CommandError::InvalidIntegerParameter)?;
    if amount == 0 && !allow_zero {
        return Err(CommandError::InvalidIntegerParameter);
    }
    Ok(amount)
}

/// `@name` -> `name`, as stored in the name mapping.
pub fn sanitize_username(name: &str) -> &str {
    name.strip_prefix('@').unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId, Sender, UserId};
    use crate::errors::Error;
    use async_trait::async_trait;

    struct FixedDirectory(Option<bool>);

    #[async_trait]
    impl MemberDirectory for FixedDirectory {
        async fn is_admin(&self, _: ChatId, _: UserId) -> crate::Result<bool> {
            self.0
                .ok_or_else(|| Error::External("getChatMember failed".to_string()))
        }
    }

    fn msg(kind: ChatKind, text: &str) -> IncomingMessage {
        IncomingMessage {
            chat_id: ChatId(-1),
            chat_kind: kind,
            message_id: MessageId(1),
            sender: Sender {
                id: UserId(1),
                username: Some("legolas".to_string()),
            },
            text: text.to_string(),
        }
    }

    #[test]
    fn parses_commands_with_bot_suffix() {
        assert_eq!(
            parse_command("/Send@dnd_bot @bob 10"),
            Some(("send".to_string(), "@bob 10".to_string()))
        );
        assert_eq!(
            parse_command("  /help  "),
            Some(("help".to_string(), String::new()))
        );
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
    }

    #[test]
    fn params_drop_bot_mentions_and_blanks() {
        assert_eq!(
            command_params("/send  @dnd_bot @bob   10", Some("dnd_bot")),
            vec!["/send", "@bob", "10"]
        );
        assert_eq!(
            command_params("/send dnd_bot @bob 10", Some("dnd_bot")),
            vec!["/send", "@bob", "10"]
        );
        assert_eq!(
            command_params("/send @bob 10", None),
            vec!["/send", "@bob", "10"]
        );
    }

    #[test]
    fn amounts_must_be_non_negative_integers() {
        assert_eq!(parse_amount("42", false).unwrap(), 42);
        assert_eq!(parse_amount("0", true).unwrap(), 0);
        assert!(matches!(
            parse_amount("0", false),
            Err(CommandError::InvalidIntegerParameter)
        ));
        for bad in ["-3", "1.5", "lots", ""] {
            assert!(parse_amount(bad, true).is_err(), "{bad}");
        }
    }

    #[test]
    fn looks_up_by_key_then_by_label() {
        let table = CommandTable::standard();

        match table.lookup(&msg(ChatKind::Group, "/dice@dnd_bot")) {
            Lookup::Found(c) => assert_eq!(c.action, Action::Dice),
            other => panic!("unexpected {other:?}"),
        }
        match table.lookup(&msg(ChatKind::SuperGroup, labels::SEND)) {
            Lookup::Found(c) => assert_eq!(c.action, Action::SendPrompt),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            table.lookup(&msg(ChatKind::Group, "just chatting")),
            Lookup::Unknown
        ));
        assert!(matches!(
            table.lookup(&msg(ChatKind::Private, "/transaction @a @b 1")),
            Lookup::Unknown
        ));
        assert!(matches!(
            table.lookup(&msg(ChatKind::Channel, "/start")),
            Lookup::NoCommands
        ));
    }

    #[test]
    fn help_lists_admin_commands_last() {
        let table = CommandTable::standard();
        let help = table.help_html(ChatKind::Group).unwrap();
        let lines: Vec<&str> = help.lines().collect();

        let sep = lines
            .iter()
            .position(|l| l.contains("Administrative commands"))
            .unwrap();
        assert!(lines[..sep].iter().all(|l| !l.contains("get_balance")));
        assert!(lines[sep..].iter().any(|l| l.contains("/transaction @from @to 123")));

        let regular: Vec<usize> = lines[..sep]
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| l.len())
            .collect();
        let mut sorted = regular.clone();
        sorted.sort_unstable();
        assert_eq!(regular, sorted);

        let private = table.help_html(ChatKind::Private).unwrap();
        assert!(!private.contains("Administrative"));
    }

    #[tokio::test]
    async fn admin_commands_consult_the_directory() {
        let table = CommandTable::standard();
        let m = msg(ChatKind::Group, "/set_balance @bob 5");

        assert!(matches!(
            table.resolve(&m, &FixedDirectory(Some(true))).await,
            Resolution::Command(c) if c.action == Action::SetUserBalance
        ));
        assert!(matches!(
            table.resolve(&m, &FixedDirectory(Some(false))).await,
            Resolution::RightsViolation
        ));
        assert!(matches!(
            table.resolve(&m, &FixedDirectory(None)).await,
            Resolution::Unresolved
        ));

        // Regular commands never hit the directory.
        let m = msg(ChatKind::Group, "/balance");
        assert!(matches!(
            table.resolve(&m, &FixedDirectory(None)).await,
            Resolution::Command(_)
        ));
        assert!(matches!(
            table
                .resolve(&msg(ChatKind::Channel, "/balance"), &FixedDirectory(None))
                .await,
            Resolution::NotImplemented
        ));
    }
}
