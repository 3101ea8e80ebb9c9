//! Transactional balance storage.
//!
//! Layout (two tables, fixed-width little-endian blobs):
//! - `name_to_account_id`: username -> 8-byte account id
//! - `balances`: 8-byte scope ++ 8-byte account id -> 4-byte balance
//!
//! A balance row existing is what "registered in this scope" means.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::domain::{ChatId, UserId};

pub const MAX_BALANCE: u64 = u32::MAX as u64;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("account is not registered in this scope")]
    NotRegistered,

    #[error("insufficient money")]
    InsufficientMoney,

    #[error("balance would exceed {MAX_BALANCE}")]
    BalanceOverflow,

    #[error("invalid transaction parameters")]
    InvalidTransactionParameters,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Expected business outcomes, as opposed to storage engine failures.
    pub fn is_domain(&self) -> bool {
        !matches!(self, LedgerError::Storage(_) | LedgerError::Corrupt(_))
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferOutcome {
    pub from_balance: u32,
    pub to_balance: u32,
}

/// Balance + name mapping storage with invariants enforced at this boundary.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_balance(&self, scope: ChatId, account: UserId) -> LedgerResult<u32>;

    async fn set_balance(&self, scope: ChatId, account: UserId, amount: u64) -> LedgerResult<()>;

    /// Move `amount` from one account to another, atomically.
    async fn transfer(
        &self,
        scope: ChatId,
        from: UserId,
        to: UserId,
        amount: u64,
    ) -> LedgerResult<TransferOutcome>;

    async fn is_registered(&self, scope: ChatId, account: UserId) -> bool;

    /// Create a zero balance unless a record already exists. Never touches an existing balance.
    ///
    /// Returns `true` when the account was created by this call.
    async fn open_account(&self, scope: ChatId, account: UserId) -> LedgerResult<bool>;

    async fn get_account_id(&self, name: &str) -> Option<UserId>;

    async fn save_name_mapping(&self, name: &str, account: UserId) -> LedgerResult<()>;
}

pub fn balance_key(scope: ChatId, account: UserId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&scope.0.to_le_bytes());
    key[8..].copy_from_slice(&account.0.to_le_bytes());
    key
}

fn decode_balance(raw: &[u8]) -> LedgerResult<u32> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| LedgerError::Corrupt(format!("balance has {} bytes", raw.len())))?;
    Ok(u32::from_le_bytes(bytes))
}

fn decode_account_id(raw: &[u8]) -> LedgerResult<UserId> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| LedgerError::Corrupt(format!("account id has {} bytes", raw.len())))?;
    Ok(UserId(i64::from_le_bytes(bytes)))
}

/// SQLite-backed [`Ledger`]. One connection, serialized behind an async mutex;
/// every mutation runs in its own `IMMEDIATE` transaction.
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> LedgerResult<Self> {
        let conn = Connection::open(path)?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::run_migrations(&conn)?;
        info!("Ledger initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> LedgerResult<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS name_to_account_id (
                name TEXT PRIMARY KEY NOT NULL,
                account_id BLOB NOT NULL
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS balances (
                key BLOB PRIMARY KEY NOT NULL,
                balance BLOB NOT NULL
            ) WITHOUT ROWID;
            ",
        )?;
        Ok(())
    }
}

fn read_balance(conn: &Connection, key: &[u8; 16]) -> LedgerResult<Option<u32>> {
    let raw: Option<Vec<u8>> = conn
        .query_row(
            "SELECT balance FROM balances WHERE key = ?1",
            params![&key[..]],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|r| decode_balance(&r)).transpose()
}

fn write_balance(conn: &Connection, key: &[u8; 16], balance: u32) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO balances (key, balance) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET balance = excluded.balance",
        params![&key[..], &balance.to_le_bytes()[..]],
    )?;
    Ok(())
}

fn transfer_in_tx(
    conn: &mut Connection,
    scope: ChatId,
    from: UserId,
    to: UserId,
    amount: u64,
) -> LedgerResult<TransferOutcome> {
    // IMMEDIATE takes the write lock up front, so the checks and the writes see the same state.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let from_key = balance_key(scope, from);
    let to_key = balance_key(scope, to);

    let from_balance = read_balance(&tx, &from_key)?.ok_or(LedgerError::NotRegistered)?;
    let to_balance = read_balance(&tx, &to_key)?.ok_or(LedgerError::NotRegistered)?;

    if u64::from(from_balance) < amount {
        return Err(LedgerError::InsufficientMoney);
    }
    let new_to = u64::from(to_balance) + amount;
    if new_to > MAX_BALANCE {
        return Err(LedgerError::BalanceOverflow);
    }
    // Both fit in u32 after the checks above.
    let new_from = from_balance - amount as u32;
    let new_to = new_to as u32;

    write_balance(&tx, &from_key, new_from)?;
    write_balance(&tx, &to_key, new_to)?;
    tx.commit()?;

    Ok(TransferOutcome {
        from_balance: new_from,
        to_balance: new_to,
    })
}

fn log_engine_error<T>(op: &str, res: LedgerResult<T>) -> LedgerResult<T> {
    if let Err(e) = &res {
        if !e.is_domain() {
            error!(op, error = %e, "ledger storage failure");
        }
    }
    res
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn get_balance(&self, scope: ChatId, account: UserId) -> LedgerResult<u32> {
        let conn = self.conn.lock().await;
        let res = read_balance(&conn, &balance_key(scope, account))
            .and_then(|b| b.ok_or(LedgerError::NotRegistered));
        log_engine_error("get_balance", res)
    }

    async fn set_balance(&self, scope: ChatId, account: UserId, amount: u64) -> LedgerResult<()> {
        let balance = u32::try_from(amount).map_err(|_| LedgerError::BalanceOverflow)?;
        let conn = self.conn.lock().await;
        let res = write_balance(&conn, &balance_key(scope, account), balance);
        log_engine_error("set_balance", res)
    }

    async fn transfer(
        &self,
        scope: ChatId,
        from: UserId,
        to: UserId,
        amount: u64,
    ) -> LedgerResult<TransferOutcome> {
        if from == to {
            return Err(LedgerError::InvalidTransactionParameters);
        }

        let mut conn = self.conn.lock().await;
        let res = transfer_in_tx(&mut conn, scope, from, to, amount);
        log_engine_error("transfer", res)
    }

    async fn is_registered(&self, scope: ChatId, account: UserId) -> bool {
        let conn = self.conn.lock().await;
        match read_balance(&conn, &balance_key(scope, account)) {
            Ok(b) => b.is_some(),
            Err(e) => {
                error!(error = %e, "couldn't check registration");
                false
            }
        }
    }

    async fn open_account(&self, scope: ChatId, account: UserId) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let res = conn
            .execute(
                "INSERT INTO balances (key, balance) VALUES (?1, ?2)
                 ON CONFLICT(key) DO NOTHING",
                params![&balance_key(scope, account)[..], &0u32.to_le_bytes()[..]],
            )
            .map(|inserted| inserted == 1)
            .map_err(LedgerError::from);
        log_engine_error("open_account", res)
    }

    async fn get_account_id(&self, name: &str) -> Option<UserId> {
        let conn = self.conn.lock().await;
        let raw: rusqlite::Result<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT account_id FROM name_to_account_id WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional();

        let id = raw
            .map_err(LedgerError::from)
            .and_then(|r| r.map(|b| decode_account_id(&b)).transpose());
        match id {
            Ok(id) => id,
            Err(e) => {
                error!(name, error = %e, "couldn't look up account id");
                None
            }
        }
    }

    async fn save_name_mapping(&self, name: &str, account: UserId) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let res = conn
            .execute(
                "INSERT INTO name_to_account_id (name, account_id) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET account_id = excluded.account_id",
                params![name, &account.0.to_le_bytes()[..]],
            )
            .map(|_| ())
            .map_err(LedgerError::from);
        log_engine_error("save_name_mapping", res)
    }
}
