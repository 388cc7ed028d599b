//! DuckDB-backed persistence for history, accounts and usage.
//!
//! Architecture:
//! - `DuckDbStore` is the public handle, holding an `mpsc::SyncSender<DbCommand>`
//! - `DbWorker` runs on `std::thread::spawn` (DuckDB is sync) and owns the connection
//! - Every command carries a `oneshot` reply, so callers await results from async code
//!
//! Each command runs as one unit: a history save is a single transaction
//! (delete + re-insert), balance and points updates are single UPDATE statements
//! with a zero floor.

use std::path::PathBuf;
use std::sync::mpsc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use duckdb::params;
use tokio::sync::oneshot;

use super::schema;
use super::{
    Account, AccountStore, HistoryEntry, HistoryStore, Role, Tier, UsageLedger, UsageRecord,
};
use crate::error::RelayError;

type Reply<T> = oneshot::Sender<Result<T, RelayError>>;

enum DbCommand {
    LoadHistory {
        conversation_id: String,
        reply: Reply<Vec<HistoryEntry>>,
    },
    SaveHistory {
        conversation_id: String,
        entries: Vec<HistoryEntry>,
        reply: Reply<()>,
    },
    GetAccount {
        user_id: String,
        reply: Reply<Option<Account>>,
    },
    UpsertAccount {
        account: Account,
        reply: Reply<()>,
    },
    AddBalance {
        user_id: String,
        delta: f64,
        reply: Reply<f64>,
    },
    AddPoints {
        user_id: String,
        delta: f64,
        reply: Reply<f64>,
    },
    RecordUsage {
        record: UsageRecord,
        reply: Reply<()>,
    },
    CountToday {
        user_id: String,
        model: String,
        reply: Reply<u64>,
    },
    Shutdown,
}

/// Handle to the DuckDB worker thread.
pub struct DuckDbStore {
    tx: mpsc::SyncSender<DbCommand>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

impl DuckDbStore {
    /// Open (or create) the database at `path`, or an in-memory database when
    /// `path` is `None`, apply migrations, and start the worker thread.
    pub fn open(path: Option<PathBuf>) -> Result<Self, RelayError> {
        let conn = match &path {
            Some(p) => {
                if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| RelayError::Store(format!("cannot create db dir: {e}")))?;
                }
                duckdb::Connection::open(p)?
            }
            None => duckdb::Connection::open_in_memory()?,
        };
        schema::apply_migrations(&conn).map_err(|e| RelayError::Store(e.to_string()))?;

        // Bounded channel: a stuck worker applies backpressure instead of
        // buffering without limit.
        let (tx, rx) = mpsc::sync_channel(128);
        let handle = std::thread::Builder::new()
            .name("palaver-duckdb".into())
            .spawn(move || DbWorker { rx, conn }.run())
            .map_err(|e| RelayError::Store(format!("failed to spawn db worker: {e}")))?;

        tracing::info!(path = ?path, "duckdb store opened");
        Ok(Self {
            tx,
            worker_handle: Some(handle),
        })
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> DbCommand,
    ) -> Result<T, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        // Never block the runtime thread; a full queue is reported to the caller.
        self.tx.try_send(build(reply_tx)).map_err(|e| match e {
            mpsc::TrySendError::Full(_) => RelayError::Store("db queue full".to_string()),
            mpsc::TrySendError::Disconnected(_) => {
                RelayError::Store("db worker dead".to_string())
            }
        })?;
        reply_rx
            .await
            .map_err(|_| RelayError::Store("db worker dropped reply".to_string()))?
    }

    pub async fn upsert_account(&self, account: Account) -> Result<(), RelayError> {
        self.call(|reply| DbCommand::UpsertAccount { account, reply })
            .await
    }
}

impl Drop for DuckDbStore {
    fn drop(&mut self) {
        let _ = self.tx.send(DbCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

#[async_trait]
impl HistoryStore for DuckDbStore {
    async fn load(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, RelayError> {
        let conversation_id = conversation_id.to_string();
        self.call(|reply| DbCommand::LoadHistory {
            conversation_id,
            reply,
        })
        .await
    }

    async fn save(
        &self,
        conversation_id: &str,
        entries: &[HistoryEntry],
    ) -> Result<(), RelayError> {
        let conversation_id = conversation_id.to_string();
        let entries = entries.to_vec();
        self.call(|reply| DbCommand::SaveHistory {
            conversation_id,
            entries,
            reply,
        })
        .await
    }
}

#[async_trait]
impl AccountStore for DuckDbStore {
    async fn get(&self, user_id: &str) -> Result<Option<Account>, RelayError> {
        let user_id = user_id.to_string();
        self.call(|reply| DbCommand::GetAccount { user_id, reply })
            .await
    }

    async fn add_balance(&self, user_id: &str, delta: f64) -> Result<f64, RelayError> {
        let user_id = user_id.to_string();
        self.call(|reply| DbCommand::AddBalance {
            user_id,
            delta,
            reply,
        })
        .await
    }

    async fn add_points(&self, user_id: &str, delta: f64) -> Result<f64, RelayError> {
        let user_id = user_id.to_string();
        self.call(|reply| DbCommand::AddPoints {
            user_id,
            delta,
            reply,
        })
        .await
    }
}

#[async_trait]
impl UsageLedger for DuckDbStore {
    async fn record(&self, record: UsageRecord) -> Result<(), RelayError> {
        self.call(|reply| DbCommand::RecordUsage { record, reply })
            .await
    }

    async fn count_today(&self, user_id: &str, model: &str) -> Result<u64, RelayError> {
        let user_id = user_id.to_string();
        let model = model.to_string();
        self.call(|reply| DbCommand::CountToday {
            user_id,
            model,
            reply,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Background worker
// ---------------------------------------------------------------------------

struct DbWorker {
    rx: mpsc::Receiver<DbCommand>,
    conn: duckdb::Connection,
}

impl DbWorker {
    fn run(mut self) {
        loop {
            match self.rx.recv() {
                Ok(DbCommand::LoadHistory {
                    conversation_id,
                    reply,
                }) => {
                    let _ = reply.send(self.load_history(&conversation_id));
                }
                Ok(DbCommand::SaveHistory {
                    conversation_id,
                    entries,
                    reply,
                }) => {
                    let _ = reply.send(self.save_history(&conversation_id, &entries));
                }
                Ok(DbCommand::GetAccount { user_id, reply }) => {
                    let _ = reply.send(self.get_account(&user_id));
                }
                Ok(DbCommand::UpsertAccount { account, reply }) => {
                    let _ = reply.send(self.upsert_account(&account));
                }
                Ok(DbCommand::AddBalance {
                    user_id,
                    delta,
                    reply,
                }) => {
                    let _ = reply.send(self.adjust("balance", &user_id, delta));
                }
                Ok(DbCommand::AddPoints {
                    user_id,
                    delta,
                    reply,
                }) => {
                    let _ = reply.send(self.adjust("points", &user_id, delta));
                }
                Ok(DbCommand::RecordUsage { record, reply }) => {
                    let _ = reply.send(self.record_usage(&record));
                }
                Ok(DbCommand::CountToday {
                    user_id,
                    model,
                    reply,
                }) => {
                    let _ = reply.send(self.count_today(&user_id, &model));
                }
                Ok(DbCommand::Shutdown) => {
                    tracing::debug!("duckdb store: worker shutting down");
                    break;
                }
                Err(_) => {
                    // Sender dropped: the store handle is gone.
                    tracing::debug!("duckdb store: channel closed, worker exiting");
                    break;
                }
            }
        }
    }

    fn load_history(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, RelayError> {
        let mut stmt = self.conn.prepare(
            "SELECT role, content FROM messages WHERE conversation_id = ? ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (role, content) = row?;
            let Some(role) = Role::parse(&role) else {
                tracing::warn!(conversation_id, role, "skipping message with unknown role");
                continue;
            };
            entries.push(HistoryEntry { role, content });
        }
        Ok(entries)
    }

    fn save_history(
        &mut self,
        conversation_id: &str,
        entries: &[HistoryEntry],
    ) -> Result<(), RelayError> {
        let now_ms = Utc::now().timestamp_millis();
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?",
            params![conversation_id],
        )?;
        for (seq, entry) in entries.iter().enumerate() {
            tx.execute(
                "INSERT INTO messages (conversation_id, seq, role, content, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    conversation_id,
                    seq as i64,
                    entry.role.as_str(),
                    entry.content,
                    now_ms
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_account(&self, user_id: &str) -> Result<Option<Account>, RelayError> {
        let result = self.conn.query_row(
            "SELECT balance, points, tier, tier_expires_at FROM accounts WHERE user_id = ?",
            params![user_id],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        );
        match result {
            Ok((balance, points, tier, expires_ms)) => Ok(Some(Account {
                user_id: user_id.to_string(),
                balance,
                points,
                tier: Tier::parse(&tier),
                tier_expires_at: expires_ms.and_then(from_millis),
            })),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upsert_account(&self, account: &Account) -> Result<(), RelayError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO accounts (user_id, balance, points, tier, tier_expires_at) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                account.user_id,
                account.balance,
                account.points,
                account.tier.as_str(),
                account.tier_expires_at.map(|t| t.timestamp_millis())
            ],
        )?;
        Ok(())
    }

    /// `column` is one of the two fixed names above, never caller input.
    fn adjust(&self, column: &str, user_id: &str, delta: f64) -> Result<f64, RelayError> {
        let sql = format!(
            "UPDATE accounts SET {column} = GREATEST({column} + ?, 0) \
             WHERE user_id = ? RETURNING {column}"
        );
        match self
            .conn
            .query_row(&sql, params![delta, user_id], |row| row.get::<_, f64>(0))
        {
            Ok(value) => Ok(value),
            Err(duckdb::Error::QueryReturnedNoRows) => {
                Err(RelayError::Store(format!("unknown account: {user_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn record_usage(&self, record: &UsageRecord) -> Result<(), RelayError> {
        let ts = record.at.timestamp_millis();
        let uid = schema::usage_uid(
            &record.user_id,
            ts,
            &record.model,
            record.prompt_tokens,
            record.completion_tokens,
        );
        self.conn.execute(
            "INSERT INTO usage_records \
             (record_uid, user_id, model, prompt_tokens, completion_tokens, estimated, ts) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                uid,
                record.user_id,
                record.model,
                record.prompt_tokens as i64,
                record.completion_tokens as i64,
                record.estimated,
                ts
            ],
        )?;
        Ok(())
    }

    fn count_today(&self, user_id: &str, model: &str) -> Result<u64, RelayError> {
        let (start, end) = today_bounds_ms(Utc::now());
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM usage_records \
             WHERE user_id = ? AND model = ? AND ts >= ? AND ts < ?",
            params![user_id, model, start, end],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// `[midnight, next midnight)` of the UTC day containing `now`, in epoch ms.
fn today_bounds_ms(now: DateTime<Utc>) -> (i64, i64) {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    (
        start.timestamp_millis(),
        (start + Duration::days(1)).timestamp_millis(),
    )
}
