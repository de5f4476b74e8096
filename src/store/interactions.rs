//! Append-only interaction log used as a cross-run dedup filter.
//!
//! One SQLite connection lives on a dedicated worker thread; async callers
//! send it closures and await the reply. WAL plus `synchronous=FULL` keeps a
//! recorded interaction durable and lets several processes share the file.

use super::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS interaction_records (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    account_scope TEXT NOT NULL,
    identity      TEXT NOT NULL,
    kind          TEXT NOT NULL,
    campaign      TEXT NOT NULL,
    target_id     TEXT NOT NULL,
    recorded_at   TEXT NOT NULL,
    UNIQUE (account_scope, identity, kind)
);
CREATE INDEX IF NOT EXISTS idx_interaction_records_scope
    ON interaction_records (account_scope, seq);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Like,
    Follow,
    Comment,
    WatchStory,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Like => "like",
            InteractionKind::Follow => "follow",
            InteractionKind::Comment => "comment",
            InteractionKind::WatchStory => "watch_story",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "like" => Ok(InteractionKind::Like),
            "follow" => Ok(InteractionKind::Follow),
            "comment" => Ok(InteractionKind::Comment),
            "watch_story" => Ok(InteractionKind::WatchStory),
            other => Err(StoreError::Corrupt(format!(
                "unknown interaction kind '{}'",
                other
            ))),
        }
    }
}

/// One performed interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionRecord {
    pub account_scope: String,
    pub identity: String,
    pub kind: InteractionKind,
    pub campaign: String,
    pub target_id: String,
    pub recorded_at: DateTime<Utc>,
    /// Insertion sequence; `0` until stored.
    pub seq: i64,
}

impl InteractionRecord {
    pub fn new(
        account_scope: impl Into<String>,
        identity: impl Into<String>,
        kind: InteractionKind,
        campaign: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            account_scope: account_scope.into(),
            identity: identity.into(),
            kind,
            campaign: campaign.into(),
            target_id: target_id.into(),
            recorded_at: Utc::now(),
            seq: 0,
        }
    }
}

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct GateInner {
    sender: Mutex<mpsc::Sender<DbCommand>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for GateInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            let sender = match self.sender.lock() {
                Ok(sender) => sender,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(err) = sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to interaction store thread: {}", err);
            }
            drop(sender);
            if handle.join().is_err() {
                error!("Interaction store thread panicked");
            }
        }
    }
}

/// Membership filter over past interactions, keyed by (scope, identity, kind).
#[derive(Clone)]
pub struct InteractionGate {
    inner: Arc<GateInner>,
    path: Arc<PathBuf>,
}

impl fmt::Debug for InteractionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractionGate")
            .field("path", &self.path)
            .finish()
    }
}

impl InteractionGate {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), StoreError>>();
        let path_for_thread = path.clone();

        let worker = thread::Builder::new()
            .name("listwalk-interactions".into())
            .spawn(move || {
                let mut conn = match open_connection(&path_for_thread) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    error!("Interaction store opener went away before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }
                debug!("Interaction store thread shutting down");
            })
            .map_err(|e| StoreError::WorkerGone(format!("failed to spawn worker: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| StoreError::WorkerGone("worker exited before signaling readiness".into()))??;

        info!("Interaction log at {}", path.display());

        Ok(Self {
            inner: Arc::new(GateInner {
                sender: Mutex::new(command_tx),
                worker: Mutex::new(Some(worker)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Interaction store caller dropped before receiving result");
            }
        }));

        {
            let sender = self
                .inner
                .sender
                .lock()
                .map_err(|_| StoreError::WorkerGone("sender lock poisoned".into()))?;
            sender
                .send(command)
                .map_err(|e| StoreError::WorkerGone(format!("failed to send command: {}", e)))?;
        }

        reply_rx
            .await
            .map_err(|_| StoreError::WorkerGone("worker terminated unexpectedly".into()))?
    }

    /// `true` unless this interaction was already recorded for the scope.
    pub async fn should_interact(
        &self,
        scope: &str,
        identity: &str,
        kind: InteractionKind,
    ) -> Result<bool, StoreError> {
        let scope = scope.to_string();
        let identity = identity.to_string();
        self.execute(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM interaction_records
                     WHERE account_scope = ?1 AND identity = ?2 AND kind = ?3",
                    params![scope, identity, kind.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_none())
        })
        .await
    }

    /// Store a record. Returns `false` if the same interaction already existed.
    pub async fn record_interaction(&self, record: &InteractionRecord) -> Result<bool, StoreError> {
        let record = record.clone();
        self.execute(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO interaction_records
                     (account_scope, identity, kind, campaign, target_id, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.account_scope,
                    record.identity,
                    record.kind.as_str(),
                    record.campaign,
                    record.target_id,
                    record.recorded_at.to_rfc3339(),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    pub async fn count(&self, scope: &str) -> Result<u64, StoreError> {
        let scope = scope.to_string();
        self.execute(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM interaction_records WHERE account_scope = ?1",
                params![scope],
                |row| row.get(0),
            )?;
            u64::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative count {}", n)))
        })
        .await
    }

    /// Every record of the scope, in insertion order.
    pub async fn history(&self, scope: &str) -> Result<Vec<InteractionRecord>, StoreError> {
        let scope = scope.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, account_scope, identity, kind, campaign, target_id, recorded_at
                 FROM interaction_records
                 WHERE account_scope = ?1
                 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![scope], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (seq, account_scope, identity, kind, campaign, target_id, recorded_at) = row?;
                out.push(InteractionRecord {
                    account_scope,
                    identity,
                    kind: kind.parse()?,
                    campaign,
                    target_id,
                    recorded_at: parse_datetime(&recorded_at)?,
                    seq,
                });
            }
            Ok(out)
        })
        .await
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let mut conn = Connection::open(path)?;
    // journal_mode returns a row, so it cannot go through execute_batch.
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        debug!("Interaction store journal mode is {}", mode);
    }
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
    run_migrations(&mut conn)?;
    Ok(conn)
}

fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Corrupt(format!(
            "database version ({}) is newer than supported schema ({})",
            version, CURRENT_SCHEMA_VERSION
        )));
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        apply_migration(&tx, next)?;
        version = next;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    match version {
        1 => {
            tx.execute_batch(SCHEMA_V1)?;
            Ok(())
        }
        other => Err(StoreError::Corrupt(format!(
            "no migration to schema version {}",
            other
        ))),
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid datetime '{}': {}", value, e)))
}
