//! Persistent run ledger.
//!
//! Every stage execution gets a row here. A partial unique index over
//! `(issue_id, stage_name) WHERE status = 'running'` makes run claims
//! atomic: duplicate webhook deliveries race on a single `INSERT OR IGNORE`
//! instead of a read-then-write check. The ledger also answers the
//! branch-binding queries that let downstream stages find the branch and
//! pull request created by an earlier stage, and rewrites zombie `running`
//! rows left behind by a crash.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// Reason recorded on rows rewritten by startup recovery.
pub const STALE_RUN_REASON: &str = "stale run recovered on startup";

/// Age past which a `running` row is considered a crash leftover.
pub const STALE_RUN_MAX_AGE: Duration = Duration::from_secs(10 * 60);

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

fn now_utc() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// A full ledger row.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub issue_id: String,
    pub stage_name: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub pr_url: Option<String>,
    pub branch_name: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

/// Branch and pull-request binding from a previous successful run.
#[derive(Debug, Clone)]
pub struct BranchBinding {
    pub run_id: i64,
    pub branch_name: String,
    pub pr_url: Option<String>,
}

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (or create) the ledger database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening ledger database {}", path.display()))?;
        let ledger = Self { conn };
        ledger.init()?;
        Ok(ledger)
    }

    /// In-memory ledger, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory ledger")?;
        let ledger = Self { conn };
        ledger.init()?;
        Ok(ledger)
    }

    fn init(&self) -> Result<()> {
        // WAL keeps readers out of the writer's way; the busy timeout covers
        // anything else holding the file (a second reader process, backups).
        self.conn
            .execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA busy_timeout=5000;",
            )
            .context("setting ledger pragmas")?;
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS runs (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id    TEXT NOT NULL,
                    stage_name  TEXT NOT NULL,
                    status      TEXT NOT NULL DEFAULT 'running',
                    exit_code   INTEGER,
                    output      TEXT,
                    pr_url      TEXT,
                    branch_name TEXT,
                    error       TEXT,
                    started_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    ended_at    TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_active
                    ON runs (issue_id, stage_name)
                    WHERE status = 'running';",
            )
            .context("migrating ledger schema")?;
        Ok(())
    }

    /// Atomically claim a run slot for `(issue_id, stage_name)`.
    ///
    /// Returns `(id, true)` when this call inserted the running row, and
    /// `(0, false)` when another run is already active. The partial unique
    /// index is what makes this race-free.
    pub fn claim(&self, issue_id: &str, stage_name: &str) -> Result<(i64, bool)> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO runs (issue_id, stage_name, status) VALUES (?1, ?2, 'running')",
                params![issue_id, stage_name],
            )
            .context("claiming run")?;
        if inserted == 0 {
            return Ok((0, false));
        }
        Ok((self.conn.last_insert_rowid(), true))
    }

    /// Mark a run completed, recording its outputs and branch binding.
    pub fn complete(
        &self,
        run_id: i64,
        exit_code: i32,
        output: &str,
        pr_url: &str,
        branch_name: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = 'completed', exit_code = ?1, output = ?2,
                        pr_url = ?3, branch_name = ?4, ended_at = ?5
                 WHERE id = ?6",
                params![exit_code, output, pr_url, branch_name, now_utc(), run_id],
            )
            .context("completing run")?;
        Ok(())
    }

    /// Mark a run failed with the given error message.
    pub fn fail(&self, run_id: i64, exit_code: i32, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = 'failed', exit_code = ?1, error = ?2, ended_at = ?3
                 WHERE id = ?4",
                params![exit_code, error, now_utc(), run_id],
            )
            .context("failing run")?;
        Ok(())
    }

    /// Mark a run timed out.
    pub fn timeout(&self, run_id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = 'timeout', error = ?1, ended_at = ?2 WHERE id = ?3",
                params![error, now_utc(), run_id],
            )
            .context("timing out run")?;
        Ok(())
    }

    /// Rewrite `running` rows older than `max_age` to `failed`. Returns the
    /// number of recovered rows. Invoked once at startup.
    pub fn recover_stale(&self, max_age: Duration) -> Result<usize> {
        let cutoff = (Utc::now()
            - chrono::TimeDelta::from_std(max_age).unwrap_or(chrono::TimeDelta::zero()))
        .format(TIMESTAMP_FORMAT)
        .to_string();
        let n = self
            .conn
            .execute(
                "UPDATE runs SET status = 'failed', error = ?1, ended_at = ?2
                 WHERE status = 'running' AND started_at < ?3",
                params![STALE_RUN_REASON, now_utc(), cutoff],
            )
            .context("recovering stale runs")?;
        Ok(n)
    }

    /// The canonical branch binding for an issue: the EARLIEST successful
    /// run that recorded a branch. Downstream stages always push to the
    /// branch created by the first artifact-producing stage, regardless of
    /// how many runs came later.
    pub fn first_branch_for_issue(&self, issue_id: &str) -> Result<Option<BranchBinding>> {
        self.conn
            .query_row(
                "SELECT id, branch_name, pr_url FROM runs
                 WHERE issue_id = ?1 AND status = 'completed' AND exit_code = 0
                   AND branch_name IS NOT NULL AND branch_name != ''
                 ORDER BY started_at ASC LIMIT 1",
                params![issue_id],
                |row| {
                    Ok(BranchBinding {
                        run_id: row.get(0)?,
                        branch_name: row.get(1)?,
                        pr_url: row.get::<_, Option<String>>(2)?.filter(|s| !s.is_empty()),
                    })
                },
            )
            .optional()
            .context("querying first branch for issue")
    }

    /// The most recent successful run for `(issue_id, stage_name)`.
    pub fn last_completed_run(
        &self,
        issue_id: &str,
        stage_name: &str,
    ) -> Result<Option<BranchBinding>> {
        self.conn
            .query_row(
                "SELECT id, branch_name, pr_url FROM runs
                 WHERE issue_id = ?1 AND stage_name = ?2
                   AND status = 'completed' AND exit_code = 0
                 ORDER BY ended_at DESC LIMIT 1",
                params![issue_id, stage_name],
                |row| {
                    Ok(BranchBinding {
                        run_id: row.get(0)?,
                        branch_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        pr_url: row.get::<_, Option<String>>(2)?.filter(|s| !s.is_empty()),
                    })
                },
            )
            .optional()
            .context("querying last completed run")
    }

    /// Fetch a single run row.
    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                "SELECT id, issue_id, stage_name, status, exit_code, output, pr_url,
                        branch_name, error, started_at, ended_at
                 FROM runs WHERE id = ?1",
                params![run_id],
                |row| {
                    let status_text: String = row.get(3)?;
                    Ok(RunRecord {
                        id: row.get(0)?,
                        issue_id: row.get(1)?,
                        stage_name: row.get(2)?,
                        status: RunStatus::from_str(&status_text).unwrap_or(RunStatus::Failed),
                        exit_code: row.get(4)?,
                        output: row.get(5)?,
                        pr_url: row.get(6)?,
                        branch_name: row.get(7)?,
                        error: row.get(8)?,
                        started_at: row.get(9)?,
                        ended_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .context("querying run")
    }
}

/// Async-safe handle to the ledger.
///
/// Wraps `Ledger` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool, keeping synchronous SQLite I/O off async worker
/// threads. The single connection inside the mutex is also what guarantees
/// a single writer.
#[derive(Clone)]
pub struct LedgerHandle {
    inner: Arc<std::sync::Mutex<Ledger>>,
}

impl LedgerHandle {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(ledger)),
        }
    }

    /// Run a closure with ledger access on a blocking thread. All data
    /// passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Ledger) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let ledger = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = ledger
                .lock()
                .map_err(|e| anyhow::anyhow!("ledger lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("ledger task panicked")?
    }
}
