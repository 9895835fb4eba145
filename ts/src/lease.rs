//! Shared run queue with time-bounded leases
//!
//! Runs live in one SQLite `runs` table shared by every worker. A worker holds
//! a run only while its lease is unexpired; every acquisition bumps a fencing
//! token, and heartbeat, release and finish only succeed for the current
//! owner with the current token. A worker whose lease expired and was taken
//! over therefore cannot touch the run again.

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::now_ms;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    lease_token INTEGER NOT NULL DEFAULT 0,
    run_spec TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
"#;

const RUN_COLUMNS: &str =
    "run_id, status, lease_owner, lease_expires_at, lease_token, run_spec, attempts, error, created_at, updated_at";

/// Claimable means queued, or processing with a lapsed lease
const CLAIMABLE: &str = "(status = 'queued' OR (status = 'processing' AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)))";

/// Run lifecycle in the shared queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt(format!("unknown run status '{}'", other))),
        }
    }
}

/// One row of the shared run table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    /// Fencing token of the most recent acquisition
    pub lease_token: u64,
    pub run_spec: Value,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RunRecord {
    /// True if some worker holds an unexpired lease at `now`
    pub fn is_leased(&self, now: i64) -> bool {
        self.status == RunStatus::Processing && self.lease_expires_at.is_some_and(|at| at > now)
    }
}

/// Proof of ownership handed to the worker that acquired a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub run_id: String,
    pub worker_id: String,
    pub token: u64,
    pub expires_at: i64,
}

fn run_from_row(r: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = r.get(1)?;
    let spec: String = r.get(5)?;
    let conv = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };
    Ok(RunRecord {
        run_id: r.get(0)?,
        status: status.parse().map_err(|e: StoreError| conv(1, Box::new(e)))?,
        lease_owner: r.get(2)?,
        lease_expires_at: r.get(3)?,
        lease_token: r.get::<_, i64>(4)? as u64,
        run_spec: serde_json::from_str(&spec).map_err(|e| conv(5, Box::new(e)))?,
        attempts: r.get(6)?,
        error: r.get(7)?,
        created_at: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Handle to the shared run table; clones share one connection
#[derive(Clone)]
pub struct LeaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl LeaseStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(?path, "LeaseStore::open: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Add a run to the queue
    pub fn enqueue(&self, run_id: &str, spec: &Value) -> StoreResult<RunRecord> {
        debug!(%run_id, "enqueue: called");
        let conn = self.lock()?;
        let now = now_ms();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO runs (run_id, status, run_spec, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![run_id, RunStatus::Queued.as_str(), serde_json::to_string(spec)?, now],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateRun(run_id.to_string()));
        }
        info!(%run_id, "Enqueued run");
        load_run(&conn, run_id)?.ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))
    }

    /// Try to take the lease on one run
    ///
    /// Succeeds only if the run is not terminal and nobody holds an unexpired
    /// lease. Losing the race is `Ok(None)`, not an error.
    pub fn acquire_lease(&self, run_id: &str, worker_id: &str, ttl: Duration) -> StoreResult<Option<Lease>> {
        debug!(%run_id, %worker_id, ?ttl, "acquire_lease: called");
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let lease = take_lease(&tx, run_id, worker_id, ttl)?;
        tx.commit()?;
        if let Some(lease) = &lease {
            info!(%run_id, %worker_id, token = lease.token, "Acquired lease");
        }
        Ok(lease)
    }

    /// Claim the oldest claimable run
    pub fn claim_next(&self, worker_id: &str, ttl: Duration) -> StoreResult<Option<(RunRecord, Lease)>> {
        debug!(%worker_id, "claim_next: called");
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate: Option<String> = tx
            .query_row(
                &format!("SELECT run_id FROM runs WHERE {} ORDER BY seq LIMIT 1", CLAIMABLE),
                params![now_ms()],
                |r| r.get(0),
            )
            .optional()?;

        let Some(run_id) = candidate else {
            return Ok(None);
        };
        let Some(lease) = take_lease(&tx, &run_id, worker_id, ttl)? else {
            return Ok(None);
        };
        let record = load_run(&tx, &run_id)?.ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))?;
        tx.commit()?;
        info!(%run_id, %worker_id, token = lease.token, attempts = record.attempts, "Claimed run");
        Ok(Some((record, lease)))
    }

    /// Extend a held lease; false if the caller no longer owns it
    pub fn heartbeat_lease(&self, lease: &Lease, ttl: Duration) -> StoreResult<bool> {
        debug!(run_id = %lease.run_id, worker_id = %lease.worker_id, token = lease.token, "heartbeat_lease: called");
        let conn = self.lock()?;
        let now = now_ms();
        let updated = conn.execute(
            "UPDATE runs SET lease_expires_at = ?4, updated_at = ?5
             WHERE run_id = ?1 AND lease_owner = ?2 AND lease_token = ?3 AND status = 'processing'",
            params![
                lease.run_id,
                lease.worker_id,
                lease.token as i64,
                now.saturating_add(ttl_ms(ttl)),
                now
            ],
        )?;
        if updated == 0 {
            warn!(run_id = %lease.run_id, worker_id = %lease.worker_id, "Lease heartbeat rejected, lease lost");
        }
        Ok(updated == 1)
    }

    /// Give a run back to the queue without finishing it
    pub fn release_lease(&self, lease: &Lease) -> StoreResult<bool> {
        debug!(run_id = %lease.run_id, worker_id = %lease.worker_id, "release_lease: called");
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE runs SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?4
             WHERE run_id = ?1 AND lease_owner = ?2 AND lease_token = ?3 AND status = 'processing'",
            params![lease.run_id, lease.worker_id, lease.token as i64, now_ms()],
        )?;
        if updated == 1 {
            info!(run_id = %lease.run_id, worker_id = %lease.worker_id, "Released lease");
        }
        Ok(updated == 1)
    }

    /// Mark a held run completed or failed and drop the lease
    pub fn finish_run(&self, lease: &Lease, status: RunStatus, error: Option<&str>) -> StoreResult<bool> {
        debug!(run_id = %lease.run_id, %status, "finish_run: called");
        if !status.is_terminal() {
            return Err(StoreError::NotTerminal(status.to_string()));
        }
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE runs SET status = ?4, error = ?5, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?6
             WHERE run_id = ?1 AND lease_owner = ?2 AND lease_token = ?3 AND status = 'processing'",
            params![
                lease.run_id,
                lease.worker_id,
                lease.token as i64,
                status.as_str(),
                error,
                now_ms()
            ],
        )?;
        if updated == 1 {
            info!(run_id = %lease.run_id, %status, "Finished run");
        } else {
            warn!(run_id = %lease.run_id, %status, "Finish rejected, lease lost");
        }
        Ok(updated == 1)
    }

    /// Queued runs plus processing runs whose lease has lapsed
    pub fn queue_depth(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM runs WHERE {}", CLAIMABLE),
            params![now_ms()],
            |r| r.get(0),
        )?;
        debug!(count, "queue_depth: called");
        Ok(count as usize)
    }

    pub fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        debug!(%run_id, "get_run: called");
        let conn = self.lock()?;
        load_run(&conn, run_id)
    }

    /// Runs in enqueue order, optionally filtered by status
    pub fn list_runs(&self, status: Option<RunStatus>) -> StoreResult<Vec<RunRecord>> {
        debug!(?status, "list_runs: called");
        let conn = self.lock()?;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!("SELECT {} FROM runs WHERE status = ?1 ORDER BY seq", RUN_COLUMNS))?;
                stmt.query_map(params![status.as_str()], run_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("SELECT {} FROM runs ORDER BY seq", RUN_COLUMNS))?;
                stmt.query_map([], run_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }
}

fn load_run(conn: &Connection, run_id: &str) -> StoreResult<Option<RunRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
            params![run_id],
            run_from_row,
        )
        .optional()?)
}

/// The single conditional UPDATE that grants a lease
fn take_lease(conn: &Connection, run_id: &str, worker_id: &str, ttl: Duration) -> StoreResult<Option<Lease>> {
    let now = now_ms();
    let expires_at = now.saturating_add(ttl_ms(ttl));
    let token: Option<i64> = conn
        .query_row(
            &format!(
                "UPDATE runs
                 SET status = 'processing', lease_owner = ?2, lease_expires_at = ?3,
                     lease_token = lease_token + 1, attempts = attempts + 1, updated_at = ?1
                 WHERE run_id = ?4 AND {}
                 RETURNING lease_token",
                CLAIMABLE
            ),
            params![now, worker_id, expires_at, run_id],
            |r| r.get(0),
        )
        .optional()?;

    Ok(token.map(|token| Lease {
        run_id: run_id.to_string(),
        worker_id: worker_id.to_string(),
        token: token as u64,
        expires_at,
    }))
}
