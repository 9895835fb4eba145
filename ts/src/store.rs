//! TaskGraphStore - persistent state for one run
//!
//! Every record is kept as a JSON body plus the columns the queries filter on,
//! the same layout for all tables. Writes run inside SQLite transactions so a
//! failure never leaves a partially applied change behind.

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, content_hash};
use crate::checkpoint::CheckpointLog;
use crate::error::{StoreError, StoreResult};
use crate::graph::{find_cycle, validate_dependency_graph};
use crate::now_ms;
use crate::records::{
    Artifact, ArtifactType, FailedApproach, IterationCompletion, IterationRecord, Learning, NewArtifact, PlanMeta,
    PlanStatus, SideEffect, StatusCounts,
};
use crate::task::{Task, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    parent_task_id TEXT,
    plan_generation INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE TABLE IF NOT EXISTS task_deps (
    task_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on)
);
CREATE TABLE IF NOT EXISTS artifacts (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    task_id TEXT NOT NULL,
    artifact_type TEXT NOT NULL,
    file_path TEXT,
    blob_path TEXT,
    content_hash TEXT,
    metadata TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_id);
CREATE TABLE IF NOT EXISTS side_effects (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT NOT NULL UNIQUE,
    task_id TEXT NOT NULL,
    effect_type TEXT NOT NULL,
    details TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS iterations (
    iteration INTEGER PRIMARY KEY,
    task_id TEXT NOT NULL,
    outcome TEXT,
    completion_confidence REAL NOT NULL DEFAULT 0,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    tools_used TEXT NOT NULL DEFAULT '[]',
    learnings TEXT NOT NULL DEFAULT '[]',
    artifacts_produced TEXT NOT NULL DEFAULT '[]',
    started_at INTEGER NOT NULL,
    completed_at INTEGER
);
CREATE TABLE IF NOT EXISTS failed_approaches (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT,
    approach TEXT NOT NULL,
    why_failed TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS learnings (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT,
    iteration INTEGER NOT NULL,
    text TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS plan_meta (
    generation INTEGER PRIMARY KEY,
    request TEXT NOT NULL,
    status TEXT NOT NULL,
    failure_reason TEXT,
    created_at INTEGER NOT NULL,
    superseded_at INTEGER
);
CREATE TABLE IF NOT EXISTS checkpoints (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    ref TEXT NOT NULL UNIQUE,
    parent TEXT,
    snapshot TEXT NOT NULL,
    message TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

/// Crash-recovery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Tasks reset from in_progress to pending
    pub tasks_reset: usize,
    /// Iterations left open by a crash and closed as incomplete
    pub iterations_closed: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tasks reset: {}, iterations closed: {}",
            self.tasks_reset, self.iterations_closed
        )
    }
}

/// Persistent store for one run's task graph
pub struct TaskGraphStore {
    pub(crate) dir: PathBuf,
    pub(crate) conn: Connection,
    pub(crate) blobs: BlobStore,
    pub(crate) log: CheckpointLog,
}

impl TaskGraphStore {
    /// SQLite file name inside the store directory
    pub const DB_FILE: &'static str = "state.db";

    /// Open or create a store in `dir`
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        debug!(?dir, "TaskGraphStore::open: called");
        std::fs::create_dir_all(&dir)?;

        let conn = Connection::open(dir.join(Self::DB_FILE))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        let blobs = BlobStore::open(&dir)?;
        let log = CheckpointLog::open(&dir)?;

        let store = Self { dir, conn, blobs, log };
        store.reconcile_checkpoint_log()?;
        info!(dir = %store.dir.display(), "Opened task graph store");
        Ok(store)
    }

    /// Directory holding the database, blobs and checkpoint log
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // === Plans ===

    /// Start a new plan generation and return its number
    pub fn begin_plan(&mut self, request: &str) -> StoreResult<u32> {
        debug!(request_len = request.len(), "begin_plan: called");
        let tx = self.conn.transaction()?;
        let generation: u32 = tx.query_row("SELECT COALESCE(MAX(generation), 0) + 1 FROM plan_meta", [], |r| r.get(0))?;
        tx.execute(
            "INSERT INTO plan_meta (generation, request, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![generation, request, PlanStatus::Active.as_str(), now_ms()],
        )?;
        tx.commit()?;
        info!(generation, "Started plan generation");
        Ok(generation)
    }

    /// The most recent plan generation, if any
    pub fn current_plan(&self) -> StoreResult<Option<PlanMeta>> {
        debug!("current_plan: called");
        Ok(self
            .conn
            .query_row(
                "SELECT generation, request, status, failure_reason, created_at, superseded_at
                 FROM plan_meta ORDER BY generation DESC LIMIT 1",
                [],
                plan_from_row,
            )
            .optional()?)
    }

    /// Fail every non-terminal task and mark the active plan superseded
    ///
    /// Used when a plan is replaced by a re-plan. Returns the number of tasks
    /// transitioned to failed.
    pub fn mark_active_plan_failed(&mut self, reason: &str) -> StoreResult<usize> {
        debug!(%reason, "mark_active_plan_failed: called");
        let tx = self.conn.transaction()?;
        let now = now_ms();

        let open: Vec<Task> = {
            let mut stmt = tx.prepare("SELECT body FROM tasks WHERE status NOT IN ('complete', 'failed') ORDER BY seq")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut tasks = Vec::new();
            for body in rows {
                tasks.push(serde_json::from_str(&body?)?);
            }
            tasks
        };

        for mut task in open.iter().cloned() {
            task.status = TaskStatus::Failed;
            task.updated_at = now;
            save_task(&tx, &task)?;
        }

        tx.execute(
            "UPDATE plan_meta SET status = ?1, failure_reason = ?2, superseded_at = ?3 WHERE status = ?4",
            params![PlanStatus::Superseded.as_str(), reason, now, PlanStatus::Active.as_str()],
        )?;
        tx.commit()?;

        info!(failed = open.len(), %reason, "Marked active plan failed");
        Ok(open.len())
    }

    // === Tasks ===

    /// Insert a batch of tasks and their dependency edges atomically
    ///
    /// Rejects batches with cycles, duplicate ids, or edges to unknown tasks.
    /// Tasks without a plan generation inherit the current one.
    pub fn create_tasks(&mut self, batch: Vec<Task>) -> StoreResult<Vec<String>> {
        debug!(batch_size = batch.len(), "create_tasks: called");
        let existing = self.task_ids()?;
        validate_dependency_graph(&batch, |id| existing.contains(id))?;

        let generation = self.current_plan()?.map(|p| p.generation).unwrap_or(0);
        let now = now_ms();

        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(batch.len());
        for mut task in batch {
            if task.plan_generation == 0 {
                task.plan_generation = generation;
            }
            task.status = TaskStatus::Pending;
            task.iteration_started = None;
            task.iteration_completed = None;
            task.created_at = now;
            task.updated_at = now;
            insert_task(&tx, &task)?;
            ids.push(task.id);
        }
        tx.commit()?;

        info!(count = ids.len(), "Created tasks");
        Ok(ids)
    }

    /// Add a dependency edge between existing tasks, refusing cycles
    pub fn add_dependency(&mut self, task_id: &str, depends_on: &str) -> StoreResult<()> {
        debug!(%task_id, %depends_on, "add_dependency: called");
        let mut task = self.require_task(task_id)?;
        if self.get_task(depends_on)?.is_none() {
            return Err(StoreError::UnknownDependency {
                task: task_id.to_string(),
                dependency: depends_on.to_string(),
            });
        }

        let mut tasks = self.list_tasks()?;
        for t in tasks.iter_mut() {
            if t.id == task_id {
                t.depends_on.insert(depends_on.to_string());
            }
        }
        let edges = tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.iter().map(String::as_str).collect()))
            .collect();
        if let Some(cycle) = find_cycle(&edges) {
            return Err(StoreError::CyclicDependency(cycle));
        }

        task.depends_on.insert(depends_on.to_string());
        task.updated_at = now_ms();
        let tx = self.conn.transaction()?;
        save_task(&tx, &task)?;
        tx.execute(
            "INSERT OR IGNORE INTO task_deps (task_id, depends_on) VALUES (?1, ?2)",
            params![task_id, depends_on],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        debug!(%id, "get_task: called");
        load_task(&self.conn, id)
    }

    /// Get a task, returning NotFound if missing
    pub fn require_task(&self, id: &str) -> StoreResult<Task> {
        self.get_task(id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
    }

    /// All tasks in creation order
    pub fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        debug!("list_tasks: called");
        query_bodies(&self.conn, "SELECT body FROM tasks ORDER BY seq", [])
    }

    pub fn list_tasks_by_status(&self, status: TaskStatus) -> StoreResult<Vec<Task>> {
        debug!(%status, "list_tasks_by_status: called");
        query_bodies(
            &self.conn,
            "SELECT body FROM tasks WHERE status = ?1 ORDER BY seq",
            params![status.as_str()],
        )
    }

    /// Sub-tasks created by decomposing `parent_id`
    pub fn list_subtasks(&self, parent_id: &str) -> StoreResult<Vec<Task>> {
        debug!(%parent_id, "list_subtasks: called");
        query_bodies(
            &self.conn,
            "SELECT body FROM tasks WHERE parent_task_id = ?1 ORDER BY seq",
            params![parent_id],
        )
    }

    fn task_ids(&self) -> StoreResult<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT id FROM tasks")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut ids = HashSet::new();
        for id in rows {
            ids.insert(id?);
        }
        Ok(ids)
    }

    /// The oldest pending task whose dependencies are all complete
    pub fn get_next_task(&self) -> StoreResult<Option<Task>> {
        debug!("get_next_task: called");
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT t.body FROM tasks t
                 WHERE t.status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM task_deps d
                       LEFT JOIN tasks u ON u.id = d.depends_on
                       WHERE d.task_id = t.id AND (u.status IS NULL OR u.status != 'complete')
                   )
                 ORDER BY t.seq LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;

        let task = body.map(|b| serde_json::from_str::<Task>(&b)).transpose()?;
        debug!(next = ?task.as_ref().map(|t| &t.id), "get_next_task: resolved");
        Ok(task)
    }

    /// Set a task's status, validating the transition
    ///
    /// Moving to in_progress records `iteration` as `iteration_started`;
    /// moving to complete records it as `iteration_completed`.
    pub fn update_task_status(&mut self, id: &str, status: TaskStatus, iteration: Option<u32>) -> StoreResult<Task> {
        debug!(%id, %status, ?iteration, "update_task_status: called");
        let tx = self.conn.transaction()?;
        let task = apply_status(&tx, id, status, iteration)?;
        tx.commit()?;
        Ok(task)
    }

    /// Operator resume of a blocked or needs_review task
    ///
    /// The task goes back to pending with `extra_iterations` more attempts
    /// than it has already used.
    pub fn resume_task(&mut self, id: &str, extra_iterations: u32) -> StoreResult<Task> {
        debug!(%id, extra_iterations, "resume_task: called");
        let tx = self.conn.transaction()?;
        let current = load_task(&tx, id)?.ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        if !matches!(current.status, TaskStatus::Blocked | TaskStatus::NeedsReview) {
            return Err(StoreError::InvalidTransition {
                task: id.to_string(),
                from: current.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        let used: u32 = tx.query_row(
            "SELECT COUNT(*) FROM iterations WHERE task_id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        let mut task = apply_status(&tx, id, TaskStatus::Pending, None)?;
        task.max_iterations = task.max_iterations.max(used.saturating_add(extra_iterations));
        save_task(&tx, &task)?;
        tx.commit()?;
        info!(%id, max_iterations = task.max_iterations, "Resumed task");
        Ok(task)
    }

    /// Task counts per status
    pub fn status_counts(&self) -> StoreResult<StatusCounts> {
        debug!("status_counts: called");
        let mut stmt = self.conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            counts.bump(status.parse()?, n as usize);
        }
        Ok(counts)
    }

    /// True iff no task is pending, in progress, blocked or awaiting review
    pub fn is_plan_complete(&self) -> StoreResult<bool> {
        let complete = self.status_counts()?.open() == 0;
        debug!(complete, "is_plan_complete: called");
        Ok(complete)
    }

    // === Artifacts ===

    /// Register an artifact, storing `content` in the blob area when given
    ///
    /// The artifact always gets a fresh id; existing blobs are never rewritten.
    pub fn register_artifact(&mut self, artifact: NewArtifact, content: Option<&[u8]>) -> StoreResult<Artifact> {
        debug!(task_id = %artifact.task_id, file_path = ?artifact.file_path, has_content = content.is_some(), "register_artifact: called");
        let (hash, blob_path) = match content {
            Some(bytes) => {
                let hash = content_hash(bytes);
                self.blobs.put(&hash, bytes)?;
                let blob_path = BlobStore::relative_path(&hash);
                (Some(hash), Some(blob_path))
            }
            None => (None, None),
        };

        let record = Artifact {
            id: uuid::Uuid::now_v7().to_string(),
            task_id: artifact.task_id,
            artifact_type: artifact.artifact_type,
            file_path: artifact.file_path,
            blob_path,
            content_hash: hash,
            metadata: artifact.metadata,
            iteration: artifact.iteration,
            created_at: now_ms(),
        };
        insert_artifact(&self.conn, &record)?;
        info!(artifact_id = %record.id, task_id = %record.task_id, hash = ?record.content_hash, "Registered artifact");
        Ok(record)
    }

    pub fn get_artifact(&self, id: &str) -> StoreResult<Option<Artifact>> {
        debug!(%id, "get_artifact: called");
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM artifacts WHERE id = ?1", ARTIFACT_COLUMNS),
                params![id],
                artifact_from_row,
            )
            .optional()?)
    }

    /// Artifacts for one task, or for the whole run when `task_id` is None
    pub fn list_artifacts(&self, task_id: Option<&str>) -> StoreResult<Vec<Artifact>> {
        debug!(?task_id, "list_artifacts: called");
        let mut out = Vec::new();
        match task_id {
            Some(id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM artifacts WHERE task_id = ?1 ORDER BY seq",
                    ARTIFACT_COLUMNS
                ))?;
                for a in stmt.query_map(params![id], artifact_from_row)? {
                    out.push(a?);
                }
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("SELECT {} FROM artifacts ORDER BY seq", ARTIFACT_COLUMNS))?;
                for a in stmt.query_map([], artifact_from_row)? {
                    out.push(a?);
                }
            }
        }
        Ok(out)
    }

    /// Read an artifact's stored content, if it has any
    pub fn read_artifact_content(&self, artifact: &Artifact) -> StoreResult<Option<Vec<u8>>> {
        debug!(artifact_id = %artifact.id, "read_artifact_content: called");
        match &artifact.content_hash {
            Some(hash) => Ok(Some(self.blobs.get(hash)?)),
            None => Ok(None),
        }
    }

    // === Side effects ===

    /// Record an irreversible external action exactly once
    ///
    /// Returns false without writing anything when `idempotency_key` was
    /// already recorded. That is the expected path for retried iterations,
    /// not an error.
    pub fn record_side_effect(
        &mut self,
        task_id: &str,
        effect_type: &str,
        idempotency_key: &str,
        details: Value,
        iteration: u32,
    ) -> StoreResult<bool> {
        debug!(%task_id, %effect_type, %idempotency_key, iteration, "record_side_effect: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT seq FROM side_effects WHERE idempotency_key = ?1",
                params![idempotency_key],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            debug!(%idempotency_key, "record_side_effect: already recorded, skipping");
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO side_effects (idempotency_key, task_id, effect_type, details, iteration, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                idempotency_key,
                task_id,
                effect_type,
                serde_json::to_string(&details)?,
                iteration,
                now_ms()
            ],
        )?;
        tx.commit()?;
        info!(%task_id, %effect_type, %idempotency_key, "Recorded side effect");
        Ok(true)
    }

    /// Side effects for one task, or for the whole run
    pub fn list_side_effects(&self, task_id: Option<&str>) -> StoreResult<Vec<SideEffect>> {
        debug!(?task_id, "list_side_effects: called");
        let sql = "SELECT task_id, effect_type, idempotency_key, details, iteration, created_at FROM side_effects";
        let map = |r: &Row<'_>| -> rusqlite::Result<(String, String, String, String, u32, i64)> {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        };
        let raw = match task_id {
            Some(id) => {
                let mut stmt = self.conn.prepare(&format!("{} WHERE task_id = ?1 ORDER BY seq", sql))?;
                stmt.query_map(params![id], map)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{} ORDER BY seq", sql))?;
                stmt.query_map([], map)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        raw.into_iter()
            .map(|(task_id, effect_type, idempotency_key, details, iteration, created_at)| {
                Ok(SideEffect {
                    task_id,
                    effect_type,
                    idempotency_key,
                    details: serde_json::from_str(&details)?,
                    iteration,
                    created_at,
                })
            })
            .collect()
    }

    // === Iterations ===

    /// Open a new iteration for `task_id` and return its number
    ///
    /// Numbers come from a counter that survives rollback, so they stay
    /// monotonic across the life of the run.
    pub fn start_iteration(&mut self, task_id: &str) -> StoreResult<u32> {
        debug!(%task_id, "start_iteration: called");
        let tx = self.conn.transaction()?;
        let next: u32 = tx
            .query_row("SELECT value FROM counters WHERE name = 'iteration'", [], |r| r.get(0))
            .optional()?
            .unwrap_or(0)
            + 1;
        tx.execute(
            "INSERT INTO counters (name, value) VALUES ('iteration', ?1)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![next],
        )?;
        tx.execute(
            "INSERT INTO iterations (iteration, task_id, started_at) VALUES (?1, ?2, ?3)",
            params![next, task_id, now_ms()],
        )?;
        tx.commit()?;
        debug!(%task_id, iteration = next, "start_iteration: opened");
        Ok(next)
    }

    /// Close an iteration record; completed records are never rewritten
    pub fn complete_iteration(&mut self, completion: &IterationCompletion) -> StoreResult<()> {
        debug!(iteration = completion.iteration, outcome = %completion.outcome, "complete_iteration: called");
        let tx = self.conn.transaction()?;
        write_completion(&tx, completion)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_iteration(&self, iteration: u32) -> StoreResult<Option<IterationRecord>> {
        debug!(iteration, "get_iteration: called");
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM iterations i WHERE i.iteration = ?1", ITERATION_COLUMNS),
                params![iteration],
                iteration_from_row,
            )
            .optional()?)
    }

    /// Iteration history, oldest first
    pub fn list_iterations(&self, task_id: Option<&str>) -> StoreResult<Vec<IterationRecord>> {
        debug!(?task_id, "list_iterations: called");
        let mut out = Vec::new();
        match task_id {
            Some(id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM iterations i WHERE i.task_id = ?1 ORDER BY i.iteration",
                    ITERATION_COLUMNS
                ))?;
                for r in stmt.query_map(params![id], iteration_from_row)? {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM iterations i ORDER BY i.iteration",
                    ITERATION_COLUMNS
                ))?;
                for r in stmt.query_map([], iteration_from_row)? {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    /// Number of iterations spent on a task
    pub fn iteration_count(&self, task_id: &str) -> StoreResult<u32> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM iterations WHERE task_id = ?1",
            params![task_id],
            |r| r.get(0),
        )?)
    }

    /// Number of iterations across the whole run
    pub fn total_iterations(&self) -> StoreResult<u32> {
        Ok(self
            .conn
            .query_row("SELECT value FROM counters WHERE name = 'iteration'", [], |r| r.get(0))
            .optional()?
            .unwrap_or(0))
    }

    // === Failed approaches and learnings ===

    pub fn record_failed_approach(
        &mut self,
        task_id: Option<&str>,
        approach: &str,
        why_failed: &str,
        iteration: u32,
    ) -> StoreResult<()> {
        debug!(?task_id, iteration, "record_failed_approach: called");
        self.conn.execute(
            "INSERT INTO failed_approaches (task_id, approach, why_failed, iteration, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, approach, why_failed, iteration, now_ms()],
        )?;
        Ok(())
    }

    /// Failed approaches for one task (or all), most recent first
    pub fn list_failed_approaches(&self, task_id: Option<&str>, limit: usize) -> StoreResult<Vec<FailedApproach>> {
        debug!(?task_id, limit, "list_failed_approaches: called");
        let map = |r: &Row<'_>| {
            Ok(FailedApproach {
                task_id: r.get(0)?,
                approach: r.get(1)?,
                why_failed: r.get(2)?,
                iteration: r.get(3)?,
                created_at: r.get(4)?,
            })
        };
        let sql = "SELECT task_id, approach, why_failed, iteration, created_at FROM failed_approaches";
        let limit = limit as i64;
        let rows = match task_id {
            Some(id) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{} WHERE task_id = ?1 ORDER BY seq DESC LIMIT ?2", sql))?;
                stmt.query_map(params![id, limit], map)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{} ORDER BY seq DESC LIMIT ?1", sql))?;
                stmt.query_map(params![limit], map)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    pub fn record_learning(&mut self, task_id: Option<&str>, iteration: u32, text: &str) -> StoreResult<()> {
        debug!(?task_id, iteration, "record_learning: called");
        self.conn.execute(
            "INSERT INTO learnings (task_id, iteration, text, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, iteration, text, now_ms()],
        )?;
        Ok(())
    }

    /// The most recent `k` learnings across all tasks, most recent first
    pub fn recent_learnings(&self, k: usize) -> StoreResult<Vec<Learning>> {
        debug!(k, "recent_learnings: called");
        let mut stmt = self
            .conn
            .prepare("SELECT task_id, iteration, text, created_at FROM learnings ORDER BY seq DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![k as i64], |r| {
            Ok(Learning {
                task_id: r.get(0)?,
                iteration: r.get(1)?,
                text: r.get(2)?,
                created_at: r.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // === Recovery ===

    /// Undo the traces of a crash mid-iteration
    ///
    /// Tasks stuck in in_progress go back to pending and open iteration rows
    /// are closed as incomplete, so the run can resume from a clean state.
    pub fn recover_interrupted(&mut self) -> StoreResult<RecoveryStats> {
        debug!("recover_interrupted: called");
        let tx = self.conn.transaction()?;
        let stuck: Vec<Task> = query_bodies(
            &tx,
            "SELECT body FROM tasks WHERE status = 'in_progress' ORDER BY seq",
            [],
        )?;
        for task in &stuck {
            apply_status(&tx, &task.id, TaskStatus::Pending, None)?;
        }
        let closed = tx.execute(
            "UPDATE iterations SET outcome = 'incomplete', completed_at = ?1 WHERE outcome IS NULL",
            params![now_ms()],
        )?;
        tx.commit()?;

        let stats = RecoveryStats {
            tasks_reset: stuck.len(),
            iterations_closed: closed,
        };
        if stats.tasks_reset > 0 || stats.iterations_closed > 0 {
            warn!(%stats, "Recovered interrupted run state");
        }
        Ok(stats)
    }

    /// Drop trailing log entries whose checkpoint transaction never committed
    fn reconcile_checkpoint_log(&self) -> StoreResult<()> {
        let mut stmt = self.conn.prepare("SELECT ref FROM checkpoints")?;
        let known: HashSet<String> = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<_>>()?;
        let dropped = self.log.retain_known_prefix(&known)?;
        if dropped > 0 {
            warn!(dropped, "Dropped uncommitted checkpoint log entries");
        }
        Ok(())
    }
}

// === Row helpers (shared with checkpoint restore) ===

pub(crate) const ARTIFACT_COLUMNS: &str =
    "id, task_id, artifact_type, file_path, blob_path, content_hash, metadata, iteration, created_at";

pub(crate) const ITERATION_COLUMNS: &str = "i.iteration, i.task_id, i.outcome, i.completion_confidence, i.tokens_used, \
     i.tools_used, i.learnings, i.artifacts_produced, \
     (SELECT c.ref FROM checkpoints c WHERE c.iteration = i.iteration ORDER BY c.seq DESC LIMIT 1), \
     i.started_at, i.completed_at";

fn json_col<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_col<T: std::str::FromStr<Err = StoreError>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse()
        .map_err(|e: StoreError| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn artifact_from_row(r: &Row<'_>) -> rusqlite::Result<Artifact> {
    let artifact_type: String = r.get(2)?;
    let metadata: String = r.get(6)?;
    Ok(Artifact {
        id: r.get(0)?,
        task_id: r.get(1)?,
        artifact_type: parse_col::<ArtifactType>(2, &artifact_type)?,
        file_path: r.get(3)?,
        blob_path: r.get(4)?,
        content_hash: r.get(5)?,
        metadata: json_col(6, &metadata)?,
        iteration: r.get(7)?,
        created_at: r.get(8)?,
    })
}

pub(crate) fn iteration_from_row(r: &Row<'_>) -> rusqlite::Result<IterationRecord> {
    let outcome: Option<String> = r.get(2)?;
    let tools: String = r.get(5)?;
    let learnings: String = r.get(6)?;
    let artifacts: String = r.get(7)?;
    Ok(IterationRecord {
        iteration: r.get(0)?,
        task_id: r.get(1)?,
        outcome: outcome.map(|o| parse_col(2, &o)).transpose()?,
        completion_confidence: r.get(3)?,
        tokens_used: r.get::<_, i64>(4)? as u64,
        tools_used: json_col(5, &tools)?,
        learnings: json_col(6, &learnings)?,
        artifacts_produced: json_col(7, &artifacts)?,
        checkpoint: r.get(8)?,
        started_at: r.get(9)?,
        completed_at: r.get(10)?,
    })
}

fn plan_from_row(r: &Row<'_>) -> rusqlite::Result<PlanMeta> {
    let status: String = r.get(2)?;
    Ok(PlanMeta {
        generation: r.get(0)?,
        request: r.get(1)?,
        status: parse_col(2, &status)?,
        failure_reason: r.get(3)?,
        created_at: r.get(4)?,
        superseded_at: r.get(5)?,
    })
}

pub(crate) fn list_plans(conn: &Connection) -> StoreResult<Vec<PlanMeta>> {
    let mut stmt = conn.prepare(
        "SELECT generation, request, status, failure_reason, created_at, superseded_at FROM plan_meta ORDER BY generation",
    )?;
    Ok(stmt.query_map([], plan_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn insert_plan(conn: &Connection, plan: &PlanMeta) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO plan_meta (generation, request, status, failure_reason, created_at, superseded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            plan.generation,
            plan.request,
            plan.status.as_str(),
            plan.failure_reason,
            plan.created_at,
            plan.superseded_at
        ],
    )?;
    Ok(())
}

pub(crate) fn query_bodies<T: serde::de::DeserializeOwned, P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StoreResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for body in rows {
        out.push(serde_json::from_str(&body?)?);
    }
    Ok(out)
}

pub(crate) fn load_task(conn: &Connection, id: &str) -> StoreResult<Option<Task>> {
    let body: Option<String> = conn
        .query_row("SELECT body FROM tasks WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
}

pub(crate) fn insert_task(conn: &Connection, task: &Task) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO tasks (id, status, parent_task_id, plan_generation, body, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            task.id,
            task.status.as_str(),
            task.parent_task_id,
            task.plan_generation,
            serde_json::to_string(task)?,
            task.created_at,
            task.updated_at
        ],
    )?;
    for dep in &task.depends_on {
        conn.execute(
            "INSERT OR IGNORE INTO task_deps (task_id, depends_on) VALUES (?1, ?2)",
            params![task.id, dep],
        )?;
    }
    Ok(())
}

pub(crate) fn save_task(conn: &Connection, task: &Task) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE tasks SET status = ?2, body = ?3, updated_at = ?4 WHERE id = ?1",
        params![task.id, task.status.as_str(), serde_json::to_string(task)?, task.updated_at],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!("task {}", task.id)));
    }
    Ok(())
}

pub(crate) fn apply_status(conn: &Connection, id: &str, status: TaskStatus, iteration: Option<u32>) -> StoreResult<Task> {
    let mut task = load_task(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
    if task.status != status && !task.status.can_transition_to(status) {
        return Err(StoreError::InvalidTransition {
            task: id.to_string(),
            from: task.status.to_string(),
            to: status.to_string(),
        });
    }
    task.status = status;
    match status {
        TaskStatus::InProgress => task.iteration_started = iteration.or(task.iteration_started),
        TaskStatus::Complete => task.iteration_completed = iteration.or(task.iteration_completed),
        _ => {}
    }
    task.updated_at = now_ms();
    save_task(conn, &task)?;
    debug!(%id, %status, "apply_status: saved");
    Ok(task)
}

pub(crate) fn insert_artifact(conn: &Connection, a: &Artifact) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO artifacts (id, task_id, artifact_type, file_path, blob_path, content_hash, metadata, iteration, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            a.id,
            a.task_id,
            a.artifact_type.as_str(),
            a.file_path,
            a.blob_path,
            a.content_hash,
            serde_json::to_string(&a.metadata)?,
            a.iteration,
            a.created_at
        ],
    )?;
    Ok(())
}

pub(crate) fn write_completion(conn: &Connection, c: &IterationCompletion) -> StoreResult<()> {
    let current: Option<Option<String>> = conn
        .query_row(
            "SELECT outcome FROM iterations WHERE iteration = ?1",
            params![c.iteration],
            |r| r.get(0),
        )
        .optional()?;
    match current {
        None => return Err(StoreError::NotFound(format!("iteration {}", c.iteration))),
        Some(Some(_)) => return Err(StoreError::IterationAlreadyComplete(c.iteration)),
        Some(None) => {}
    }
    conn.execute(
        "UPDATE iterations SET outcome = ?2, completion_confidence = ?3, tokens_used = ?4, tools_used = ?5,
             learnings = ?6, artifacts_produced = ?7, completed_at = ?8
         WHERE iteration = ?1",
        params![
            c.iteration,
            c.outcome.as_str(),
            c.completion_confidence,
            c.tokens_used as i64,
            serde_json::to_string(&c.tools_used)?,
            serde_json::to_string(&c.learnings)?,
            serde_json::to_string(&c.artifacts_produced)?,
            now_ms()
        ],
    )?;
    Ok(())
}
