//! Checkpoints and rollback
//!
//! A checkpoint is a JSON snapshot of every table except side effects,
//! stored as a content-addressed blob, plus a manifest appended to
//! `checkpoints.jsonl`. The manifest's SHA-256 is the checkpoint ref, and each
//! manifest names its parent, so the log forms a linear chain.

use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, sha256_hex};
use crate::error::{StoreError, StoreResult};
use crate::now_ms;
use crate::records::{Artifact, FailedApproach, IterationCompletion, IterationRecord, Learning, PlanMeta};
use crate::store::{
    ARTIFACT_COLUMNS, ITERATION_COLUMNS, TaskGraphStore, apply_status, artifact_from_row, insert_artifact, insert_plan,
    insert_task, iteration_from_row, list_plans, query_bodies, write_completion,
};
use crate::task::{Task, TaskStatus};

/// One entry of the checkpoint log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 64 hex chars, SHA-256 of the other manifest fields
    #[serde(rename = "ref")]
    pub reference: String,
    pub parent: Option<String>,
    /// Blob key of the snapshot
    pub snapshot: String,
    pub message: String,
    pub iteration: u32,
    pub metadata: Value,
    pub created_at: i64,
}

#[derive(Serialize)]
struct ManifestBody<'a> {
    parent: &'a Option<String>,
    snapshot: &'a str,
    message: &'a str,
    iteration: u32,
    metadata: &'a Value,
    created_at: i64,
}

impl Checkpoint {
    fn new(parent: Option<String>, snapshot: String, message: &str, iteration: u32, metadata: Value) -> StoreResult<Self> {
        let created_at = now_ms();
        let body = ManifestBody {
            parent: &parent,
            snapshot: &snapshot,
            message,
            iteration,
            metadata: &metadata,
            created_at,
        };
        let reference = sha256_hex(&serde_json::to_vec(&body)?);
        Ok(Self {
            reference,
            parent,
            snapshot,
            message: message.to_string(),
            iteration,
            metadata,
            created_at,
        })
    }

    /// Abbreviated ref for display
    pub fn short_ref(&self) -> &str {
        &self.reference[..self.reference.len().min(12)]
    }
}

/// Everything a rollback restores
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    tasks: Vec<Task>,
    artifacts: Vec<Artifact>,
    iterations: Vec<IterationRecord>,
    failed_approaches: Vec<FailedApproach>,
    learnings: Vec<Learning>,
    plans: Vec<PlanMeta>,
}

impl Snapshot {
    fn capture(conn: &Connection) -> StoreResult<Self> {
        let tasks = query_bodies(conn, "SELECT body FROM tasks ORDER BY seq", [])?;

        let mut stmt = conn.prepare(&format!("SELECT {} FROM artifacts ORDER BY seq", ARTIFACT_COLUMNS))?;
        let artifacts = stmt
            .query_map([], artifact_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM iterations i ORDER BY i.iteration",
            ITERATION_COLUMNS
        ))?;
        let iterations = stmt
            .query_map([], iteration_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt =
            conn.prepare("SELECT task_id, approach, why_failed, iteration, created_at FROM failed_approaches ORDER BY seq")?;
        let failed_approaches = stmt
            .query_map([], |r| {
                Ok(FailedApproach {
                    task_id: r.get(0)?,
                    approach: r.get(1)?,
                    why_failed: r.get(2)?,
                    iteration: r.get(3)?,
                    created_at: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT task_id, iteration, text, created_at FROM learnings ORDER BY seq")?;
        let learnings = stmt
            .query_map([], |r| {
                Ok(Learning {
                    task_id: r.get(0)?,
                    iteration: r.get(1)?,
                    text: r.get(2)?,
                    created_at: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Self {
            tasks,
            artifacts,
            iterations,
            failed_approaches,
            learnings,
            plans: list_plans(conn)?,
        })
    }

    fn restore(&self, conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "DELETE FROM tasks;
             DELETE FROM task_deps;
             DELETE FROM artifacts;
             DELETE FROM iterations;
             DELETE FROM failed_approaches;
             DELETE FROM learnings;
             DELETE FROM plan_meta;",
        )?;

        for task in &self.tasks {
            insert_task(conn, task)?;
        }
        for artifact in &self.artifacts {
            insert_artifact(conn, artifact)?;
        }
        for it in &self.iterations {
            conn.execute(
                "INSERT INTO iterations (iteration, task_id, outcome, completion_confidence, tokens_used, tools_used,
                     learnings, artifacts_produced, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    it.iteration,
                    it.task_id,
                    it.outcome.map(|o| o.as_str()),
                    it.completion_confidence,
                    it.tokens_used as i64,
                    serde_json::to_string(&it.tools_used)?,
                    serde_json::to_string(&it.learnings)?,
                    serde_json::to_string(&it.artifacts_produced)?,
                    it.started_at,
                    it.completed_at
                ],
            )?;
        }
        for fa in &self.failed_approaches {
            conn.execute(
                "INSERT INTO failed_approaches (task_id, approach, why_failed, iteration, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![fa.task_id, fa.approach, fa.why_failed, fa.iteration, fa.created_at],
            )?;
        }
        for l in &self.learnings {
            conn.execute(
                "INSERT INTO learnings (task_id, iteration, text, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![l.task_id, l.iteration, l.text, l.created_at],
            )?;
        }
        for plan in &self.plans {
            insert_plan(conn, plan)?;
        }
        Ok(())
    }
}

/// Append-only manifest log guarded by an exclusive file lock
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    path: PathBuf,
}

impl CheckpointLog {
    pub const FILE: &'static str = "checkpoints.jsonl";

    pub fn open(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(Self::FILE);
        OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(?path, "CheckpointLog::open: called");
        Ok(Self { path })
    }

    fn open_locked(&self) -> StoreResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    /// Append one manifest line, returning the log length before the write
    ///
    /// A failed write truncates the log back to that length.
    pub fn append(&self, checkpoint: &Checkpoint) -> StoreResult<u64> {
        let mut file = self.open_locked()?;
        let offset = file.metadata()?.len();

        let mut line = serde_json::to_string(checkpoint)?;
        line.push('\n');

        let written = (|| -> std::io::Result<()> {
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(line.as_bytes())?;
            file.sync_data()
        })();

        if let Err(e) = written {
            warn!(error = %e, offset, "CheckpointLog::append: write failed, truncating");
            file.set_len(offset)?;
            return Err(e.into());
        }
        debug!(reference = %checkpoint.reference, offset, "CheckpointLog::append: appended");
        Ok(offset)
    }

    /// Cut the log back to `len` bytes
    pub fn truncate_to(&self, len: u64) -> StoreResult<()> {
        let file = self.open_locked()?;
        file.set_len(len)?;
        file.sync_data()?;
        debug!(len, "CheckpointLog::truncate_to: truncated");
        Ok(())
    }

    /// All manifests, oldest first
    pub fn read_all(&self) -> StoreResult<Vec<Checkpoint>> {
        let file = File::open(&self.path)?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    /// Drop trailing entries not in `known`, returning how many were dropped
    ///
    /// Only a crash between the log append and the database commit can leave
    /// such entries, and they are always at the tail.
    pub fn retain_known_prefix(&self, known: &HashSet<String>) -> StoreResult<usize> {
        let file = self.open_locked()?;
        let mut keep_len = 0u64;
        let mut dropped = 0usize;
        let mut reader = BufReader::new(&file);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            let is_known = serde_json::from_str::<Checkpoint>(line.trim_end())
                .map(|cp| known.contains(&cp.reference))
                .unwrap_or(false);
            if is_known && dropped == 0 {
                keep_len += n as u64;
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            file.set_len(keep_len)?;
            file.sync_data()?;
        }
        Ok(dropped)
    }
}

/// Everything written when an iteration finishes, committed as one unit
#[derive(Debug, Clone)]
pub struct IterationCommit {
    pub task_id: String,
    pub completion: IterationCompletion,
    /// Status change for the task, if any
    pub status: Option<TaskStatus>,
    /// `(approach, why_failed)` for non-success outcomes
    pub failed_approach: Option<(String, String)>,
    pub message: String,
    pub metadata: Value,
}

impl TaskGraphStore {
    /// Take a checkpoint of the current state
    pub fn checkpoint(&mut self, message: &str, iteration: u32, metadata: Value) -> StoreResult<Checkpoint> {
        debug!(%message, iteration, "checkpoint: called");
        let tx = self.conn.transaction()?;
        let (checkpoint, offset) = write_checkpoint(&self.blobs, &self.log, &tx, message, iteration, metadata)?;
        if let Err(e) = tx.commit() {
            self.log.truncate_to(offset)?;
            return Err(e.into());
        }
        info!(reference = %checkpoint.short_ref(), iteration, "Checkpoint taken");
        Ok(checkpoint)
    }

    /// Complete an iteration, apply its status change and checkpoint, atomically
    ///
    /// If any step fails (including the checkpoint write) nothing is applied:
    /// the iteration stays open and the task keeps its previous status.
    pub fn commit_iteration(&mut self, commit: &IterationCommit) -> StoreResult<Checkpoint> {
        let iteration = commit.completion.iteration;
        debug!(task_id = %commit.task_id, iteration, outcome = %commit.completion.outcome, status = ?commit.status, "commit_iteration: called");
        let tx = self.conn.transaction()?;

        write_completion(&tx, &commit.completion)?;
        let now = now_ms();
        for text in &commit.completion.learnings {
            tx.execute(
                "INSERT INTO learnings (task_id, iteration, text, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![commit.task_id, iteration, text, now],
            )?;
        }
        if let Some((approach, why_failed)) = &commit.failed_approach {
            tx.execute(
                "INSERT INTO failed_approaches (task_id, approach, why_failed, iteration, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![commit.task_id, approach, why_failed, iteration, now],
            )?;
        }
        if let Some(status) = commit.status {
            apply_status(&tx, &commit.task_id, status, Some(iteration))?;
        }

        let (checkpoint, offset) = write_checkpoint(
            &self.blobs,
            &self.log,
            &tx,
            &commit.message,
            iteration,
            commit.metadata.clone(),
        )?;
        if let Err(e) = tx.commit() {
            self.log.truncate_to(offset)?;
            return Err(e.into());
        }
        info!(task_id = %commit.task_id, iteration, reference = %checkpoint.short_ref(), "Committed iteration");
        Ok(checkpoint)
    }

    /// Restore every table except side effects to the state at `reference`
    ///
    /// `reference` may be a unique prefix of the full ref. Later checkpoints
    /// stay in the log.
    pub fn rollback_to(&mut self, reference: &str) -> StoreResult<Checkpoint> {
        debug!(%reference, "rollback_to: called");
        let checkpoint = self.find_checkpoint(reference)?;

        let bytes = self.blobs.get(&checkpoint.snapshot)?;
        if sha256_hex(&bytes) != checkpoint.snapshot {
            return Err(StoreError::Corrupt(format!(
                "snapshot {} does not match its digest",
                checkpoint.snapshot
            )));
        }
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        let tx = self.conn.transaction()?;
        snapshot.restore(&tx)?;
        tx.commit()?;

        info!(reference = %checkpoint.short_ref(), tasks = snapshot.tasks.len(), "Rolled back to checkpoint");
        Ok(checkpoint)
    }

    /// Look up a checkpoint by full ref or unique prefix
    pub fn find_checkpoint(&self, reference: &str) -> StoreResult<Checkpoint> {
        let mut matches: Vec<Checkpoint> = self
            .list_checkpoints()?
            .into_iter()
            .filter(|cp| cp.reference.starts_with(reference))
            .collect();
        if reference.is_empty() || matches.len() != 1 {
            return Err(StoreError::CheckpointNotFound(reference.to_string()));
        }
        Ok(matches.remove(0))
    }

    /// Checkpoints, oldest first
    pub fn list_checkpoints(&self) -> StoreResult<Vec<Checkpoint>> {
        debug!("list_checkpoints: called");
        let mut stmt = self.conn.prepare(
            "SELECT ref, parent, snapshot, message, iteration, metadata, created_at FROM checkpoints ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, u32>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, i64>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (reference, parent, snapshot, message, iteration, metadata, created_at) = row?;
            out.push(Checkpoint {
                reference,
                parent,
                snapshot,
                message,
                iteration,
                metadata: serde_json::from_str(&metadata)?,
                created_at,
            });
        }
        Ok(out)
    }

    /// The most recent checkpoint
    pub fn head_checkpoint(&self) -> StoreResult<Option<Checkpoint>> {
        Ok(self.list_checkpoints()?.pop())
    }

    /// Manifests as they appear in the on-disk log
    pub fn checkpoint_log(&self) -> StoreResult<Vec<Checkpoint>> {
        self.log.read_all()
    }
}

/// Snapshot, write the blob, append the manifest and record it in `conn`
///
/// Returns the log offset to truncate back to if the caller's transaction
/// fails to commit.
fn write_checkpoint(
    blobs: &BlobStore,
    log: &CheckpointLog,
    conn: &Connection,
    message: &str,
    iteration: u32,
    metadata: Value,
) -> StoreResult<(Checkpoint, u64)> {
    let snapshot = Snapshot::capture(conn)?;
    let bytes = serde_json::to_vec(&snapshot)?;
    let snapshot_hash = sha256_hex(&bytes);
    blobs.put(&snapshot_hash, &bytes)?;

    let parent: Option<String> = conn
        .query_row("SELECT ref FROM checkpoints ORDER BY seq DESC LIMIT 1", [], |r| r.get(0))
        .optional()?;
    let checkpoint = Checkpoint::new(parent, snapshot_hash, message, iteration, metadata)?;

    let offset = log.append(&checkpoint)?;
    let inserted = conn.execute(
        "INSERT INTO checkpoints (ref, parent, snapshot, message, iteration, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            checkpoint.reference,
            checkpoint.parent,
            checkpoint.snapshot,
            checkpoint.message,
            checkpoint.iteration,
            serde_json::to_string(&checkpoint.metadata)?,
            checkpoint.created_at
        ],
    );
    if let Err(e) = inserted {
        log.truncate_to(offset)?;
        return Err(e.into());
    }
    Ok((checkpoint, offset))
}
