//! StateManager - actor that owns a TaskGraphStore
//!
//! Processes commands via channels so async callers get serialized access to
//! one run's persistent state.

use serde_json::Value;
use std::path::Path;
use taskstore::{
    Artifact, Checkpoint, ContextLimits, FailedApproach, IterationCommit, IterationRecord, Learning, NewArtifact,
    PlanMeta, RecoveryStats, SideEffect, StatusCounts, Task, TaskContext, TaskGraphStore, TaskStatus,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a new StateManager actor over the store in `dir`
    pub fn spawn(dir: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(dir = %dir.as_ref().display(), "spawn: called");
        let store = TaskGraphStore::open(dir.as_ref())?;
        Ok(Self::from_store(store))
    }

    /// Spawn the actor over an already opened store
    pub fn from_store(store: TaskGraphStore) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Plan operations ===

    pub async fn begin_plan(&self, request: &str) -> StateResponse<u32> {
        debug!("begin_plan: called");
        self.request(|reply| StateCommand::BeginPlan {
            request: request.to_string(),
            reply,
        })
        .await
    }

    pub async fn current_plan(&self) -> StateResponse<Option<PlanMeta>> {
        debug!("current_plan: called");
        self.request(|reply| StateCommand::CurrentPlan { reply }).await
    }

    /// Fail all open tasks of the active plan and supersede it
    pub async fn mark_active_plan_failed(&self, reason: &str) -> StateResponse<usize> {
        debug!(%reason, "mark_active_plan_failed: called");
        self.request(|reply| StateCommand::MarkActivePlanFailed {
            reason: reason.to_string(),
            reply,
        })
        .await
    }

    // === Task operations ===

    pub async fn create_tasks(&self, tasks: Vec<Task>) -> StateResponse<Vec<String>> {
        debug!(count = tasks.len(), "create_tasks: called");
        self.request(|reply| StateCommand::CreateTasks { tasks, reply }).await
    }

    pub async fn add_dependency(&self, task_id: &str, depends_on: &str) -> StateResponse<()> {
        debug!(%task_id, %depends_on, "add_dependency: called");
        self.request(|reply| StateCommand::AddDependency {
            task_id: task_id.to_string(),
            depends_on: depends_on.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        debug!(%id, "get_task: called");
        self.request(|reply| StateCommand::GetTask {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Get a task, failing with NotFound if it does not exist
    pub async fn get_task_required(&self, id: &str) -> StateResponse<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::Store(taskstore::StoreError::NotFound(format!("task {}", id))))
    }

    pub async fn list_tasks(&self, status_filter: Option<TaskStatus>) -> StateResponse<Vec<Task>> {
        debug!(?status_filter, "list_tasks: called");
        self.request(|reply| StateCommand::ListTasks { status_filter, reply })
            .await
    }

    pub async fn list_subtasks(&self, parent_id: &str) -> StateResponse<Vec<Task>> {
        debug!(%parent_id, "list_subtasks: called");
        self.request(|reply| StateCommand::ListSubtasks {
            parent_id: parent_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_next_task(&self) -> StateResponse<Option<Task>> {
        debug!("get_next_task: called");
        self.request(|reply| StateCommand::GetNextTask { reply }).await
    }

    pub async fn update_task_status(&self, id: &str, status: TaskStatus, iteration: Option<u32>) -> StateResponse<Task> {
        debug!(%id, %status, ?iteration, "update_task_status: called");
        self.request(|reply| StateCommand::UpdateTaskStatus {
            id: id.to_string(),
            status,
            iteration,
            reply,
        })
        .await
    }

    /// Operator resume of a blocked or needs_review task
    pub async fn resume_task(&self, id: &str, extra_iterations: u32) -> StateResponse<Task> {
        debug!(%id, extra_iterations, "resume_task: called");
        self.request(|reply| StateCommand::ResumeTask {
            id: id.to_string(),
            extra_iterations,
            reply,
        })
        .await
    }

    pub async fn status_counts(&self) -> StateResponse<StatusCounts> {
        debug!("status_counts: called");
        self.request(|reply| StateCommand::StatusCounts { reply }).await
    }

    pub async fn is_plan_complete(&self) -> StateResponse<bool> {
        debug!("is_plan_complete: called");
        self.request(|reply| StateCommand::IsPlanComplete { reply }).await
    }

    // === Artifacts and side effects ===

    pub async fn register_artifact(&self, artifact: NewArtifact, content: Option<Vec<u8>>) -> StateResponse<Artifact> {
        debug!(task_id = %artifact.task_id, "register_artifact: called");
        self.request(|reply| StateCommand::RegisterArtifact {
            artifact,
            content,
            reply,
        })
        .await
    }

    pub async fn list_artifacts(&self, task_id: Option<&str>) -> StateResponse<Vec<Artifact>> {
        debug!(?task_id, "list_artifacts: called");
        self.request(|reply| StateCommand::ListArtifacts {
            task_id: task_id.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn read_artifact_content(&self, artifact: &Artifact) -> StateResponse<Option<Vec<u8>>> {
        debug!(artifact_id = %artifact.id, "read_artifact_content: called");
        self.request(|reply| StateCommand::ReadArtifactContent {
            artifact: Box::new(artifact.clone()),
            reply,
        })
        .await
    }

    /// Record a side effect; false means the key was already recorded
    pub async fn record_side_effect(
        &self,
        task_id: &str,
        effect_type: &str,
        idempotency_key: &str,
        details: Value,
        iteration: u32,
    ) -> StateResponse<bool> {
        debug!(%task_id, %effect_type, %idempotency_key, "record_side_effect: called");
        self.request(|reply| StateCommand::RecordSideEffect {
            task_id: task_id.to_string(),
            effect_type: effect_type.to_string(),
            idempotency_key: idempotency_key.to_string(),
            details,
            iteration,
            reply,
        })
        .await
    }

    pub async fn list_side_effects(&self, task_id: Option<&str>) -> StateResponse<Vec<SideEffect>> {
        debug!(?task_id, "list_side_effects: called");
        self.request(|reply| StateCommand::ListSideEffects {
            task_id: task_id.map(str::to_string),
            reply,
        })
        .await
    }

    // === Iterations and history ===

    pub async fn start_iteration(&self, task_id: &str) -> StateResponse<u32> {
        debug!(%task_id, "start_iteration: called");
        self.request(|reply| StateCommand::StartIteration {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn iteration_count(&self, task_id: &str) -> StateResponse<u32> {
        self.request(|reply| StateCommand::IterationCount {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn total_iterations(&self) -> StateResponse<u32> {
        self.request(|reply| StateCommand::TotalIterations { reply }).await
    }

    pub async fn list_iterations(&self, task_id: Option<&str>) -> StateResponse<Vec<IterationRecord>> {
        debug!(?task_id, "list_iterations: called");
        self.request(|reply| StateCommand::ListIterations {
            task_id: task_id.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn list_failed_approaches(&self, task_id: Option<&str>, limit: usize) -> StateResponse<Vec<FailedApproach>> {
        debug!(?task_id, limit, "list_failed_approaches: called");
        self.request(|reply| StateCommand::ListFailedApproaches {
            task_id: task_id.map(str::to_string),
            limit,
            reply,
        })
        .await
    }

    pub async fn recent_learnings(&self, limit: usize) -> StateResponse<Vec<Learning>> {
        debug!(limit, "recent_learnings: called");
        self.request(|reply| StateCommand::RecentLearnings { limit, reply })
            .await
    }

    pub async fn generate_task_context(&self, task: &Task, limits: &ContextLimits) -> StateResponse<TaskContext> {
        debug!(task_id = %task.id, "generate_task_context: called");
        self.request(|reply| StateCommand::GenerateContext {
            task: Box::new(task.clone()),
            limits: limits.clone(),
            reply,
        })
        .await
    }

    // === Checkpoints ===

    /// Complete an iteration and checkpoint, atomically
    pub async fn commit_iteration(&self, commit: IterationCommit) -> StateResponse<Checkpoint> {
        debug!(task_id = %commit.task_id, iteration = commit.completion.iteration, "commit_iteration: called");
        self.request(|reply| StateCommand::CommitIteration {
            commit: Box::new(commit),
            reply,
        })
        .await
    }

    pub async fn checkpoint(&self, message: &str, iteration: u32, metadata: Value) -> StateResponse<Checkpoint> {
        debug!(%message, iteration, "checkpoint: called");
        self.request(|reply| StateCommand::Checkpoint {
            message: message.to_string(),
            iteration,
            metadata,
            reply,
        })
        .await
    }

    pub async fn rollback_to(&self, reference: &str) -> StateResponse<Checkpoint> {
        debug!(%reference, "rollback_to: called");
        self.request(|reply| StateCommand::RollbackTo {
            reference: reference.to_string(),
            reply,
        })
        .await
    }

    pub async fn list_checkpoints(&self) -> StateResponse<Vec<Checkpoint>> {
        debug!("list_checkpoints: called");
        self.request(|reply| StateCommand::ListCheckpoints { reply }).await
    }

    // === Recovery ===

    pub async fn recover_interrupted(&self) -> StateResponse<RecoveryStats> {
        debug!("recover_interrupted: called");
        self.request(|reply| StateCommand::RecoverInterrupted { reply })
            .await
    }

    /// Shutdown the actor
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

/// The actor loop that owns the store and processes commands
async fn actor_loop(mut store: TaskGraphStore, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            // Plan operations
            StateCommand::BeginPlan { request, reply } => {
                debug!("actor_loop: BeginPlan command");
                let _ = reply.send(store.begin_plan(&request).map_err(StateError::from));
            }
            StateCommand::CurrentPlan { reply } => {
                let _ = reply.send(store.current_plan().map_err(StateError::from));
            }
            StateCommand::MarkActivePlanFailed { reason, reply } => {
                debug!(%reason, "actor_loop: MarkActivePlanFailed command");
                let _ = reply.send(store.mark_active_plan_failed(&reason).map_err(StateError::from));
            }

            // Task operations
            StateCommand::CreateTasks { tasks, reply } => {
                debug!(count = tasks.len(), "actor_loop: CreateTasks command");
                let _ = reply.send(store.create_tasks(tasks).map_err(StateError::from));
            }
            StateCommand::AddDependency {
                task_id,
                depends_on,
                reply,
            } => {
                debug!(%task_id, %depends_on, "actor_loop: AddDependency command");
                let _ = reply.send(store.add_dependency(&task_id, &depends_on).map_err(StateError::from));
            }
            StateCommand::GetTask { id, reply } => {
                let _ = reply.send(store.get_task(&id).map_err(StateError::from));
            }
            StateCommand::ListTasks { status_filter, reply } => {
                let result = match status_filter {
                    Some(status) => store.list_tasks_by_status(status),
                    None => store.list_tasks(),
                };
                let _ = reply.send(result.map_err(StateError::from));
            }
            StateCommand::ListSubtasks { parent_id, reply } => {
                let _ = reply.send(store.list_subtasks(&parent_id).map_err(StateError::from));
            }
            StateCommand::GetNextTask { reply } => {
                let _ = reply.send(store.get_next_task().map_err(StateError::from));
            }
            StateCommand::UpdateTaskStatus {
                id,
                status,
                iteration,
                reply,
            } => {
                debug!(%id, %status, "actor_loop: UpdateTaskStatus command");
                let _ = reply.send(store.update_task_status(&id, status, iteration).map_err(StateError::from));
            }
            StateCommand::ResumeTask {
                id,
                extra_iterations,
                reply,
            } => {
                debug!(%id, "actor_loop: ResumeTask command");
                let _ = reply.send(store.resume_task(&id, extra_iterations).map_err(StateError::from));
            }
            StateCommand::StatusCounts { reply } => {
                let _ = reply.send(store.status_counts().map_err(StateError::from));
            }
            StateCommand::IsPlanComplete { reply } => {
                let _ = reply.send(store.is_plan_complete().map_err(StateError::from));
            }

            // Artifacts and side effects
            StateCommand::RegisterArtifact {
                artifact,
                content,
                reply,
            } => {
                debug!(task_id = %artifact.task_id, "actor_loop: RegisterArtifact command");
                let result = store.register_artifact(artifact, content.as_deref());
                let _ = reply.send(result.map_err(StateError::from));
            }
            StateCommand::ListArtifacts { task_id, reply } => {
                let _ = reply.send(store.list_artifacts(task_id.as_deref()).map_err(StateError::from));
            }
            StateCommand::ReadArtifactContent { artifact, reply } => {
                let _ = reply.send(store.read_artifact_content(&artifact).map_err(StateError::from));
            }
            StateCommand::RecordSideEffect {
                task_id,
                effect_type,
                idempotency_key,
                details,
                iteration,
                reply,
            } => {
                debug!(%task_id, %idempotency_key, "actor_loop: RecordSideEffect command");
                let result = store.record_side_effect(&task_id, &effect_type, &idempotency_key, details, iteration);
                let _ = reply.send(result.map_err(StateError::from));
            }
            StateCommand::ListSideEffects { task_id, reply } => {
                let _ = reply.send(store.list_side_effects(task_id.as_deref()).map_err(StateError::from));
            }

            // Iterations and history
            StateCommand::StartIteration { task_id, reply } => {
                debug!(%task_id, "actor_loop: StartIteration command");
                let _ = reply.send(store.start_iteration(&task_id).map_err(StateError::from));
            }
            StateCommand::IterationCount { task_id, reply } => {
                let _ = reply.send(store.iteration_count(&task_id).map_err(StateError::from));
            }
            StateCommand::TotalIterations { reply } => {
                let _ = reply.send(store.total_iterations().map_err(StateError::from));
            }
            StateCommand::ListIterations { task_id, reply } => {
                let _ = reply.send(store.list_iterations(task_id.as_deref()).map_err(StateError::from));
            }
            StateCommand::ListFailedApproaches { task_id, limit, reply } => {
                let result = store.list_failed_approaches(task_id.as_deref(), limit);
                let _ = reply.send(result.map_err(StateError::from));
            }
            StateCommand::RecentLearnings { limit, reply } => {
                let _ = reply.send(store.recent_learnings(limit).map_err(StateError::from));
            }
            StateCommand::GenerateContext { task, limits, reply } => {
                let _ = reply.send(store.generate_task_context(&task, &limits).map_err(StateError::from));
            }

            // Checkpoints
            StateCommand::CommitIteration { commit, reply } => {
                debug!(task_id = %commit.task_id, "actor_loop: CommitIteration command");
                let _ = reply.send(store.commit_iteration(&commit).map_err(StateError::from));
            }
            StateCommand::Checkpoint {
                message,
                iteration,
                metadata,
                reply,
            } => {
                debug!(%message, "actor_loop: Checkpoint command");
                let _ = reply.send(store.checkpoint(&message, iteration, metadata).map_err(StateError::from));
            }
            StateCommand::RollbackTo { reference, reply } => {
                debug!(%reference, "actor_loop: RollbackTo command");
                let _ = reply.send(store.rollback_to(&reference).map_err(StateError::from));
            }
            StateCommand::ListCheckpoints { reply } => {
                let _ = reply.send(store.list_checkpoints().map_err(StateError::from));
            }

            // Recovery
            StateCommand::RecoverInterrupted { reply } => {
                debug!("actor_loop: RecoverInterrupted command");
                let _ = reply.send(store.recover_interrupted().map_err(StateError::from));
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_state_manager_task_flow() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();

        state.begin_plan("ship it").await.unwrap();
        state
            .create_tasks(vec![Task::new("a", "A"), Task::new("b", "B").depends_on("a")])
            .await
            .unwrap();

        let next = state.get_next_task().await.unwrap().unwrap();
        assert_eq!(next.id, "a");

        let n = state.start_iteration("a").await.unwrap();
        state
            .update_task_status("a", TaskStatus::InProgress, Some(n))
            .await
            .unwrap();
        assert!(state.get_next_task().await.unwrap().is_none());

        let counts = state.status_counts().await.unwrap();
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.pending, 1);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_manager_side_effect_idempotent() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        state.create_tasks(vec![Task::new("a", "A")]).await.unwrap();

        assert!(state.record_side_effect("a", "charge", "order-7", json!({}), 1).await.unwrap());
        assert!(!state.record_side_effect("a", "charge", "order-7", json!({}), 2).await.unwrap());
        assert_eq!(state.list_side_effects(Some("a")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_errors_surface_typed() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        let err = state
            .create_tasks(vec![Task::new("a", "A").depends_on("a")])
            .await
            .unwrap_err();
        assert!(matches!(
            err.store_error(),
            Some(taskstore::StoreError::CyclicDependency(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        state.shutdown().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(state.get_next_task().await, Err(StateError::ChannelError)));
    }
}
