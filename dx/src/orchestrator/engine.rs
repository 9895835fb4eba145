//! Orchestrator - drives one run's task graph
//!
//! Pulls ready tasks one at a time, iterates each until it passes its
//! completion gate or runs out of attempts, and handles the run-level cases:
//! circuit breaker and re-plan, task exhaustion, deadlock and hard ceilings.

use eyre::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskstore::{
    ArtifactType, ContextLimits, IterationCommit, IterationCompletion, IterationOutcome, NewArtifact, PlanStatus,
    StatusCounts, Task, TaskStatus, validate_dependency_graph,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::OrchestratorConfig;
use crate::decomposer::{Decomposer, PlanContext};
use crate::evaluator::{CompositeEvaluator, EvaluationConfig, EvaluationInput};
use crate::executor::{ExecutionOutput, ExecutionResult, TaskExecutor};
use crate::state::{StateManager, recover};

/// Status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Failed { reason: String },
    Blocked { reason: String },
    Paused { reason: String },
    WaitingForHuman { reason: String },
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed { .. } => "failed",
            Self::Blocked { .. } => "blocked",
            Self::Paused { .. } => "paused",
            Self::WaitingForHuman { .. } => "waiting_for_human",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason }
            | Self::Blocked { reason }
            | Self::Paused { reason }
            | Self::WaitingForHuman { reason } => Some(reason),
            Self::Running | Self::Complete => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.as_str(), reason),
            None => write!(f, "{}", self.as_str()),
        }
    }
}

/// Final summary of `Orchestrator::run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    /// Iterations across the life of the run
    pub iterations: u32,
    pub replans: u32,
    pub counts: StatusCounts,
    /// Missing checks, judge reasoning and failed approaches, oldest first
    pub diagnostics: Vec<String>,
}

/// Wakes an orchestrator waiting on blocked tasks
#[derive(Debug, Clone, Default)]
pub struct ResumeHandle {
    notify: Arc<Notify>,
}

impl ResumeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the orchestrator to re-check the task graph
    ///
    /// A signal sent before the orchestrator starts waiting is not lost.
    pub fn resume(&self) {
        debug!("ResumeHandle::resume: called");
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Liveness logger for one executor call; aborted on drop
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(task_id: String, iteration: u32, interval: Duration) -> Self {
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(%task_id, iteration, elapsed_secs = started.elapsed().as_secs(), "Iteration still running");
            }
        });
        Self(handle)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// How an executor call ended
enum Attempt {
    Finished(ExecutionResult),
    Errored(String),
    TimedOut,
}

/// What the run loop does after working a task
enum TaskStep {
    Next,
    Halt(RunStatus),
}

/// Classify an iteration from the executor outcome and the evaluation
pub fn classify_outcome(timed_out: bool, executor_ok: bool, passed: bool, score: f64) -> IterationOutcome {
    if timed_out {
        IterationOutcome::Incomplete
    } else if !executor_ok {
        IterationOutcome::Failed
    } else if passed {
        IterationOutcome::Success
    } else if score > 0.0 {
        IterationOutcome::Partial
    } else {
        IterationOutcome::Failed
    }
}

fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    line.chars().take(max_chars).collect()
}

/// Single-workspace run loop
pub struct Orchestrator {
    config: OrchestratorConfig,
    context_limits: ContextLimits,
    state: StateManager,
    executor: Arc<dyn TaskExecutor>,
    decomposer: Arc<dyn Decomposer>,
    evaluator: CompositeEvaluator,
    workspace: PathBuf,
    resume: ResumeHandle,
    status: RunStatus,
    consecutive_failures: u32,
    replans: u32,
    diagnostics: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        state: StateManager,
        executor: Arc<dyn TaskExecutor>,
        decomposer: Arc<dyn Decomposer>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        let workspace = workspace.into();
        debug!(workspace = %workspace.display(), "Orchestrator::new: called");
        Self {
            config: OrchestratorConfig::default(),
            context_limits: ContextLimits::default(),
            state,
            executor,
            decomposer,
            evaluator: CompositeEvaluator::new(EvaluationConfig::default(), None),
            workspace,
            resume: ResumeHandle::new(),
            status: RunStatus::Running,
            consecutive_failures: 0,
            replans: 0,
            diagnostics: Vec::new(),
        }
    }

    /// Builder: set run-loop configuration
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Builder: set context size limits
    pub fn with_context_limits(mut self, limits: ContextLimits) -> Self {
        self.context_limits = limits;
        self
    }

    /// Builder: set the evaluator
    pub fn with_evaluator(mut self, evaluator: CompositeEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Handle that wakes this orchestrator when it waits on blockers
    pub fn resume_handle(&self) -> ResumeHandle {
        self.resume.clone()
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Drive the run until it completes, fails, pauses or needs an operator
    pub async fn run(&mut self, request: &str) -> eyre::Result<RunReport> {
        info!(workspace = %self.workspace.display(), "Starting run");
        self.status = RunStatus::Running;
        self.consecutive_failures = 0;

        recover(&self.state).await?;
        let generation = self.ensure_plan(request).await?;
        self.replans = generation.saturating_sub(1);

        let status = loop {
            self.settle_decomposed_parents().await?;

            if self.state.is_plan_complete().await.context("Failed to check plan completion")? {
                break self.finished_status().await?;
            }
            if let Some(status) = self.check_total_ceiling().await? {
                break status;
            }

            match self.state.get_next_task().await.context("Failed to select next task")? {
                Some(task) => match self.work_task(task, request).await? {
                    TaskStep::Next => continue,
                    TaskStep::Halt(status) => break status,
                },
                None => match self.handle_deadlock().await? {
                    Some(status) => break status,
                    None => continue,
                },
            }
        };

        info!(%status, replans = self.replans, "Run finished");
        self.status = status;
        self.report().await
    }

    async fn report(&self) -> eyre::Result<RunReport> {
        Ok(RunReport {
            status: self.status.clone(),
            iterations: self.state.total_iterations().await?,
            replans: self.replans,
            counts: self.state.status_counts().await?,
            diagnostics: self.diagnostics.clone(),
        })
    }

    /// Plan has no open tasks: complete unless the active generation failed a task
    async fn finished_status(&self) -> eyre::Result<RunStatus> {
        let generation = self.state.current_plan().await?.map(|p| p.generation).unwrap_or(0);
        let failed: Vec<String> = self
            .state
            .list_tasks(Some(TaskStatus::Failed))
            .await?
            .into_iter()
            .filter(|t| t.plan_generation == generation)
            .map(|t| t.id)
            .collect();
        if failed.is_empty() {
            Ok(RunStatus::Complete)
        } else {
            Ok(RunStatus::Failed {
                reason: format!("plan finished with failed tasks: {}", failed.join(", ")),
            })
        }
    }

    // === Planning ===

    /// Make sure the active plan generation has tasks; returns the generation
    async fn ensure_plan(&self, request: &str) -> eyre::Result<u32> {
        debug!("ensure_plan: called");
        let current = self.state.current_plan().await.context("Failed to read plan metadata")?;
        let generation = match current {
            Some(plan) if plan.status == PlanStatus::Active => {
                let tasks = self.state.list_tasks(None).await?;
                if tasks.iter().any(|t| t.plan_generation == plan.generation) {
                    info!(generation = plan.generation, "Resuming existing plan");
                    return Ok(plan.generation);
                }
                plan.generation
            }
            _ => self.state.begin_plan(request).await.context("Failed to start plan")?,
        };
        self.install_plan(request, generation).await?;
        Ok(generation)
    }

    async fn plan_context(&self, generation: u32, parent_task: Option<Task>) -> eyre::Result<PlanContext> {
        let learnings = self
            .state
            .recent_learnings(self.context_limits.max_learnings)
            .await?
            .into_iter()
            .map(|l| l.text)
            .collect();
        let failed_approaches = self
            .state
            .list_failed_approaches(None, self.context_limits.max_failed_approaches)
            .await?;
        Ok(PlanContext {
            generation,
            learnings,
            failed_approaches,
            parent_task,
        })
    }

    async fn install_plan(&self, request: &str, generation: u32) -> eyre::Result<()> {
        let context = self.plan_context(generation, None).await?;
        let tasks = self
            .decomposer
            .decompose(request, &context)
            .await
            .context("Failed to decompose request")?;
        let count = tasks.len();
        self.accept_tasks(tasks).await?;
        info!(generation, tasks = count, "Installed plan");
        Ok(())
    }

    /// Validate a decomposer result against the store, then insert it
    async fn accept_tasks(&self, tasks: Vec<Task>) -> eyre::Result<()> {
        let existing: HashSet<String> = self.state.list_tasks(None).await?.into_iter().map(|t| t.id).collect();
        validate_dependency_graph(&tasks, |id| existing.contains(id)).context("Rejected decomposer output")?;
        self.state.create_tasks(tasks).await.context("Failed to insert tasks")?;
        Ok(())
    }

    /// Trip the circuit breaker: re-plan if allowed, otherwise fail the run
    async fn trip_breaker(&mut self, request: &str) -> eyre::Result<TaskStep> {
        let reason = format!("{} consecutive failed iterations", self.consecutive_failures);
        self.consecutive_failures = 0;
        warn!(%reason, replans = self.replans, "Circuit breaker tripped");

        if !self.config.enable_replanning {
            return Ok(TaskStep::Halt(RunStatus::Failed {
                reason: format!("{}; re-planning disabled", reason),
            }));
        }
        if self.replans >= self.config.max_replans {
            return Ok(TaskStep::Halt(RunStatus::Failed {
                reason: format!("{}; re-plan limit of {} reached", reason, self.config.max_replans),
            }));
        }

        self.state.mark_active_plan_failed(&reason).await.context("Failed to supersede plan")?;
        let generation = self.state.begin_plan(request).await.context("Failed to start plan")?;
        self.replans += 1;
        self.diagnostics.push(format!("re-planned as generation {}: {}", generation, reason));

        if let Err(e) = self.install_plan(request, generation).await {
            warn!(generation, error = %e, "Re-plan failed");
            return Ok(TaskStep::Halt(RunStatus::Failed {
                reason: format!("re-plan failed: {:#}", e),
            }));
        }
        Ok(TaskStep::Next)
    }

    // === Tasks ===

    fn exhaustion_status(&self, task: &Task) -> TaskStatus {
        if self.config.auto_decompose && task.parent_task_id.is_none() {
            TaskStatus::Blocked
        } else if self.config.escalate_to_review {
            TaskStatus::NeedsReview
        } else {
            TaskStatus::Failed
        }
    }

    /// Iterate one task until it passes, runs out of attempts, or the run halts
    async fn work_task(&mut self, mut task: Task, request: &str) -> eyre::Result<TaskStep> {
        info!(task_id = %task.id, title = %task.title, "Working task");
        loop {
            let used = self.state.iteration_count(&task.id).await?;
            if used >= task.max_iterations {
                self.exhaust_pending(&task).await?;
                return Ok(TaskStep::Next);
            }
            if let Some(status) = self.check_total_ceiling().await? {
                return Ok(TaskStep::Halt(status));
            }

            let last_allowed = used + 1 >= task.max_iterations;
            let outcome = self.run_iteration(&task, last_allowed).await?;

            if outcome != IterationOutcome::Success && last_allowed {
                self.after_exhaustion(&task).await?;
            }

            match outcome {
                IterationOutcome::Success => {
                    self.consecutive_failures = 0;
                    return Ok(TaskStep::Next);
                }
                IterationOutcome::Partial => self.consecutive_failures = 0,
                IterationOutcome::Failed | IterationOutcome::Incomplete => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.config.failure_threshold {
                        return self.trip_breaker(request).await;
                    }
                }
            }

            if last_allowed {
                return Ok(TaskStep::Next);
            }
            task = self.state.get_task_required(&task.id).await?;
        }
    }

    /// A pending task whose budget was already spent (e.g. after a crash)
    async fn exhaust_pending(&mut self, task: &Task) -> eyre::Result<()> {
        let status = match self.exhaustion_status(task) {
            TaskStatus::NeedsReview => TaskStatus::Blocked,
            other => other,
        };
        warn!(task_id = %task.id, %status, "Task has no iterations left");
        self.state.update_task_status(&task.id, status, None).await?;
        self.diagnostics
            .push(format!("{}: iteration budget of {} exhausted", task.id, task.max_iterations));
        if status == TaskStatus::Blocked && self.config.auto_decompose && task.parent_task_id.is_none() {
            self.decompose_task(task).await?;
        }
        Ok(())
    }

    async fn after_exhaustion(&mut self, task: &Task) -> eyre::Result<()> {
        let status = self.exhaustion_status(task);
        warn!(task_id = %task.id, %status, max_iterations = task.max_iterations, "Task exhausted its iterations");
        self.diagnostics
            .push(format!("{}: iteration budget of {} exhausted", task.id, task.max_iterations));
        if status == TaskStatus::Blocked {
            self.decompose_task(task).await?;
        }
        Ok(())
    }

    /// Break a blocked task into sub-tasks; fail it when that is not possible
    async fn decompose_task(&mut self, task: &Task) -> eyre::Result<()> {
        debug!(task_id = %task.id, "decompose_task: called");
        let generation = self.state.current_plan().await?.map(|p| p.generation).unwrap_or(1);
        let context = self.plan_context(generation, Some(task.clone())).await?;
        let request = task.description.clone();

        let result = match self.decomposer.decompose(&request, &context).await {
            Ok(subtasks) if subtasks.is_empty() => Err(eyre::eyre!("decomposer returned no sub-tasks")),
            Ok(subtasks) => {
                let subtasks: Vec<Task> = subtasks
                    .into_iter()
                    .map(|mut t| {
                        t.parent_task_id = Some(task.id.clone());
                        t
                    })
                    .collect();
                let count = subtasks.len();
                self.accept_tasks(subtasks).await.map(|_| count)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(count) => {
                info!(task_id = %task.id, subtasks = count, "Decomposed task into sub-tasks");
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Could not decompose task, failing it");
                self.diagnostics.push(format!("{}: decomposition failed: {:#}", task.id, e));
                self.state.update_task_status(&task.id, TaskStatus::Failed, None).await?;
            }
        }
        Ok(())
    }

    /// Complete or fail decomposed parents once their sub-tasks settle
    async fn settle_decomposed_parents(&mut self) -> eyre::Result<()> {
        for parent in self.state.list_tasks(Some(TaskStatus::Blocked)).await? {
            let subtasks = self.state.list_subtasks(&parent.id).await?;
            if subtasks.is_empty() {
                continue;
            }
            let status = if subtasks.iter().any(|t| t.status == TaskStatus::Failed) {
                TaskStatus::Failed
            } else if subtasks.iter().all(|t| t.status == TaskStatus::Complete) {
                TaskStatus::Complete
            } else {
                continue;
            };

            let iteration = self.state.total_iterations().await?;
            self.state.update_task_status(&parent.id, status, Some(iteration)).await?;
            if status == TaskStatus::Failed {
                self.diagnostics.push(format!("{}: a sub-task failed", parent.id));
            }
            self.state
                .checkpoint(
                    &format!("{} settled as {} from sub-tasks", parent.id, status),
                    iteration,
                    json!({ "task_id": parent.id, "status": status.as_str() }),
                )
                .await?;
            info!(task_id = %parent.id, %status, "Settled decomposed task");
        }
        Ok(())
    }

    // === Iterations ===

    async fn execute(&self, task: &Task, iteration: u32, context: &str) -> Attempt {
        let _heartbeat = Heartbeat::start(task.id.clone(), iteration, self.config.heartbeat_interval());
        let call = self.executor.execute(task, context, &self.workspace);
        match tokio::time::timeout(self.config.iteration_timeout(), call).await {
            Ok(Ok(result)) => Attempt::Finished(result),
            Ok(Err(e)) => Attempt::Errored(format!("{:#}", e)),
            Err(_) => {
                warn!(task_id = %task.id, iteration, timeout_ms = self.config.iteration_timeout_ms, "Executor timed out");
                self.executor.cancel().await;
                Attempt::TimedOut
            }
        }
    }

    /// Persist artifacts and side effects; returns ids of new artifacts
    async fn persist_outputs(&self, task: &Task, iteration: u32, result: &ExecutionResult) -> eyre::Result<Vec<String>> {
        let mut produced = Vec::new();
        for output in &result.outputs {
            match output {
                ExecutionOutput::Artifact {
                    file_path,
                    content,
                    metadata,
                } => {
                    let artifact = NewArtifact {
                        task_id: task.id.clone(),
                        artifact_type: if file_path.is_some() {
                            ArtifactType::File
                        } else {
                            ArtifactType::Metadata
                        },
                        file_path: file_path.clone(),
                        metadata: metadata.clone(),
                        iteration,
                    };
                    let artifact = self
                        .state
                        .register_artifact(artifact, content.clone())
                        .await
                        .context("Failed to register artifact")?;
                    produced.push(artifact.id);
                }
                ExecutionOutput::SideEffect {
                    effect_type,
                    idempotency_key,
                    details,
                } => {
                    let recorded = self
                        .state
                        .record_side_effect(&task.id, effect_type, idempotency_key, details.clone(), iteration)
                        .await
                        .context("Failed to record side effect")?;
                    if !recorded {
                        info!(task_id = %task.id, %idempotency_key, "Side effect already recorded, not repeating");
                    }
                }
                ExecutionOutput::Error { message } => {
                    warn!(task_id = %task.id, iteration, %message, "Executor reported an error");
                }
            }
        }
        Ok(produced)
    }

    async fn evaluation_input(&self, task: &Task, result: &ExecutionResult) -> eyre::Result<EvaluationInput> {
        let artifacts = self.state.list_artifacts(None).await?;
        let side_effects = self.state.list_side_effects(Some(&task.id)).await?;

        let primary = artifacts
            .iter()
            .rev()
            .find(|a| a.task_id == task.id && a.artifact_type == ArtifactType::File && a.blob_path.is_some());
        let primary_content = match primary {
            Some(artifact) => self
                .state
                .read_artifact_content(artifact)
                .await?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            None => None,
        };

        Ok(EvaluationInput {
            task: task.clone(),
            artifacts,
            side_effects,
            primary_content,
            output: result.output.clone(),
            executor_success: result.success && !result.has_error_output(),
        })
    }

    /// Run one iteration of `task` and commit it; returns the outcome
    async fn run_iteration(&mut self, task: &Task, last_allowed: bool) -> eyre::Result<IterationOutcome> {
        let iteration = self.state.start_iteration(&task.id).await.context("Failed to start iteration")?;
        let task = self
            .state
            .update_task_status(&task.id, TaskStatus::InProgress, Some(iteration))
            .await
            .context("Failed to mark task in progress")?;
        info!(task_id = %task.id, iteration, "Starting iteration");

        let context = self
            .state
            .generate_task_context(&task, &self.context_limits)
            .await
            .context("Failed to build task context")?
            .render();

        let attempt = self.execute(&task, iteration, &context).await;

        let mut completion = IterationCompletion::new(iteration, IterationOutcome::Failed);
        let (outcome, why, approach) = match &attempt {
            Attempt::TimedOut => (
                IterationOutcome::Incomplete,
                format!("executor timed out after {}ms", self.config.iteration_timeout_ms),
                "executor call".to_string(),
            ),
            Attempt::Errored(message) => (
                IterationOutcome::Failed,
                format!("executor error: {}", message),
                "executor call".to_string(),
            ),
            Attempt::Finished(result) => {
                completion.artifacts_produced = self.persist_outputs(&task, iteration, result).await?;
                completion.learnings = result.learnings.clone();
                completion.tools_used = result.tools_invoked.clone();
                completion.tokens_used = result.tokens_used;
                let approach = match first_line(&result.output, 200) {
                    line if line.is_empty() => format!("tools: {}", result.tools_invoked.join(", ")),
                    line => line,
                };

                let executor_ok = result.success && !result.has_error_output();
                if executor_ok {
                    let input = self.evaluation_input(&task, result).await?;
                    let evaluation = self.evaluator.evaluate(&input).await;
                    completion.completion_confidence = evaluation.score;
                    let outcome = classify_outcome(false, true, evaluation.passed, evaluation.score);
                    (outcome, evaluation.summary(), approach)
                } else {
                    let error = result.first_error().unwrap_or("executor reported failure");
                    (IterationOutcome::Failed, format!("executor failed: {}", error), approach)
                }
            }
        };
        completion.outcome = outcome;

        let status = match outcome {
            IterationOutcome::Success => TaskStatus::Complete,
            _ if last_allowed => self.exhaustion_status(&task),
            _ => TaskStatus::Pending,
        };
        let failed_approach = (outcome != IterationOutcome::Success).then(|| (approach, why.clone()));

        let checkpoint = self
            .state
            .commit_iteration(IterationCommit {
                task_id: task.id.clone(),
                completion: completion.clone(),
                status: Some(status),
                failed_approach,
                message: format!("{} iteration {}: {}", task.id, iteration, outcome),
                metadata: json!({
                    "task_id": task.id,
                    "outcome": outcome.as_str(),
                    "score": completion.completion_confidence,
                }),
            })
            .await
            .context("Failed to commit iteration")?;

        if outcome != IterationOutcome::Success {
            self.diagnostics
                .push(format!("{} iteration {} {}: {}", task.id, iteration, outcome, why));
        }
        info!(
            task_id = %task.id,
            iteration,
            %outcome,
            %status,
            checkpoint = %checkpoint.short_ref(),
            "Iteration finished"
        );
        Ok(outcome)
    }

    // === Run-level guards ===

    async fn check_total_ceiling(&self) -> eyre::Result<Option<RunStatus>> {
        let total = self.state.total_iterations().await?;
        if total >= self.config.max_total_iterations {
            warn!(total, max = self.config.max_total_iterations, "Run iteration ceiling reached");
            return Ok(Some(RunStatus::Paused {
                reason: format!("total iteration ceiling of {} reached", self.config.max_total_iterations),
            }));
        }
        Ok(None)
    }

    /// No task is ready but the plan is open
    ///
    /// Returns None when the run was resumed and should look again.
    async fn handle_deadlock(&mut self) -> eyre::Result<Option<RunStatus>> {
        let tasks = self.state.list_tasks(None).await?;
        let mut awaiting = Vec::new();
        for task in &tasks {
            match task.status {
                TaskStatus::NeedsReview => awaiting.push(task.id.clone()),
                TaskStatus::Blocked if self.state.list_subtasks(&task.id).await?.is_empty() => {
                    awaiting.push(task.id.clone())
                }
                _ => {}
            }
        }

        let by_id: std::collections::HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let stuck: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| {
                let waits: Vec<String> = t
                    .depends_on
                    .iter()
                    .filter_map(|d| by_id.get(d.as_str()))
                    .filter(|d| d.status != TaskStatus::Complete)
                    .map(|d| format!("{} ({})", d.id, d.status))
                    .collect();
                format!("{} waits on {}", t.id, waits.join(", "))
            })
            .collect();

        let reason = if awaiting.is_empty() {
            format!("no task can make progress; {}", stuck.join("; "))
        } else {
            format!("awaiting operator on {}", awaiting.join(", "))
        };
        self.status = RunStatus::Blocked { reason: reason.clone() };
        warn!(%reason, "Run blocked");

        if awaiting.is_empty() {
            self.diagnostics.extend(stuck);
            return Ok(Some(RunStatus::Failed {
                reason: format!("deadlock: {}", reason),
            }));
        }

        if !self.config.pause_on_blockers {
            self.diagnostics
                .extend(awaiting.iter().map(|id| format!("{} awaiting operator", id)));
            self.diagnostics.extend(stuck);
            return Ok(Some(RunStatus::Failed {
                reason: format!("deadlock: {}", reason),
            }));
        }

        self.status = RunStatus::WaitingForHuman { reason };
        info!("Waiting for resume signal");
        let mut poll = tokio::time::interval(self.config.resume_poll_interval());
        poll.tick().await;
        loop {
            tokio::select! {
                _ = self.resume.wait() => break,
                _ = poll.tick() => {
                    // Another process may have resumed a task through the shared store
                    if self.state.get_next_task().await?.is_some() {
                        debug!("Ready task found while paused");
                        break;
                    }
                }
            }
        }
        info!("Resumed");
        self.status = RunStatus::Running;
        Ok(None)
    }
}

/// Give a blocked or needs_review task a fresh iteration budget
pub async fn resume_task(state: &StateManager, task_id: &str, extra_iterations: Option<u32>) -> eyre::Result<Task> {
    debug!(%task_id, ?extra_iterations, "resume_task: called");
    let task = state.get_task_required(task_id).await?;
    let extra = extra_iterations.unwrap_or(task.max_iterations);
    let task = state
        .resume_task(task_id, extra)
        .await
        .context(format!("Failed to resume task {}", task_id))?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposer::mock::MockDecomposer;
    use crate::executor::mock::MockExecutor;
    use tempfile::tempdir;

    struct Harness {
        temp: tempfile::TempDir,
        state: StateManager,
        executor: Arc<MockExecutor>,
        decomposer: Arc<MockDecomposer>,
        orchestrator: Orchestrator,
    }

    fn harness(executor: MockExecutor, decomposer: MockDecomposer, config: OrchestratorConfig) -> Harness {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path().join("state")).unwrap();
        let executor = Arc::new(executor);
        let decomposer = Arc::new(decomposer);
        let orchestrator = Orchestrator::new(state.clone(), executor.clone(), decomposer.clone(), temp.path())
            .with_config(config);
        Harness {
            temp,
            state,
            executor,
            decomposer,
            orchestrator,
        }
    }

    fn chain() -> Vec<Task> {
        vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("b"),
        ]
    }

    fn no_replan() -> OrchestratorConfig {
        OrchestratorConfig {
            enable_replanning: false,
            failure_threshold: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_outcome() {
        assert_eq!(classify_outcome(true, true, true, 1.0), IterationOutcome::Incomplete);
        assert_eq!(classify_outcome(false, false, true, 1.0), IterationOutcome::Failed);
        assert_eq!(classify_outcome(false, true, true, 1.0), IterationOutcome::Success);
        assert_eq!(classify_outcome(false, true, false, 0.4), IterationOutcome::Partial);
        assert_eq!(classify_outcome(false, true, false, 0.0), IterationOutcome::Failed);
    }

    #[tokio::test]
    async fn test_chain_completes_with_checkpoint_per_iteration() {
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::ok("done")]),
            MockDecomposer::new(vec![chain()]),
            OrchestratorConfig::default(),
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.iterations, 3);
        assert_eq!(h.executor.seen(), vec!["a", "b", "c"]);
        assert_eq!(h.state.list_checkpoints().await.unwrap().len(), 3);
        assert!(h.state.is_plan_complete().await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_head_of_chain_fails_run() {
        let tasks = vec![
            Task::new("a", "A").with_max_iterations(3),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("b"),
        ];
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::failed("boom")]),
            MockDecomposer::new(vec![tasks]),
            no_replan(),
        );
        let report = h.orchestrator.run("build").await.unwrap();

        assert!(matches!(&report.status, RunStatus::Failed { reason } if reason.contains("deadlock")));
        assert_eq!(h.executor.call_count(), 3);
        assert_eq!(h.state.get_task_required("a").await.unwrap().status, TaskStatus::Failed);
        assert_eq!(h.state.get_task_required("b").await.unwrap().status, TaskStatus::Pending);
        assert!(!h.state.is_plan_complete().await.unwrap());
        assert!(report.diagnostics.iter().any(|d| d.contains("b waits on a (failed)")));

        let approaches = h.state.list_failed_approaches(Some("a"), 10).await.unwrap();
        assert_eq!(approaches.len(), 3);
        assert!(approaches[0].why_failed.contains("boom"));
    }

    #[tokio::test]
    async fn test_circuit_breaker_replans_with_history() {
        let config = OrchestratorConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let mut h = harness(
            MockExecutor::new(vec![
                ExecutionResult::failed("bad idea").with_learning("try the other way"),
                ExecutionResult::failed("still bad"),
                ExecutionResult::ok("fine"),
            ]),
            MockDecomposer::new(vec![vec![Task::new("a", "A")], vec![Task::new("g2-a", "A again")]]),
            config,
        );
        let report = h.orchestrator.run("build").await.unwrap();

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.replans, 1);
        assert_eq!(h.state.get_task_required("a").await.unwrap().status, TaskStatus::Failed);
        assert_eq!(h.state.get_task_required("g2-a").await.unwrap().status, TaskStatus::Complete);

        let contexts = h.decomposer.contexts();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[1].generation, 2);
        assert_eq!(contexts[1].learnings, vec!["try the other way".to_string()]);
        assert_eq!(contexts[1].failed_approaches.len(), 2);
    }

    #[tokio::test]
    async fn test_breaker_without_replanning_fails_run() {
        let config = OrchestratorConfig {
            failure_threshold: 2,
            enable_replanning: false,
            ..Default::default()
        };
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::failed("nope")]),
            MockDecomposer::new(vec![vec![Task::new("a", "A")]]),
            config,
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert!(matches!(&report.status, RunStatus::Failed { reason } if reason.contains("re-planning disabled")));
        assert_eq!(h.executor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_replan_limit_fails_run() {
        let config = OrchestratorConfig {
            failure_threshold: 1,
            max_replans: 1,
            ..Default::default()
        };
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::failed("nope")]),
            MockDecomposer::new(vec![vec![Task::new("a", "A")], vec![Task::new("b", "B")]]),
            config,
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert!(matches!(&report.status, RunStatus::Failed { reason } if reason.contains("re-plan limit")));
        assert_eq!(report.replans, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_incomplete_and_cancels() {
        let config = OrchestratorConfig {
            iteration_timeout_ms: 20,
            heartbeat_interval_ms: 5,
            ..no_replan()
        };
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::ok("late")]).with_delay(Duration::from_millis(500)),
            MockDecomposer::new(vec![vec![Task::new("a", "A").with_max_iterations(1)]]),
            config,
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert!(matches!(report.status, RunStatus::Failed { .. }));
        assert_eq!(h.executor.cancel_count(), 1);
        let iterations = h.state.list_iterations(Some("a")).await.unwrap();
        assert_eq!(iterations[0].outcome, Some(IterationOutcome::Incomplete));
    }

    #[tokio::test]
    async fn test_side_effects_not_repeated_across_retries() {
        let effect = || ExecutionOutput::side_effect("email", "welcome-mail");
        let mut h = harness(
            MockExecutor::new(vec![
                ExecutionResult::ok("not yet").with_output(effect()),
                ExecutionResult::ok("done").with_output(effect()),
            ]),
            MockDecomposer::new(vec![vec![Task::new("a", "A").with_check("contains:done")]]),
            no_replan(),
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.iterations, 2);
        assert_eq!(h.state.list_side_effects(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_artifact_gate_reads_registered_content() {
        let task = Task::new("a", "A")
            .with_check("file_exists:out.md")
            .with_constraint("contains", "Summary");
        let mut h = harness(
            MockExecutor::new(vec![
                ExecutionResult::ok("").with_output(ExecutionOutput::artifact("draft.md", "Summary")),
                ExecutionResult::ok("Summary").with_output(ExecutionOutput::artifact("out.md", "# Summary")),
            ]),
            MockDecomposer::new(vec![vec![task]]),
            no_replan(),
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.iterations, 2);
        let iterations = h.state.list_iterations(Some("a")).await.unwrap();
        assert_eq!(iterations[0].outcome, Some(IterationOutcome::Partial));
        assert_eq!(iterations[1].artifacts_produced.len(), 1);
        assert!(iterations[1].checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_error_output_fails_iteration() {
        let mut h = harness(
            MockExecutor::new(vec![
                ExecutionResult::ok("partial").with_output(ExecutionOutput::error("disk full")),
                ExecutionResult::ok("done"),
            ]),
            MockDecomposer::new(vec![vec![Task::new("a", "A")]]),
            no_replan(),
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        let iterations = h.state.list_iterations(Some("a")).await.unwrap();
        assert_eq!(iterations[0].outcome, Some(IterationOutcome::Failed));
        assert!(report.diagnostics[0].contains("disk full"));
    }

    #[tokio::test]
    async fn test_auto_decompose_promotes_parent() {
        let config = OrchestratorConfig {
            auto_decompose: true,
            ..no_replan()
        };
        let tasks = vec![
            Task::new("w", "Write").with_max_iterations(1),
            Task::new("p", "Publish").depends_on("w"),
        ];
        let subtasks = vec![Task::new("w-1", "Outline"), Task::new("w-2", "Draft").depends_on("w-1")];
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::failed("too big"), ExecutionResult::ok("ok")]),
            MockDecomposer::new(vec![tasks]).with_subtasks("w", subtasks),
            config,
        );
        let report = h.orchestrator.run("build").await.unwrap();

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(h.executor.seen(), vec!["w", "w-1", "w-2", "p"]);
        let w = h.state.get_task_required("w").await.unwrap();
        assert_eq!(w.status, TaskStatus::Complete);
        let subs = h.state.list_subtasks("w").await.unwrap();
        assert_eq!(subs.len(), 2);
    }

    #[tokio::test]
    async fn test_auto_decompose_without_subtasks_fails_task() {
        let config = OrchestratorConfig {
            auto_decompose: true,
            ..no_replan()
        };
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::failed("too big")]),
            MockDecomposer::new(vec![vec![Task::new("w", "Write").with_max_iterations(1)]]),
            config,
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert!(matches!(report.status, RunStatus::Failed { .. }));
        assert_eq!(h.state.get_task_required("w").await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_escalation_without_pause_fails_then_resumes() {
        let config = OrchestratorConfig {
            escalate_to_review: true,
            ..no_replan()
        };
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::failed("stuck"), ExecutionResult::ok("ok")]),
            MockDecomposer::new(vec![vec![Task::new("a", "A").with_max_iterations(1)]]),
            config,
        );
        let report = h.orchestrator.run("build").await.unwrap();
        match &report.status {
            RunStatus::Failed { reason } => assert!(reason.contains("deadlock: awaiting operator on a")),
            other => panic!("expected failed run, got {}", other),
        }
        assert!(report.diagnostics.iter().any(|d| d == "a awaiting operator"));
        assert_eq!(h.state.get_task_required("a").await.unwrap().status, TaskStatus::NeedsReview);

        resume_task(&h.state, "a", Some(1)).await.unwrap();
        let report = h.orchestrator.run("build").await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(h.decomposer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_pause_on_blockers_waits_for_signal() {
        let config = OrchestratorConfig {
            escalate_to_review: true,
            pause_on_blockers: true,
            ..no_replan()
        };
        let h = harness(
            MockExecutor::new(vec![ExecutionResult::failed("stuck"), ExecutionResult::ok("ok")]),
            MockDecomposer::new(vec![vec![Task::new("a", "A").with_max_iterations(1)]]),
            config,
        );
        let state = h.state.clone();
        let resume = h.orchestrator.resume_handle();
        let mut orchestrator = h.orchestrator;
        let run = tokio::spawn(async move { orchestrator.run("build").await });

        for _ in 0..200 {
            if state.get_task_required("a").await.unwrap().status == TaskStatus::NeedsReview {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!run.is_finished());

        resume_task(&state, "a", Some(1)).await.unwrap();
        resume.resume();
        let report = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_paused_run_sees_resume_from_another_state_manager() {
        let config = OrchestratorConfig {
            escalate_to_review: true,
            pause_on_blockers: true,
            resume_poll_interval_ms: 20,
            ..no_replan()
        };
        let h = harness(
            MockExecutor::new(vec![ExecutionResult::failed("stuck"), ExecutionResult::ok("ok")]),
            MockDecomposer::new(vec![vec![Task::new("a", "A").with_max_iterations(1)]]),
            config,
        );
        let state = h.state.clone();
        let state_path = h.temp.path().join("state");
        let mut orchestrator = h.orchestrator;
        let run = tokio::spawn(async move { orchestrator.run("build").await });

        for _ in 0..200 {
            if state.get_task_required("a").await.unwrap().status == TaskStatus::NeedsReview {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!run.is_finished());

        // Operator resumes through a separate handle on the same store; no in-process signal
        let operator = StateManager::spawn(&state_path).unwrap();
        resume_task(&operator, "a", Some(1)).await.unwrap();
        operator.shutdown().await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(h.executor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_total_iteration_ceiling_pauses() {
        let config = OrchestratorConfig {
            max_total_iterations: 2,
            ..no_replan()
        };
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::ok("done")]),
            MockDecomposer::new(vec![chain()]),
            config,
        );
        let report = h.orchestrator.run("build").await.unwrap();
        assert!(matches!(report.status, RunStatus::Paused { .. }));
        assert_eq!(report.iterations, 2);
        assert_eq!(h.state.get_task_required("c").await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_cyclic_plan_is_rejected() {
        let tasks = vec![Task::new("x", "X").depends_on("y"), Task::new("y", "Y").depends_on("x")];
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::ok("")]),
            MockDecomposer::new(vec![tasks]),
            OrchestratorConfig::default(),
        );
        assert!(h.orchestrator.run("build").await.is_err());
        assert_eq!(h.executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rerun_resumes_existing_plan() {
        let mut h = harness(
            MockExecutor::new(vec![ExecutionResult::ok("done")]),
            MockDecomposer::new(vec![chain()]),
            OrchestratorConfig::default(),
        );
        h.orchestrator.run("build").await.unwrap();
        let report = h.orchestrator.run("build").await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(h.decomposer.call_count(), 1);
        assert_eq!(h.executor.call_count(), 3);
    }
}
