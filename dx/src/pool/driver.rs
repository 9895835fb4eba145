//! Run drivers - what a worker does with a claimed run

use async_trait::async_trait;
use eyre::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use taskstore::{ContextLimits, RunRecord};
use tracing::{debug, info, warn};

use crate::decomposer::PlanFileDecomposer;
use crate::evaluator::{CompositeEvaluator, EvaluationConfig, Judge};
use crate::executor::{CommandExecutor, CommandExecutorConfig};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, RunStatus, state_dir};
use crate::state::StateManager;

/// How a driven run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { reason: String },
}

impl RunOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed { reason: reason.into() }
    }
}

/// Payload stored as a run's `run_spec`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    /// YAML plan file the run decomposes from
    pub plan: PathBuf,
    #[serde(default)]
    pub request: String,
}

impl RunSpec {
    pub fn from_record(run: &RunRecord) -> eyre::Result<Self> {
        serde_json::from_value(run.run_spec.clone()).context(format!("Invalid run spec for run {}", run.run_id))
    }
}

/// Executes one claimed run to its end
#[async_trait]
pub trait RunDriver: Send + Sync {
    async fn drive(&self, run: &RunRecord) -> eyre::Result<RunOutcome>;
}

/// Drives a run with an Orchestrator in `workspace_root/<run_id>`
pub struct OrchestratorDriver {
    workspace_root: PathBuf,
    orchestrator: OrchestratorConfig,
    context: ContextLimits,
    evaluation: EvaluationConfig,
    executor: CommandExecutorConfig,
    judge: Option<Arc<dyn Judge>>,
}

impl OrchestratorDriver {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            orchestrator: OrchestratorConfig::default(),
            context: ContextLimits::default(),
            evaluation: EvaluationConfig::default(),
            executor: CommandExecutorConfig::default(),
            judge: None,
        }
    }

    /// Builder: take every run-level setting from the loaded config
    pub fn with_config(mut self, config: &crate::config::Config) -> Self {
        self.orchestrator = config.orchestrator.clone();
        self.context = config.context.clone();
        self.evaluation = config.evaluation.clone();
        self.executor = config.executor.clone();
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn workspace_for(&self, run_id: &str) -> PathBuf {
        self.workspace_root.join(run_id)
    }
}

#[async_trait]
impl RunDriver for OrchestratorDriver {
    async fn drive(&self, run: &RunRecord) -> eyre::Result<RunOutcome> {
        debug!(run_id = %run.run_id, "OrchestratorDriver::drive: called");
        let spec = RunSpec::from_record(run)?;
        let workspace = self.workspace_for(&run.run_id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .context(format!("Failed to create workspace {}", workspace.display()))?;

        let state = StateManager::spawn(state_dir(&workspace))?;
        let executor = Arc::new(CommandExecutor::new(self.executor.clone()));
        let decomposer = Arc::new(PlanFileDecomposer::new(spec.plan.clone()));
        let evaluator = CompositeEvaluator::new(self.evaluation.clone(), self.judge.clone());

        let mut orchestrator = Orchestrator::new(state.clone(), executor, decomposer, &workspace)
            .with_config(self.orchestrator.clone())
            .with_context_limits(self.context.clone())
            .with_evaluator(evaluator);

        let result = orchestrator.run(&spec.request).await;
        if let Err(e) = state.shutdown().await {
            warn!(run_id = %run.run_id, error = %e, "Failed to shut down run state");
        }
        let report = result?;

        info!(run_id = %run.run_id, status = %report.status, iterations = report.iterations, "Run driven");
        Ok(match report.status {
            RunStatus::Complete => RunOutcome::Completed,
            other => RunOutcome::failed(other.to_string()),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskstore::LeaseStore;
    use tempfile::tempdir;

    #[test]
    fn test_run_spec_from_record() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        let run = store
            .enqueue("r1", &json!({ "plan": "plan.yml", "request": "write it" }))
            .unwrap();
        let spec = RunSpec::from_record(&run).unwrap();
        assert_eq!(spec.plan, PathBuf::from("plan.yml"));
        assert_eq!(spec.request, "write it");

        let bad = store.enqueue("r2", &json!({ "request": "no plan" })).unwrap();
        assert!(RunSpec::from_record(&bad).is_err());
    }

    #[tokio::test]
    async fn test_orchestrator_driver_completes_plan() {
        let temp = tempdir().unwrap();
        let plan = temp.path().join("plan.yml");
        std::fs::write(&plan, "tasks:\n  - id: a\n    title: A\n  - id: b\n    title: B\n    depends_on: [a]\n").unwrap();

        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        let run = store.enqueue("r1", &json!({ "plan": plan, "request": "go" })).unwrap();

        let mut config = crate::config::Config::default();
        config.executor.command = "echo working".to_string();
        let driver = OrchestratorDriver::new(temp.path().join("runs")).with_config(&config);

        let outcome = driver.drive(&run).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(state_dir(&driver.workspace_for("r1")).exists());
    }

    #[tokio::test]
    async fn test_orchestrator_driver_reports_failure() {
        let temp = tempdir().unwrap();
        let plan = temp.path().join("plan.yml");
        std::fs::write(&plan, "tasks:\n  - id: a\n    title: A\n    max_iterations: 1\n").unwrap();

        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        let run = store.enqueue("r1", &json!({ "plan": plan })).unwrap();

        let mut config = crate::config::Config::default();
        config.executor.command = "exit 3".to_string();
        config.orchestrator.enable_replanning = false;
        let driver = OrchestratorDriver::new(temp.path().join("runs")).with_config(&config);

        let outcome = driver.drive(&run).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
    }
}
