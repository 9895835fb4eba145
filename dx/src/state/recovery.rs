//! Crash recovery
//!
//! Detects work interrupted by a crash mid-iteration and returns it to a
//! state the orchestrator can resume from.

use taskstore::{RecoveryStats, TaskStatus};
use tracing::{debug, info};

use super::StateManager;

/// What a recovery pass would touch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryScan {
    /// Tasks left in in_progress
    pub in_progress_tasks: Vec<String>,
    /// Iterations started but never completed
    pub open_iterations: Vec<u32>,
}

impl RecoveryScan {
    pub fn is_clean(&self) -> bool {
        self.in_progress_tasks.is_empty() && self.open_iterations.is_empty()
    }
}

/// Check for interrupted work without changing anything
pub async fn scan_for_recovery(state: &StateManager) -> eyre::Result<RecoveryScan> {
    debug!("scan_for_recovery: called");
    let tasks = state
        .list_tasks(Some(TaskStatus::InProgress))
        .await
        .map_err(|e| eyre::eyre!("Failed to list in-progress tasks: {}", e))?;
    let iterations = state
        .list_iterations(None)
        .await
        .map_err(|e| eyre::eyre!("Failed to list iterations: {}", e))?;

    let scan = RecoveryScan {
        in_progress_tasks: tasks.into_iter().map(|t| t.id).collect(),
        open_iterations: iterations
            .into_iter()
            .filter(|it| !it.is_complete())
            .map(|it| it.iteration)
            .collect(),
    };

    if scan.is_clean() {
        debug!("Recovery scan found no interrupted work");
    } else {
        info!(tasks = ?scan.in_progress_tasks, iterations = ?scan.open_iterations, "Recovery scan found interrupted work");
    }
    Ok(scan)
}

/// Reset interrupted tasks to pending and close open iterations as incomplete
pub async fn recover(state: &StateManager) -> eyre::Result<RecoveryStats> {
    debug!("recover: called");
    let scan = scan_for_recovery(state).await?;
    if scan.is_clean() {
        return Ok(RecoveryStats::default());
    }
    let stats = state
        .recover_interrupted()
        .await
        .map_err(|e| eyre::eyre!("Failed to recover interrupted work: {}", e))?;
    info!("Recovered interrupted work: {}", stats);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskstore::Task;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_recover_resets_interrupted_iteration() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        state.create_tasks(vec![Task::new("a", "A")]).await.unwrap();
        let n = state.start_iteration("a").await.unwrap();
        state
            .update_task_status("a", TaskStatus::InProgress, Some(n))
            .await
            .unwrap();

        let scan = scan_for_recovery(&state).await.unwrap();
        assert_eq!(scan.in_progress_tasks, vec!["a".to_string()]);
        assert_eq!(scan.open_iterations, vec![n]);

        let stats = recover(&state).await.unwrap();
        assert_eq!(stats.tasks_reset, 1);
        assert!(scan_for_recovery(&state).await.unwrap().is_clean());
        assert_eq!(
            state.get_task("a").await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_recover_on_clean_store_is_noop() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        let stats = recover(&state).await.unwrap();
        assert_eq!(stats, RecoveryStats::default());
    }
}
