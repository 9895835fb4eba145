//! durex - durable task-execution engine
//!
//! CLI entry point for running plans, inspecting run state and driving the
//! worker pool.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::json;
use taskstore::{LeaseStore, TaskStatus};
use tracing::info;

use durex::cli::{Cli, Command, OutputFormat, get_log_path};
use durex::config::Config;
use durex::decomposer::PlanFileDecomposer;
use durex::evaluator::CompositeEvaluator;
use durex::executor::CommandExecutor;
use durex::orchestrator::{Orchestrator, RunStatus, resume_task, state_dir};
use durex::pool::{OrchestratorDriver, RunSpec, WorkerPool};
use durex::state::StateManager;

/// Level priority: CLI flag, then config file, then INFO
fn setup_logging(level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    let level: tracing::Level = match level {
        Some(level) => level.parse().map_err(|_| eyre::eyre!("Invalid log level: {}", level))?,
        None => tracing::Level::INFO,
    };
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let level = cli.log_level.clone().or_else(|| config.log_level.clone());
    setup_logging(level.as_deref()).context("Failed to setup logging")?;

    match cli.command {
        Command::Run {
            plan,
            workspace,
            request,
            command,
        } => cmd_run(config, &plan, &workspace, &request, command).await,
        Command::Status { workspace, format } => cmd_status(&workspace, format).await,
        Command::Checkpoints { workspace } => cmd_checkpoints(&workspace).await,
        Command::Rollback { workspace, reference } => cmd_rollback(&workspace, &reference).await,
        Command::Resume {
            workspace,
            task_id,
            iterations,
        } => cmd_resume(&workspace, &task_id, iterations).await,
        Command::Enqueue { plan, run_id, request } => cmd_enqueue(&config, &plan, run_id, &request).await,
        Command::Runs { format } => cmd_runs(&config, format).await,
        Command::Pool => cmd_pool(config).await,
    }
}

fn open_state(workspace: &Path) -> Result<StateManager> {
    let dir = state_dir(workspace);
    if !dir.exists() {
        eyre::bail!("No run state in {}", workspace.display());
    }
    StateManager::spawn(&dir).context("Failed to open run state")
}

fn colored_status(status: TaskStatus) -> String {
    let text = status.as_str();
    match status {
        TaskStatus::Complete => text.green().to_string(),
        TaskStatus::Failed => text.red().to_string(),
        TaskStatus::Pending => text.to_string(),
        _ => text.yellow().to_string(),
    }
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Run a plan in a workspace
async fn cmd_run(mut config: Config, plan: &Path, workspace: &Path, request: &str, command: Option<String>) -> Result<()> {
    if let Some(command) = command {
        config.executor.command = command;
    }
    fs::create_dir_all(workspace).context("Failed to create workspace")?;
    let plan = fs::canonicalize(plan).context(format!("Plan file not found: {}", plan.display()))?;

    let state = StateManager::spawn(state_dir(workspace)).context("Failed to open run state")?;
    let executor = Arc::new(CommandExecutor::new(config.executor.clone()));
    let decomposer = Arc::new(PlanFileDecomposer::new(plan));
    let evaluator = CompositeEvaluator::new(config.evaluation.clone(), None);

    let mut orchestrator = Orchestrator::new(state.clone(), executor, decomposer, workspace)
        .with_config(config.orchestrator.clone())
        .with_context_limits(config.context.clone())
        .with_evaluator(evaluator);

    let report = orchestrator.run(request).await;
    state.shutdown().await?;
    let report = report?;

    let status = match &report.status {
        RunStatus::Complete => report.status.to_string().green(),
        RunStatus::Failed { .. } => report.status.to_string().red(),
        _ => report.status.to_string().yellow(),
    };
    println!("Run {}", status);
    println!(
        "Iterations: {}  Re-plans: {}  Tasks: {} complete, {} failed, {} open",
        report.iterations,
        report.replans,
        report.counts.complete,
        report.counts.failed,
        report.counts.open()
    );
    if !report.diagnostics.is_empty() {
        println!();
        println!("Diagnostics:");
        for line in &report.diagnostics {
            println!("  - {}", line);
        }
    }

    if let RunStatus::Failed { reason } = report.status {
        eyre::bail!("Run failed: {}", reason);
    }
    Ok(())
}

/// Show task graph status
async fn cmd_status(workspace: &Path, format: OutputFormat) -> Result<()> {
    let state = open_state(workspace)?;
    let plan = state.current_plan().await?;
    let counts = state.status_counts().await?;
    let tasks = state.list_tasks(None).await?;
    let iterations = state.total_iterations().await?;
    state.shutdown().await?;

    match format {
        OutputFormat::Json => {
            let json = json!({
                "plan": plan,
                "counts": counts,
                "iterations": iterations,
                "tasks": tasks
                    .iter()
                    .map(|t| json!({ "id": t.id, "title": t.title, "status": t.status, "parent": t.parent_task_id }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            match &plan {
                Some(plan) => println!("Plan generation {} ({})", plan.generation, plan.status.as_str()),
                None => println!("No plan"),
            }
            println!(
                "Tasks: {} total, {} complete, {} failed, {} open; {} iterations",
                counts.total(),
                counts.complete,
                counts.failed,
                counts.open(),
                iterations
            );
            println!();
            for task in &tasks {
                let indent = if task.parent_task_id.is_some() { "    " } else { "  " };
                println!("{}{:<24} {:<14} {}", indent, task.id, colored_status(task.status), task.title);
            }
        }
    }
    Ok(())
}

/// List checkpoints, oldest first
async fn cmd_checkpoints(workspace: &Path) -> Result<()> {
    let state = open_state(workspace)?;
    let checkpoints = state.list_checkpoints().await?;
    state.shutdown().await?;

    if checkpoints.is_empty() {
        println!("No checkpoints");
        return Ok(());
    }
    for checkpoint in &checkpoints {
        println!(
            "{}  {}  #{:<4} {}",
            checkpoint.short_ref().yellow(),
            format_time(checkpoint.created_at),
            checkpoint.iteration,
            checkpoint.message
        );
    }
    Ok(())
}

/// Restore state to a checkpoint
async fn cmd_rollback(workspace: &Path, reference: &str) -> Result<()> {
    let state = open_state(workspace)?;
    let checkpoint = state
        .rollback_to(reference)
        .await
        .context(format!("Failed to roll back to {}", reference))?;
    state.shutdown().await?;
    println!(
        "Rolled back to {} (iteration {}): {}",
        checkpoint.short_ref(),
        checkpoint.iteration,
        checkpoint.message
    );
    Ok(())
}

/// Send a parked task back to pending
async fn cmd_resume(workspace: &Path, task_id: &str, iterations: Option<u32>) -> Result<()> {
    let state = open_state(workspace)?;
    let task = resume_task(&state, task_id, iterations).await;
    state.shutdown().await?;
    let task = task?;
    println!("Resumed {} (max iterations now {})", task.id, task.max_iterations);
    Ok(())
}

/// Add a run to the shared queue
async fn cmd_enqueue(config: &Config, plan: &Path, run_id: Option<String>, request: &str) -> Result<()> {
    let plan = fs::canonicalize(plan).context(format!("Plan file not found: {}", plan.display()))?;
    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    let spec = RunSpec {
        plan,
        request: request.to_string(),
    };

    let store = LeaseStore::open(&config.storage.runs_db).context("Failed to open run queue")?;
    let record = store
        .enqueue(&run_id, &serde_json::to_value(&spec)?)
        .context("Failed to enqueue run")?;
    println!("Enqueued run {}", record.run_id);
    Ok(())
}

/// List queued and finished runs
async fn cmd_runs(config: &Config, format: OutputFormat) -> Result<()> {
    let store = LeaseStore::open(&config.storage.runs_db).context("Failed to open run queue")?;
    let runs = store.list_runs(None)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&runs)?),
        OutputFormat::Text => {
            if runs.is_empty() {
                println!("No runs");
            }
            for run in &runs {
                let owner = run.lease_owner.as_deref().unwrap_or("-");
                println!(
                    "{:<38} {:<11} attempts={} owner={} {}",
                    run.run_id,
                    run.status.as_str(),
                    run.attempts,
                    owner,
                    run.error.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

/// Run the worker pool until Ctrl-C
async fn cmd_pool(config: Config) -> Result<()> {
    let store = LeaseStore::open(&config.storage.runs_db).context("Failed to open run queue")?;
    let workspace_root: PathBuf = config.storage.workspace_root.clone();
    fs::create_dir_all(&workspace_root).context("Failed to create workspace root")?;

    let driver = Arc::new(OrchestratorDriver::new(workspace_root).with_config(&config));
    let mut pool = WorkerPool::new(config.pool.clone(), store, driver)?;

    println!(
        "Worker pool running ({}..{} workers). Press Ctrl-C to drain and stop.",
        config.pool.min_workers, config.pool.max_workers
    );
    pool.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        }
    })
    .await?;
    println!("Worker pool stopped");
    Ok(())
}
