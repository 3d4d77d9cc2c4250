//! Operator CLI: `run`, `status`, `pause`, `resume`, `cancel`, `rollback`,
//! `metrics`, equivalent to the command surface described for operating the
//! engine directly. Exit codes: 0 success, 1 workflow failure, 2 usage or
//! orchestration error.

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sdlc_orchestrator::{
    pool::build_default_pools, transport::LocalPoolTransport, Executor, ExecutorConfig,
    ExecutionState, ScalingThresholds, WorkflowPlan,
};
use tracing::error;

#[derive(Parser)]
#[command(name = "orchestratorctl", about = "operator surface for the SDLC orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a workflow plan (JSON) and wait for it to finish.
    Run { plan_path: String },
    /// Print the status of a previously submitted execution.
    Status { execution_id: String },
    Pause { execution_id: String },
    Resume { execution_id: String },
    Cancel { execution_id: String },
    Rollback {
        execution_id: String,
        #[arg(long)]
        checkpoint: Option<String>,
    },
    /// Print aggregate executor metrics.
    Metrics,
}

#[tokio::main]
async fn main() -> ExitCode {
    sdlc_orchestrator::config::init_tracing(false);
    let cli = Cli::parse();

    let thresholds = ScalingThresholds::default();
    let pools = build_default_pools(thresholds);
    let transport = Arc::new(LocalPoolTransport::new(pools.clone()));
    let executor = Executor::new(pools, transport, ExecutorConfig::default());

    match cli.command {
        Command::Run { plan_path } => run(&executor, &plan_path).await,
        Command::Status { execution_id } => status(&executor, &execution_id).await,
        Command::Pause { execution_id } => simple(executor.pause(&execution_id).await),
        Command::Resume { execution_id } => simple(executor.resume(&execution_id).await),
        Command::Cancel { execution_id } => simple(executor.cancel(&execution_id).await),
        Command::Rollback { execution_id, checkpoint } => {
            simple(executor.rollback(&execution_id, checkpoint.as_deref()).await)
        }
        Command::Metrics => {
            println!("{}", serde_json::to_string_pretty(&executor.metrics()).unwrap());
            ExitCode::from(0)
        }
    }
}

async fn run(executor: &Arc<Executor>, plan_path: &str) -> ExitCode {
    let contents = match fs::read_to_string(plan_path) {
        Ok(contents) => contents,
        Err(err) => {
            error!(plan_path, %err, "failed to read plan file");
            return ExitCode::from(1);
        }
    };
    let plan: WorkflowPlan = match serde_json::from_str(&contents) {
        Ok(plan) => plan,
        Err(err) => {
            error!(%err, "failed to parse plan");
            return ExitCode::from(1);
        }
    };

    let execution_id = match executor.execute(plan).await {
        Ok(id) => id,
        Err(err) => {
            error!(%err, "failed to submit plan");
            return exit_code_for(&err);
        }
    };

    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        match executor.status(&execution_id).await {
            Some(exec) if exec.state == ExecutionState::Completed => {
                println!("{execution_id} completed");
                return ExitCode::from(0);
            }
            Some(exec) if matches!(exec.state, ExecutionState::Failed | ExecutionState::Cancelled) => {
                println!("{execution_id} did not complete: {:?}", exec.error_message);
                return ExitCode::from(1);
            }
            Some(_) => continue,
            None => {
                error!(execution_id, "execution vanished while waiting");
                return ExitCode::from(2);
            }
        }
    }
}

async fn status(executor: &Arc<Executor>, execution_id: &str) -> ExitCode {
    match executor.status(execution_id).await {
        Some(exec) => {
            println!("{}", serde_json::to_string_pretty(&exec).unwrap());
            ExitCode::from(0)
        }
        None => {
            eprintln!("no such execution: {execution_id}");
            ExitCode::from(1)
        }
    }
}

fn simple(result: Result<(), sdlc_orchestrator::OrchestrationError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("{err}");
            exit_code_for(&err)
        }
    }
}

/// Maps the error taxonomy onto the documented exit codes: a bad id or an
/// invalid operation on a known execution is a user error (1); anything
/// that reflects the runtime's own state (distribution, execution,
/// timeout) is a system error (2).
fn exit_code_for(err: &sdlc_orchestrator::OrchestrationError) -> ExitCode {
    use sdlc_orchestrator::OrchestrationError::*;
    match err {
        Validation(_) | Capacity(_) | Dependency(_) | State(_) => ExitCode::from(1),
        Distribution(_) | Execution(_) | Timeout(_) => ExitCode::from(2),
    }
}
