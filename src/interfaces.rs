//! Trait-object hooks to the system's external collaborators: natural
//! language plan generation, the actual agent process transport, and
//! artifact quality scoring. All three are out of scope for this crate
//! (see the non-goals) and are reached only through these traits, mirroring
//! the duck-typed `workflow_engine` / `cli_interface` collaborators the
//! original orchestrator took as constructor arguments.

use async_trait::async_trait;

use crate::error::OrchestrationError;
use crate::task::{AgentResult, AgentTask};
use crate::workflow::WorkflowPlan;

/// Turns a natural-language request into a [`WorkflowPlan`]. Not
/// implemented by this crate; callers supply their own.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate_plan(&self, request: &str) -> Result<WorkflowPlan, OrchestrationError>;
}

/// Delivers a task to the actual agent process and returns its result.
/// Stands in for the original's `cli_interface.send_task`.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send_task(&self, task: AgentTask) -> Result<AgentResult, OrchestrationError>;
}

/// Scores a produced artifact's quality. Not implemented by this crate.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score(&self, result: &AgentResult) -> Result<f64, OrchestrationError>;
}
