//! Error taxonomy for the orchestration engine.
//!
//! Mirrors the shape of the original system's exception hierarchy: a small
//! set of orchestration-level error kinds plus a distinct set of agent-level
//! error kinds, both expressed as `thiserror` enums rather than a class
//! hierarchy.

use thiserror::Error;

/// Errors surfaced by the workflow executor, agent pool, and recovery logic.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("task distribution failed: {0}")]
    Distribution(String),

    #[error("workflow execution failed: {0}")]
    Execution(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("dependency resolution failed: {0}")]
    Dependency(String),

    #[error("invalid state transition: {0}")]
    State(String),
}

/// Errors surfaced by individual specialized agents.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent {agent_id} failed to initialize: {message}")]
    Initialization { agent_id: String, message: String },

    #[error("agent {agent_id} has invalid configuration: {message}")]
    Configuration { agent_id: String, message: String },

    #[error("agent {agent_id} failed executing task {task_id}: {message}")]
    Execution {
        agent_id: String,
        task_id: String,
        message: String,
    },

    #[error("agent {agent_id} timed out during {operation}")]
    Timeout { agent_id: String, operation: String },

    #[error("no agent available: {0}")]
    Unavailable(String),
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
