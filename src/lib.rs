//! Multi-agent SDLC orchestration engine.
//!
//! Coordinates pools of specialized agents (`PM`, `BA`, `SA`, `RESEARCH`,
//! `QUALITY_JUDGE`, `IMPLEMENTATION`, and custom roles) through a workflow
//! executor that runs sequential or parallel task graphs, recovers from
//! task failures with retry/reassign/skip/abort policies, and checkpoints
//! progress for rollback.
//!
//! Natural-language plan generation, artifact quality scoring, and durable
//! knowledge storage are deliberately out of scope: they are reached
//! through the traits in [`interfaces`] rather than implemented here.

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod interfaces;
pub mod persistence;
pub mod pool;
pub mod recovery;
pub mod task;
pub mod transport;
pub mod workflow;

pub use agent::{AgentConfig, AgentInstance, AgentState, PerformanceSnapshot, RoleHandler};
pub use config::OrchestrationConfig;
pub use error::{AgentError, OrchestrationError, OrchestrationResult};
pub use executor::{ExecutionMetrics, Executor, ExecutorConfig};
pub use interfaces::{AgentTransport, PlanGenerator, QualityScorer};
pub use persistence::{FilesystemStore, InMemoryStore, PersistedEnvelope, PersistenceStore};
pub use pool::{AgentPool, InstanceDetail, LoadBalancingStrategy, PoolStatus, ScalingThresholds};
pub use recovery::{backoff_delay, decide_recovery, RecoveryAction};
pub use task::{
    clamp_unit, AgentResult, AgentTask, AgentType, DataFormat, ModelAssignment, ResultMetadata,
    TaskInput, TaskOutput, TaskPriority, TaskStatus,
};
pub use transport::LocalPoolTransport;
pub use workflow::{
    AgentAssignment, Checkpoint, ExecutionPattern, ExecutionState, TaskExecution,
    TaskExecutionStatus, WorkflowExecution, WorkflowPlan,
};
