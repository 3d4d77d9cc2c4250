//! Value objects shared by every component: task requests, task results,
//! and the small enums that describe their shape and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The six specialized roles the original system ships, plus an escape
/// hatch for deployments that register additional role handlers.
///
/// Serializes as a plain string (`"PM"`, `"QUALITY_JUDGE"`, or the custom
/// name) to match the persisted-envelope shape, rather than as a tagged
/// object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentType {
    Pm,
    Ba,
    Sa,
    Research,
    QualityJudge,
    Implementation,
    Custom(String),
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::Pm => write!(f, "PM"),
            AgentType::Ba => write!(f, "BA"),
            AgentType::Sa => write!(f, "SA"),
            AgentType::Research => write!(f, "RESEARCH"),
            AgentType::QualityJudge => write!(f, "QUALITY_JUDGE"),
            AgentType::Implementation => write!(f, "IMPLEMENTATION"),
            AgentType::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl std::str::FromStr for AgentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PM" => AgentType::Pm,
            "BA" => AgentType::Ba,
            "SA" => AgentType::Sa,
            "RESEARCH" => AgentType::Research,
            "QUALITY_JUDGE" => AgentType::QualityJudge,
            "IMPLEMENTATION" => AgentType::Implementation,
            other => AgentType::Custom(other.to_string()),
        })
    }
}

impl Serialize for AgentType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AgentType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap())
    }
}

/// Priority level used to order tasks inside an instance's local queue.
/// Lower numeric value sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
    Background = 5,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

/// Declared shape of a task's payload or a result's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    Text,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

/// Clamp a score into `[0.0, 1.0]`, the shared invariant for confidence and
/// quality values throughout the data model.
pub fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub data: Value,
    pub format: DataFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub data: Value,
    pub format: DataFormat,
    pub confidence: f64,
    #[serde(default)]
    pub next_actions: Vec<String>,
}

impl TaskOutput {
    pub fn new(data: Value, format: DataFormat, confidence: f64) -> Self {
        Self {
            data,
            format,
            confidence: clamp_unit(confidence),
            next_actions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub model_used: String,
    pub execution_time_secs: f64,
    pub quality: f64,
}

/// Identifies where a task sits in the larger workflow it was spawned from:
/// which execution it belongs to, which phase of that execution it
/// represents, and a correlation id an external tracing system can use to
/// stitch together the request that produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub workflow_id: String,
    pub phase: String,
    pub correlation_id: String,
}

impl TaskContext {
    pub fn new(workflow_id: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            phase: phase.into(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

/// A unit of work assigned to an agent of a given type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub agent_type: AgentType,
    #[serde(rename = "type")]
    pub task_type: String,
    pub input: TaskInput,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl AgentTask {
    pub fn new(agent_type: AgentType, task_type: impl Into<String>, input: TaskInput) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_type,
            task_type: task_type.into(),
            input,
            context: TaskContext::default(),
            priority: TaskPriority::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: TaskStatus::Pending,
        }
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    /// PENDING -> IN_PROGRESS. Fails if the task has already left PENDING.
    pub fn start(&mut self) -> Result<(), crate::error::OrchestrationError> {
        if self.status != TaskStatus::Pending {
            return Err(crate::error::OrchestrationError::State(format!(
                "task {} is {:?}, cannot start",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// IN_PROGRESS -> COMPLETED. Fails if the task is not currently running.
    pub fn complete(&mut self) -> Result<(), crate::error::OrchestrationError> {
        if self.status != TaskStatus::InProgress {
            return Err(crate::error::OrchestrationError::State(format!(
                "task {} is {:?}, cannot complete",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Marks the task FAILED. Terminal statuses never revert, so this is a
    /// no-op once the task is already COMPLETED, FAILED, or CANCELLED.
    pub fn fail(&mut self) {
        if !self.is_terminal() {
            self.status = TaskStatus::Failed;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Marks the task CANCELLED. Terminal statuses never revert.
    pub fn cancel(&mut self) {
        if !self.is_terminal() {
            self.status = TaskStatus::Cancelled;
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Outcome produced by an agent for a given task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub task_id: String,
    pub instance_id: String,
    pub status: TaskStatus,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
    pub metadata: ResultMetadata,
    pub completed_at: DateTime<Utc>,
}

impl AgentResult {
    pub fn success(task: &AgentTask, instance_id: impl Into<String>, output: TaskOutput, model_used: impl Into<String>, execution_time_secs: f64) -> Self {
        let quality = output.confidence;
        Self {
            task_id: task.id.clone(),
            instance_id: instance_id.into(),
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            metadata: ResultMetadata {
                model_used: model_used.into(),
                execution_time_secs,
                quality,
            },
            completed_at: Utc::now(),
        }
    }

    pub fn failure(task: &AgentTask, instance_id: impl Into<String>, error: impl Into<String>, execution_time_secs: f64) -> Self {
        Self {
            task_id: task.id.clone(),
            instance_id: instance_id.into(),
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.into()),
            metadata: ResultMetadata {
                model_used: "none".to_string(),
                execution_time_secs,
                quality: 0.0,
            },
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TaskStatus::Completed)
    }
}

/// Cost tier and fallback chain for the model a role handler would invoke.
/// Opaque to the runtime: stored and reported, and used only to cap a
/// pool's `max_instances` (see `AgentPool::new`), never otherwise
/// interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAssignment {
    pub role: AgentType,
    pub tier: String,
    pub recommended_model: String,
    pub fallback_model: Option<String>,
    pub max_concurrent_instances: usize,
    pub cost_per_token: f64,
}
