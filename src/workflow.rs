//! Data model for a workflow run: the plan an operator submits, the
//! per-task and per-workflow execution records the executor maintains
//! while running it, and the checkpoints it leaves along the way.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestrationError;
use crate::task::{AgentTask, AgentType, DataFormat, TaskInput, TaskPriority};

/// How the executor schedules the agent assignments in a [`WorkflowPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPattern {
    Sequential,
    Parallel,
    /// Same behaviour as `Parallel` in this version; the distinguishing
    /// runtime re-planning this pattern implies is a documented extension
    /// point, not yet implemented.
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub agent_type: AgentType,
    pub task_type: String,
    pub input: Value,
    pub priority: TaskPriority,
    /// Ids (within this plan) of assignments that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub id: String,
}

/// An operator-submitted plan: a set of agent assignments and the pattern
/// used to schedule them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub id: String,
    pub name: String,
    pub pattern: ExecutionPattern,
    pub assignments: Vec<AgentAssignment>,
}

impl WorkflowPlan {
    /// Structural validation: non-empty id, non-empty assignment list,
    /// every `depends_on` reference resolves, and the dependency graph is
    /// acyclic.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.id.is_empty() {
            return Err(OrchestrationError::Validation("plan id must not be empty".into()));
        }
        if self.assignments.is_empty() {
            return Err(OrchestrationError::Validation(format!(
                "plan {} has no agent assignments",
                self.id
            )));
        }
        let ids: HashSet<&str> = self.assignments.iter().map(|a| a.id.as_str()).collect();
        for assignment in &self.assignments {
            for dep in &assignment.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(OrchestrationError::Dependency(format!(
                        "assignment {} depends on unknown assignment {}",
                        assignment.id, dep
                    )));
                }
            }
        }
        if self.has_cycle() {
            return Err(OrchestrationError::Dependency(format!(
                "plan {} has a circular dependency",
                self.id
            )));
        }
        Ok(())
    }

    fn has_cycle(&self) -> bool {
        use petgraph::algo::is_cyclic_directed;
        use petgraph::graph::DiGraph;
        use std::collections::HashMap;

        let mut graph = DiGraph::<(), ()>::new();
        let mut indices = HashMap::new();
        for assignment in &self.assignments {
            let idx = graph.add_node(());
            indices.insert(assignment.id.clone(), idx);
        }
        for assignment in &self.assignments {
            let to = indices[&assignment.id];
            for dep in &assignment.depends_on {
                let from = indices[dep];
                graph.add_edge(from, to, ());
            }
        }
        is_cyclic_directed(&graph)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Per-assignment bookkeeping the executor maintains for the lifetime of a
/// workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub assignment_id: String,
    pub task: AgentTask,
    pub status: TaskExecutionStatus,
    pub agent_instance_id: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskExecution {
    pub fn new(assignment_id: String, task: AgentTask) -> Self {
        Self {
            assignment_id,
            task,
            status: TaskExecutionStatus::Pending,
            agent_instance_id: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// A snapshot of executor-maintained state at some point in a run, used to
/// support rollback. Only counters and progress are restored on rollback
/// ("soft rollback"): the exact partition of tasks across
/// pending/running/completed/failed sets at the time of the checkpoint is
/// not reconstructed, even though `snapshot` records the set sizes that
/// were true at checkpoint time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub phase: String,
    pub description: String,
    /// Whether `rollback` may target this checkpoint. Only the latest
    /// checkpoint is ever consulted by `rollback` (see §4.5), so this flag
    /// is informational for every checkpoint but the most recent.
    pub recoverable: bool,
    pub current_step: usize,
    pub progress_percentage: f64,
    /// `{ completed_phases, counts: { pending, active, completed, failed } }`
    /// at the moment the checkpoint was taken.
    pub snapshot: Value,
}

/// The full record of one workflow run.
///
/// `task_executions` plus the four id sets (`pending_tasks`, `active_tasks`,
/// `completed_tasks`, `failed_tasks`) are the authoritative bookkeeping the
/// executor mutates as the run progresses — ported directly from the
/// original `WorkflowExecution` dataclass's same-named fields. The four sets
/// must stay pairwise disjoint and union to `task_executions.keys()`
/// (see [`WorkflowExecution::check_task_set_invariant`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub plan: WorkflowPlan,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step: usize,
    pub progress_percentage: f64,
    pub error_message: Option<String>,
    pub task_executions: HashMap<String, TaskExecution>,
    pub pending_tasks: HashSet<String>,
    pub active_tasks: HashSet<String>,
    pub completed_tasks: HashSet<String>,
    pub failed_tasks: HashSet<String>,
    pub checkpoints: Vec<Checkpoint>,
    pub critical_failures: Vec<Value>,
    pub partial_results: std::collections::HashMap<String, Value>,
    pub rollback_info: Option<Value>,
}

impl WorkflowExecution {
    pub fn new(plan: WorkflowPlan) -> Self {
        let mut task_executions = HashMap::new();
        let mut pending_tasks = HashSet::new();
        for assignment in &plan.assignments {
            let mut task = AgentTask::new(
                assignment.agent_type.clone(),
                assignment.task_type.clone(),
                TaskInput {
                    data: assignment.input.clone(),
                    format: DataFormat::Json,
                },
            );
            task.priority = assignment.priority;
            pending_tasks.insert(assignment.id.clone());
            task_executions.insert(assignment.id.clone(), TaskExecution::new(assignment.id.clone(), task));
        }
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            plan,
            state: ExecutionState::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_step: 0,
            progress_percentage: 0.0,
            error_message: None,
            task_executions,
            pending_tasks,
            active_tasks: HashSet::new(),
            completed_tasks: HashSet::new(),
            failed_tasks: HashSet::new(),
            checkpoints: Vec::new(),
            critical_failures: Vec::new(),
            partial_results: std::collections::HashMap::new(),
            rollback_info: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// Ids of assignments whose dependencies are all in `completed_tasks`.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.pending_tasks
            .iter()
            .filter(|id| {
                let assignment = self.plan.assignments.iter().find(|a| &a.id == *id);
                assignment
                    .map(|a| a.depends_on.iter().all(|d| self.completed_tasks.contains(d)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn update_progress(&mut self) {
        let total = self.task_executions.len();
        if total > 0 {
            self.current_step = self.completed_tasks.len();
            self.progress_percentage = (self.completed_tasks.len() as f64 / total as f64) * 100.0;
        }
    }

    /// The four task-id sets are pairwise disjoint and their union equals
    /// `task_executions.keys()`.
    pub fn check_task_set_invariant(&self) -> bool {
        let all_ids: HashSet<&String> = self.task_executions.keys().collect();
        let union: HashSet<&String> = self
            .pending_tasks
            .iter()
            .chain(self.active_tasks.iter())
            .chain(self.completed_tasks.iter())
            .chain(self.failed_tasks.iter())
            .collect();
        if union != all_ids {
            return false;
        }
        let sets = [&self.pending_tasks, &self.active_tasks, &self.completed_tasks, &self.failed_tasks];
        for i in 0..sets.len() {
            for j in (i + 1)..sets.len() {
                if !sets[i].is_disjoint(sets[j]) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AgentType;

    fn plan_with(ids_and_deps: &[(&str, &[&str])]) -> WorkflowPlan {
        WorkflowPlan {
            id: "p1".into(),
            name: "test".into(),
            pattern: ExecutionPattern::Sequential,
            assignments: ids_and_deps
                .iter()
                .map(|(id, deps)| AgentAssignment {
                    agent_type: AgentType::Implementation,
                    task_type: "implementation_task".into(),
                    input: serde_json::json!({}),
                    priority: TaskPriority::Medium,
                    depends_on: deps.iter().map(|d| d.to_string()).collect(),
                    id: id.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn new_execution_satisfies_task_set_invariant() {
        let plan = plan_with(&[("a", &[]), ("b", &["a"])]);
        let exec = WorkflowExecution::new(plan);
        assert!(exec.check_task_set_invariant());
        assert_eq!(exec.pending_tasks.len(), 2);
        assert!(exec.ready_tasks().contains(&"a".to_string()));
        assert!(!exec.ready_tasks().contains(&"b".to_string()));
    }

    #[test]
    fn ready_tasks_respects_dependencies() {
        let plan = plan_with(&[("a", &[]), ("b", &[]), ("c", &["a", "b"])]);
        let mut exec = WorkflowExecution::new(plan);
        assert_eq!(exec.ready_tasks().len(), 2);
        exec.pending_tasks.remove("a");
        exec.completed_tasks.insert("a".to_string());
        assert!(!exec.ready_tasks().contains(&"c".to_string()));
        exec.pending_tasks.remove("b");
        exec.completed_tasks.insert("b".to_string());
        assert_eq!(exec.ready_tasks(), vec!["c".to_string()]);
    }

    #[test]
    fn plan_validate_rejects_empty_and_cycles() {
        let empty = WorkflowPlan {
            id: "p".into(),
            name: "n".into(),
            pattern: ExecutionPattern::Sequential,
            assignments: vec![],
        };
        assert!(empty.validate().is_err());

        let cyclic = plan_with(&[("a", &["b"]), ("b", &["a"])]);
        assert!(cyclic.validate().is_err());

        let ok = plan_with(&[("a", &[]), ("b", &["a"])]);
        assert!(ok.validate().is_ok());
    }
}
