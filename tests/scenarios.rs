//! End-to-end scenarios exercising the executor, pool, and recovery policy
//! together: a scripted [`RoleHandler`] stands in for a real model
//! integration so each scenario can deterministically script
//! success/failure without a live agent process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;

use sdlc_orchestrator::agent::RoleHandler;
use sdlc_orchestrator::error::AgentError;
use sdlc_orchestrator::pool::AgentPool;
use sdlc_orchestrator::task::{AgentResult, AgentTask, AgentType, DataFormat, TaskOutput};
use sdlc_orchestrator::transport::LocalPoolTransport;
use sdlc_orchestrator::workflow::{AgentAssignment, ExecutionPattern, WorkflowPlan};
use sdlc_orchestrator::{ExecutionState, Executor, ExecutorConfig, ScalingThresholds, TaskPriority};

/// A [`RoleHandler`] whose failures are scripted per `task_type`: the first
/// N invocations of a given task type fail, after which it succeeds.
/// Sleeps briefly so tests have a window to sample intermediate state.
struct ScriptedHandler {
    agent_type: AgentType,
    remaining_failures: DashMap<String, AtomicU32>,
    invocations: DashMap<String, AtomicU32>,
    delay: Duration,
}

impl ScriptedHandler {
    fn new(agent_type: AgentType) -> Arc<Self> {
        Arc::new(Self {
            agent_type,
            remaining_failures: DashMap::new(),
            invocations: DashMap::new(),
            delay: Duration::from_millis(60),
        })
    }

    fn fail_first(self: &Arc<Self>, task_type: &str, times: u32) {
        self.remaining_failures
            .insert(task_type.to_string(), AtomicU32::new(times));
    }

    fn invocation_count(&self, task_type: &str) -> u32 {
        self.invocations
            .get(task_type)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[async_trait]
impl RoleHandler for ScriptedHandler {
    fn agent_type(&self) -> AgentType {
        self.agent_type.clone()
    }

    fn validate_task(&self, _task: &AgentTask) -> bool {
        true
    }

    async fn execute(&self, task: &AgentTask) -> Result<AgentResult, AgentError> {
        tokio::time::sleep(self.delay).await;
        self.invocations
            .entry(task.task_type.clone())
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .remaining_failures
            .get(&task.task_type)
            .map(|counter| {
                let prev = counter.load(Ordering::SeqCst);
                if prev > 0 {
                    counter.fetch_sub(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if should_fail {
            return Err(AgentError::Execution {
                agent_id: "scripted".into(),
                task_id: task.id.clone(),
                message: "scripted failure".into(),
            });
        }

        let output = TaskOutput::new(json!({ "task_type": task.task_type }), DataFormat::Json, 0.9);
        Ok(AgentResult::success(task, "scripted-instance", output, "scripted-model", 0.01))
    }
}

fn assignment(id: &str, agent_type: AgentType, task_type: &str, depends_on: &[&str]) -> AgentAssignment {
    AgentAssignment {
        agent_type,
        task_type: task_type.to_string(),
        input: json!({}),
        priority: TaskPriority::Medium,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        id: id.to_string(),
    }
}

type Handlers = HashMap<AgentType, Arc<ScriptedHandler>>;
type Pools = HashMap<AgentType, Arc<AgentPool>>;

/// Builds one scripted pool per `PM`, `SA`, and `IMPLEMENTATION`, plus an
/// executor wired to all of them through a [`LocalPoolTransport`].
fn setup(thresholds: ScalingThresholds) -> (Arc<Executor>, Pools, Handlers) {
    let roles = [AgentType::Pm, AgentType::Sa, AgentType::Implementation];
    let mut handlers = Handlers::new();
    let mut pools = Pools::new();
    for role in roles {
        let handler = ScriptedHandler::new(role.clone());
        let pool = AgentPool::new(role.clone(), handler.clone(), thresholds);
        handlers.insert(role.clone(), handler);
        pools.insert(role, pool);
    }
    let transport = Arc::new(LocalPoolTransport::new(pools.clone()));
    let executor = Executor::new(pools.clone(), transport, ExecutorConfig::default());
    (executor, pools, handlers)
}

async fn wait_for_terminal(
    executor: &Arc<Executor>,
    execution_id: &str,
) -> sdlc_orchestrator::workflow::WorkflowExecution {
    loop {
        let exec = executor.status(execution_id).await.expect("execution must exist");
        if matches!(
            exec.state,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        ) {
            return exec;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Scenario 1 — sequential happy path: three assignments [PM, SA,
/// IMPLEMENTATION] that all succeed. Expect COMPLETED, full completion set,
/// 100% progress, and checkpoints including the `workflow_started`/
/// `workflow_completed` boundaries.
#[tokio::test]
async fn scenario_1_sequential_happy_path() {
    let (executor, _pools, _handlers) = setup(ScalingThresholds {
        min_instances: 1,
        max_instances: 2,
        ..ScalingThresholds::default()
    });

    let plan = WorkflowPlan {
        id: "plan-seq".into(),
        name: "sequential happy path".into(),
        pattern: ExecutionPattern::Sequential,
        assignments: vec![
            assignment("t0", AgentType::Pm, "plan_roadmap", &[]),
            assignment("t1", AgentType::Sa, "architecture_design", &["t0"]),
            assignment("t2", AgentType::Implementation, "implementation_task", &["t1"]),
        ],
    };

    let execution_id = executor.execute(plan).await.unwrap();
    let exec = wait_for_terminal(&executor, &execution_id).await;

    assert_eq!(exec.state, ExecutionState::Completed);
    assert_eq!(exec.completed_tasks.len(), 3);
    assert!(exec.pending_tasks.is_empty());
    assert!(exec.active_tasks.is_empty());
    assert_eq!(exec.progress_percentage, 100.0);
    assert!(exec.check_task_set_invariant());

    let phases: Vec<&str> = exec.checkpoints.iter().map(|c| c.phase.as_str()).collect();
    assert!(phases.contains(&"workflow_started"));
    assert!(phases.contains(&"workflow_completed"));
}

/// Scenario 2 — parallel with one dependency: t0 (PM) and t1 (SA) run
/// concurrently, t2 (IMPLEMENTATION) depends on both. At no sampled point is
/// t2 active while either t0 or t1 is still pending/active.
#[tokio::test]
async fn scenario_2_parallel_with_dependency() {
    let (executor, _pools, _handlers) = setup(ScalingThresholds {
        min_instances: 1,
        max_instances: 2,
        ..ScalingThresholds::default()
    });

    let plan = WorkflowPlan {
        id: "plan-par".into(),
        name: "parallel with dependency".into(),
        pattern: ExecutionPattern::Parallel,
        assignments: vec![
            assignment("t0", AgentType::Pm, "plan_roadmap", &[]),
            assignment("t1", AgentType::Sa, "architecture_design", &[]),
            assignment("t2", AgentType::Implementation, "implementation_task", &["t0", "t1"]),
        ],
    };

    let execution_id = executor.execute(plan).await.unwrap();

    let mut violation = false;
    loop {
        let exec = executor.status(&execution_id).await.unwrap();
        let t2_active = exec.active_tasks.contains("t2");
        let t0_unfinished = exec.pending_tasks.contains("t0") || exec.active_tasks.contains("t0");
        let t1_unfinished = exec.pending_tasks.contains("t1") || exec.active_tasks.contains("t1");
        if t2_active && (t0_unfinished || t1_unfinished) {
            violation = true;
        }
        if matches!(
            exec.state,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        ) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!violation, "t2 must never be active while a dependency is unfinished");
    let exec = executor.status(&execution_id).await.unwrap();
    assert_eq!(exec.state, ExecutionState::Completed);
    assert_eq!(exec.completed_tasks.len(), 3);
}

/// Scenario 3 — retry then succeed: t0 fails twice then succeeds on the
/// third attempt, comfortably within the default retry budget.
#[tokio::test]
async fn scenario_3_retry_then_succeed() {
    let (executor, pools, handlers) = setup(ScalingThresholds {
        min_instances: 1,
        max_instances: 1,
        ..ScalingThresholds::default()
    });
    handlers[&AgentType::Pm].fail_first("plan_roadmap", 2);

    let plan = WorkflowPlan {
        id: "plan-retry".into(),
        name: "retry then succeed".into(),
        pattern: ExecutionPattern::Sequential,
        assignments: vec![assignment("t0", AgentType::Pm, "plan_roadmap", &[])],
    };

    let execution_id = executor.execute(plan).await.unwrap();
    let exec = wait_for_terminal(&executor, &execution_id).await;

    assert_eq!(exec.state, ExecutionState::Completed);
    assert_eq!(exec.completed_tasks.len(), 1);
    // Two scripted failures plus the final success is three invocations.
    assert_eq!(handlers[&AgentType::Pm].invocation_count("plan_roadmap"), 3);
    assert_eq!(pools[&AgentType::Pm].status().total_instances, 1);
}

/// Scenario 4 — reassign after exhausting retries: t0 fails more times than
/// `max_retries` on a pool with a second idle instance available, so the
/// recovery policy reassigns rather than aborting; the workflow still
/// completes.
#[tokio::test]
async fn scenario_4_reassign_after_exhausting_retries() {
    let (executor, _pools, handlers) = setup(ScalingThresholds {
        min_instances: 2,
        max_instances: 2,
        ..ScalingThresholds::default()
    });
    // max_retries is 3 (src/recovery.rs); fail one more time than that so
    // recovery moves from RETRY to REASSIGN instead of succeeding on retry.
    handlers[&AgentType::Pm].fail_first("plan_roadmap", 4);

    let plan = WorkflowPlan {
        id: "plan-reassign".into(),
        name: "reassign after exhausting retries".into(),
        pattern: ExecutionPattern::Sequential,
        assignments: vec![assignment("t0", AgentType::Pm, "plan_roadmap", &[])],
    };

    let execution_id = executor.execute(plan).await.unwrap();
    let exec = wait_for_terminal(&executor, &execution_id).await;

    assert_eq!(exec.state, ExecutionState::Completed);
    assert_eq!(exec.completed_tasks.len(), 1);
    assert!(handlers[&AgentType::Pm].invocation_count("plan_roadmap") >= 5);
}

/// Scenario 5 — critical failure and rollback: t0 fails more times than
/// `max_retries` with no backup instance available, so recovery aborts the
/// workflow; one critical failure is recorded, and a subsequent rollback
/// attempt is rejected because the execution has already moved to history.
#[tokio::test]
async fn scenario_5_critical_failure_and_rollback() {
    let (executor, _pools, handlers) = setup(ScalingThresholds {
        min_instances: 1,
        max_instances: 1,
        ..ScalingThresholds::default()
    });
    handlers[&AgentType::Pm].fail_first("plan_roadmap", 100);

    let plan = WorkflowPlan {
        id: "plan-critical".into(),
        name: "critical failure".into(),
        pattern: ExecutionPattern::Sequential,
        assignments: vec![assignment("t0", AgentType::Pm, "plan_roadmap", &[])],
    };

    let execution_id = executor.execute(plan).await.unwrap();
    let exec = wait_for_terminal(&executor, &execution_id).await;

    assert_eq!(exec.state, ExecutionState::Failed);
    assert_eq!(exec.critical_failures.len(), 1);
    assert!(!exec.checkpoints.is_empty());
    assert_eq!(exec.failed_tasks.len(), 1);

    // Rollback only operates on active executions; a FAILED execution has
    // already moved to history, matching `rollback`'s "not active" contract.
    let rollback_result = executor.rollback(&execution_id, None).await;
    assert!(rollback_result.is_err());
}

/// Scenario 6 — pool auto-scale under load: a parallel plan with twenty
/// independent IMPLEMENTATION tasks drives that pool from `min_instances`
/// up toward `max_instances` under sustained queueing, recording a peak
/// load at or above the scale-up threshold, then back down once the queue
/// has drained and the scale-down cooldown has elapsed.
#[tokio::test]
async fn scenario_6_pool_autoscale_under_load() {
    let thresholds = ScalingThresholds {
        scale_up_threshold: 0.8,
        scale_down_threshold: 0.3,
        min_instances: 1,
        max_instances: 5,
        scale_up_cooldown: Duration::from_millis(0),
        scale_down_cooldown: Duration::from_millis(0),
        queue_threshold: 2,
    };
    let (executor, pools, _handlers) = setup(thresholds);

    let assignments: Vec<AgentAssignment> = (0..20)
        .map(|i| assignment(&format!("t{i}"), AgentType::Implementation, "implementation_task", &[]))
        .collect();
    let plan = WorkflowPlan {
        id: "plan-autoscale".into(),
        name: "pool auto-scale under load".into(),
        pattern: ExecutionPattern::Parallel,
        assignments,
    };

    let execution_id = executor.execute(plan).await.unwrap();
    let impl_pool = pools[&AgentType::Implementation].clone();

    let mut saw_max_instances = false;
    loop {
        let status = impl_pool.status();
        if status.total_instances >= thresholds.max_instances {
            saw_max_instances = true;
        }
        let exec = executor.status(&execution_id).await.unwrap();
        if exec.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(saw_max_instances, "pool should have scaled up to max_instances under a 20-task burst");
    assert!(impl_pool.status().peak_load >= thresholds.scale_up_threshold);

    // Let the now-idle pool's auto-scaler shrink it back toward min_instances.
    for _ in 0..200 {
        impl_pool.evaluate_scaling().await;
        if impl_pool.status().total_instances <= thresholds.min_instances {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(impl_pool.status().total_instances, thresholds.min_instances);
    assert_eq!(impl_pool.idle_instance_count(), thresholds.min_instances);
}
