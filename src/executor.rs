//! Workflow executor: drives a [`WorkflowPlan`] to completion, coordinating
//! agent pools and applying the recovery policy when tasks fail.
//!
//! Ported from the original `Orchestrator` class. The
//! `ThreadPoolExecutor(max_workers=max_concurrent_workflows * 2)` bound
//! becomes a `tokio::sync::Semaphore` of the same size; the single
//! `threading.RLock` guarding `active_executions` becomes the `RwLock`
//! wrapping the active-execution map below. Lock ordering is always
//! executor state, then pool state, then instance state — never the
//! reverse.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info, warn};

use crate::error::OrchestrationError;
use crate::interfaces::{AgentTransport, QualityScorer};
use crate::pool::AgentPool;
use crate::recovery::{self, RecoveryAction};
use crate::task::AgentType;
use crate::workflow::{
    Checkpoint, ExecutionPattern, ExecutionState, TaskExecutionStatus, WorkflowExecution,
    WorkflowPlan,
};

const EXECUTION_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
const SEQUENTIAL_POLL_INTERVAL: Duration = Duration::from_secs(1);
const PARALLEL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CHECKPOINT_EVERY_N_COMPLETIONS: usize = 3;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_workflows: usize,
    pub task_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            task_timeout: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time_secs: f64,
    pub task_success_rate: f64,
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self {
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            average_execution_time_secs: 0.0,
            task_success_rate: 1.0,
        }
    }
}

struct MetricsState {
    metrics: ExecutionMetrics,
    completed_count: u64,
}

impl MetricsState {
    fn record_task(&mut self, success: bool, execution_time_secs: f64) {
        let n = self.completed_count as f64;
        self.metrics.average_execution_time_secs =
            (self.metrics.average_execution_time_secs * n + execution_time_secs) / (n + 1.0);
        self.completed_count += 1;
        // EMA with alpha = 0.1, matching the original `_update_metrics`.
        let alpha = 0.1;
        let sample = if success { 1.0 } else { 0.0 };
        self.metrics.task_success_rate =
            self.metrics.task_success_rate * (1.0 - alpha) + sample * alpha;
    }

    fn record_workflow(&mut self, success: bool) {
        self.metrics.total_executions += 1;
        if success {
            self.metrics.successful_executions += 1;
        } else {
            self.metrics.failed_executions += 1;
        }
    }
}

/// Coordinates workflow execution across a set of agent pools, one per
/// [`AgentType`].
pub struct Executor {
    pools: HashMap<AgentType, Arc<AgentPool>>,
    transport: Arc<dyn AgentTransport>,
    quality_scorer: Option<Arc<dyn QualityScorer>>,
    active: Arc<RwLock<HashMap<String, WorkflowExecution>>>,
    history: Arc<RwLock<HashMap<String, WorkflowExecution>>>,
    semaphore: Arc<Semaphore>,
    config: ExecutorConfig,
    metrics: Arc<parking_lot::RwLock<MetricsState>>,
}

impl Executor {
    pub fn new(
        pools: HashMap<AgentType, Arc<AgentPool>>,
        transport: Arc<dyn AgentTransport>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Self::with_quality_scorer(pools, transport, config, None)
    }

    /// Like [`Executor::new`], but wires an optional [`QualityScorer`] hook:
    /// when present, its score (not the raw `AgentResult::metadata.quality`)
    /// is what gets forwarded to `pool.complete_task` and the execution
    /// metrics. The executor reads the score but never interprets it beyond
    /// clamping.
    pub fn with_quality_scorer(
        pools: HashMap<AgentType, Arc<AgentPool>>,
        transport: Arc<dyn AgentTransport>,
        config: ExecutorConfig,
        quality_scorer: Option<Arc<dyn QualityScorer>>,
    ) -> Arc<Self> {
        let permits = config.max_concurrent_workflows * 2;
        let heartbeat_interval = config.heartbeat_interval;
        let executor = Arc::new(Self {
            pools,
            transport,
            quality_scorer,
            active: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
            metrics: Arc::new(parking_lot::RwLock::new(MetricsState {
                metrics: ExecutionMetrics::default(),
                completed_count: 0,
            })),
        });

        // Background monitoring tick, per spec.md §4.4. Holds only a `Weak`
        // reference so the loop exits on its own once every `Arc<Executor>`
        // is dropped, rather than keeping the executor alive forever.
        let weak = Arc::downgrade(&executor);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let Some(executor) = weak.upgrade() else { break };
                executor.monitor_tick().await;
            }
        });

        executor
    }

    /// Validates and schedules a plan, returning its execution id
    /// immediately; the run proceeds on a background task.
    pub async fn execute(self: &Arc<Self>, plan: WorkflowPlan) -> Result<String, OrchestrationError> {
        plan.validate()?;

        {
            let active = self.active.read().await;
            if active.len() >= self.config.max_concurrent_workflows {
                return Err(OrchestrationError::Capacity(format!(
                    "{} workflows already running",
                    active.len()
                )));
            }
        }

        for assignment in &plan.assignments {
            if !self.pools.contains_key(&assignment.agent_type) {
                return Err(OrchestrationError::Distribution(format!(
                    "no pool registered for agent type {}",
                    assignment.agent_type
                )));
            }
        }

        let execution = WorkflowExecution::new(plan);
        let execution_id = execution.execution_id.clone();
        self.active.write().await.insert(execution_id.clone(), execution);

        let this = self.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            this.run(id).await;
        });

        Ok(execution_id)
    }

    pub async fn status(&self, execution_id: &str) -> Option<WorkflowExecution> {
        if let Some(exec) = self.active.read().await.get(execution_id) {
            return Some(exec.clone());
        }
        self.history.read().await.get(execution_id).cloned()
    }

    pub async fn active_executions(&self) -> Vec<WorkflowExecution> {
        self.active.read().await.values().cloned().collect()
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        self.metrics.read().metrics.clone()
    }

    pub async fn pause(&self, execution_id: &str) -> Result<(), OrchestrationError> {
        let mut active = self.active.write().await;
        let exec = active
            .get_mut(execution_id)
            .ok_or_else(|| OrchestrationError::State(format!("{execution_id} is not active")))?;
        if exec.state != ExecutionState::Running {
            return Err(OrchestrationError::State(format!(
                "cannot pause execution in state {:?}",
                exec.state
            )));
        }
        exec.state = ExecutionState::Paused;
        Ok(())
    }

    pub async fn resume(&self, execution_id: &str) -> Result<(), OrchestrationError> {
        let mut active = self.active.write().await;
        let exec = active
            .get_mut(execution_id)
            .ok_or_else(|| OrchestrationError::State(format!("{execution_id} is not active")))?;
        if exec.state != ExecutionState::Paused {
            return Err(OrchestrationError::State(format!(
                "cannot resume execution in state {:?}",
                exec.state
            )));
        }
        exec.state = ExecutionState::Running;
        Ok(())
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<(), OrchestrationError> {
        let mut active = self.active.write().await;
        let exec = active
            .get_mut(execution_id)
            .ok_or_else(|| OrchestrationError::State(format!("{execution_id} is not active")))?;
        if exec.is_terminal() {
            return Err(OrchestrationError::State(format!(
                "execution {execution_id} is already terminal"
            )));
        }
        exec.state = ExecutionState::Cancelled;
        exec.completed_at = Some(chrono::Utc::now());
        let remaining: Vec<String> = exec
            .active_tasks
            .iter()
            .chain(exec.pending_tasks.iter())
            .cloned()
            .collect();
        for id in remaining {
            exec.active_tasks.remove(&id);
            exec.pending_tasks.remove(&id);
            exec.failed_tasks.insert(id.clone());
            if let Some(task_exec) = exec.task_executions.get_mut(&id) {
                task_exec.status = TaskExecutionStatus::Cancelled;
                task_exec.completed_at = Some(chrono::Utc::now());
            }
        }
        let exec = active.remove(execution_id).unwrap();
        self.history.write().await.insert(execution_id.to_string(), exec);
        Ok(())
    }

    /// Restores `current_step` and `progress_percentage` from the named
    /// checkpoint (or the latest one if `None`), cancelling any tasks still
    /// active and resuming the run. This is a soft rollback, preserved
    /// deliberately: it does not reconstruct the exact
    /// pending/active/completed/failed partition as it stood at checkpoint
    /// time, only the progress counters — a documented v1 limitation, not a
    /// defect (see DESIGN.md).
    pub async fn rollback(
        &self,
        execution_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<bool, OrchestrationError> {
        let mut active = self.active.write().await;
        let exec = active
            .get_mut(execution_id)
            .ok_or_else(|| OrchestrationError::State(format!("{execution_id} is not active")))?;

        if exec.checkpoints.is_empty() {
            return Ok(false);
        }
        let checkpoint = match checkpoint_id {
            Some(id) => exec
                .checkpoints
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| OrchestrationError::Validation(format!("unknown checkpoint {id}")))?,
            None => exec.checkpoints.last().cloned().expect("checked non-empty above"),
        };

        let previous_state = exec.state;
        exec.state = ExecutionState::Paused;

        let remaining_active: Vec<String> = exec.active_tasks.iter().cloned().collect();
        for id in remaining_active {
            exec.active_tasks.remove(&id);
            exec.failed_tasks.insert(id.clone());
            if let Some(task_exec) = exec.task_executions.get_mut(&id) {
                task_exec.status = TaskExecutionStatus::Cancelled;
                task_exec.completed_at = Some(chrono::Utc::now());
            }
        }

        exec.current_step = checkpoint.current_step;
        exec.progress_percentage = checkpoint.progress_percentage;
        exec.rollback_info = Some(json!({
            "checkpoint_id": checkpoint.id,
            "rollback_time": chrono::Utc::now(),
            "target_phase": checkpoint.phase,
            "previous_state": format!("{previous_state:?}"),
        }));
        exec.state = ExecutionState::Running;
        Ok(true)
    }

    async fn run(self: Arc<Self>, execution_id: String) {
        let pattern = {
            let mut active = self.active.write().await;
            let Some(exec) = active.get_mut(&execution_id) else { return };
            exec.state = ExecutionState::Initializing;
            exec.state = ExecutionState::Running;
            exec.started_at = Some(chrono::Utc::now());
            exec.plan.pattern
        };
        self.checkpoint(&execution_id, "workflow_started", "workflow started").await;

        let deadline = tokio::time::Instant::now() + EXECUTION_TIMEOUT;
        let outcome = tokio::time::timeout_at(deadline, async {
            match pattern {
                ExecutionPattern::Sequential => self.run_sequential(&execution_id).await,
                ExecutionPattern::Parallel | ExecutionPattern::Dynamic => {
                    self.clone().run_parallel(&execution_id).await
                }
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(OrchestrationError::Timeout(EXECUTION_TIMEOUT)),
        };

        let success = result.is_ok();
        {
            let mut active = self.active.write().await;
            if let Some(exec) = active.get_mut(&execution_id) {
                exec.completed_at = Some(chrono::Utc::now());
                match &result {
                    Ok(()) => {
                        exec.state = ExecutionState::Completed;
                        exec.progress_percentage = 100.0;
                    }
                    Err(err) => {
                        if exec.state != ExecutionState::Cancelled {
                            exec.state = ExecutionState::Failed;
                        }
                        exec.error_message = Some(err.to_string());
                    }
                }
            }
        }
        self.checkpoint(
            &execution_id,
            if success { "workflow_completed" } else { "workflow_failed" },
            if success { "workflow completed" } else { "workflow failed" },
        )
        .await;
        self.metrics.write().record_workflow(success);

        let mut active = self.active.write().await;
        if let Some(exec) = active.remove(&execution_id) {
            self.history.write().await.insert(execution_id.clone(), exec);
        }
    }

    /// One task at a time, in dependency order; a task is never moved out
    /// of `pending_tasks` until every dependency is in `completed_tasks`.
    /// An empty ready set with no active tasks is a circular dependency.
    async fn run_sequential(&self, execution_id: &str) -> Result<(), OrchestrationError> {
        let mut completed_since_checkpoint = 0;
        loop {
            if self.should_stop(execution_id).await {
                return Ok(());
            }
            if self.is_paused(execution_id).await {
                tokio::time::sleep(SEQUENTIAL_POLL_INTERVAL).await;
                continue;
            }

            let (ready, has_active, total) = {
                let active = self.active.read().await;
                let Some(exec) = active.get(execution_id) else { return Ok(()) };
                if exec.pending_tasks.is_empty() && exec.active_tasks.is_empty() {
                    return Ok(());
                }
                (exec.ready_tasks(), !exec.active_tasks.is_empty(), exec.task_executions.len())
            };

            let Some(assignment_id) = ready.into_iter().next() else {
                if has_active {
                    tokio::time::sleep(SEQUENTIAL_POLL_INTERVAL).await;
                    continue;
                }
                return Err(OrchestrationError::Dependency(format!(
                    "no ready tasks found in execution {execution_id} - possible circular dependency"
                )));
            };

            self.move_task(execution_id, &assignment_id, |exec, id| {
                exec.pending_tasks.remove(id);
                exec.active_tasks.insert(id.to_string());
            })
            .await;

            match self.run_one_task(execution_id, &assignment_id).await {
                Ok(()) => {
                    completed_since_checkpoint += 1;
                    if completed_since_checkpoint % CHECKPOINT_EVERY_N_COMPLETIONS == 0 {
                        self.checkpoint(
                            execution_id,
                            &format!("task_{assignment_id}_completed"),
                            "periodic checkpoint",
                        )
                        .await;
                    }
                    self.advance_progress(execution_id, total).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Dispatches every ready task concurrently, waits for the round to
    /// finish, then recomputes the ready set; terminates when
    /// `pending ∪ active` is empty.
    async fn run_parallel(self: Arc<Self>, execution_id: &str) -> Result<(), OrchestrationError> {
        loop {
            if self.should_stop(execution_id).await {
                return Ok(());
            }
            if self.is_paused(execution_id).await {
                tokio::time::sleep(PARALLEL_POLL_INTERVAL).await;
                continue;
            }

            let (ready, pending_empty, active_empty, total) = {
                let active = self.active.read().await;
                let Some(exec) = active.get(execution_id) else { return Ok(()) };
                (
                    exec.ready_tasks(),
                    exec.pending_tasks.is_empty(),
                    exec.active_tasks.is_empty(),
                    exec.task_executions.len(),
                )
            };

            if pending_empty && active_empty {
                return Ok(());
            }
            if ready.is_empty() {
                tokio::time::sleep(PARALLEL_POLL_INTERVAL).await;
                continue;
            }

            for assignment_id in &ready {
                self.move_task(execution_id, assignment_id, |exec, id| {
                    exec.pending_tasks.remove(id);
                    exec.active_tasks.insert(id.to_string());
                })
                .await;
            }

            let mut handles = Vec::new();
            for assignment_id in ready {
                let this = self.clone();
                let execution_id = execution_id.to_string();
                handles.push(tokio::spawn(async move {
                    let result = this.run_one_task(&execution_id, &assignment_id).await;
                    (assignment_id, result)
                }));
            }

            let mut completed_this_round = 0;
            for handle in handles {
                match handle.await {
                    Ok((_, Ok(()))) => completed_this_round += 1,
                    Ok((_, Err(err))) => return Err(err),
                    Err(join_err) => return Err(OrchestrationError::Execution(join_err.to_string())),
                }
            }
            if completed_this_round > 0 {
                self.checkpoint(execution_id, "progress", "periodic checkpoint").await;
            }
            self.advance_progress(execution_id, total).await;
        }
    }

    /// Consults the optional [`QualityScorer`] hook for a result's quality,
    /// falling back to the value the agent itself reported. The executor
    /// never acts on the number beyond forwarding it to pool metrics.
    async fn resolve_quality(&self, result: &crate::task::AgentResult) -> f64 {
        if let Some(scorer) = &self.quality_scorer {
            match scorer.score(result).await {
                Ok(score) => return crate::task::clamp_unit(score),
                Err(err) => warn!(%err, task_id = %result.task_id, "quality scorer hook failed, using agent-reported quality"),
            }
        }
        result.metadata.quality
    }

    async fn should_stop(&self, execution_id: &str) -> bool {
        let active = self.active.read().await;
        match active.get(execution_id) {
            Some(exec) => exec.is_terminal(),
            None => true,
        }
    }

    async fn is_paused(&self, execution_id: &str) -> bool {
        let active = self.active.read().await;
        matches!(active.get(execution_id).map(|e| e.state), Some(ExecutionState::Paused))
    }

    async fn advance_progress(&self, execution_id: &str, _total: usize) {
        let mut active = self.active.write().await;
        if let Some(exec) = active.get_mut(execution_id) {
            exec.update_progress();
        }
    }

    async fn move_task(
        &self,
        execution_id: &str,
        assignment_id: &str,
        f: impl FnOnce(&mut WorkflowExecution, &str),
    ) {
        let mut active = self.active.write().await;
        if let Some(exec) = active.get_mut(execution_id) {
            f(exec, assignment_id);
        }
    }

    async fn run_one_task(&self, execution_id: &str, assignment_id: &str) -> Result<(), OrchestrationError> {
        let (agent_type, pool) = {
            let active = self.active.read().await;
            let exec = active
                .get(execution_id)
                .ok_or_else(|| OrchestrationError::State(format!("{execution_id} is not active")))?;
            let assignment = exec
                .plan
                .assignments
                .iter()
                .find(|a| a.id == assignment_id)
                .ok_or_else(|| OrchestrationError::Validation(format!("unknown assignment {assignment_id}")))?;
            let pool = self
                .pools
                .get(&assignment.agent_type)
                .ok_or_else(|| OrchestrationError::Distribution(format!("no pool for {}", assignment.agent_type)))?
                .clone();
            (assignment.agent_type.clone(), pool)
        };

        loop {
            let task = {
                let mut active = self.active.write().await;
                // The execution may have been cancelled or rolled back out of
                // `active` into history by the time a retrying/sleeping task
                // loops back here; that's a normal race, not a bug, so bail
                // out quietly rather than panicking.
                let Some(exec) = active.get_mut(execution_id) else { return Ok(()) };
                let task_exec = exec
                    .task_executions
                    .get_mut(assignment_id)
                    .expect("task execution registered at plan initialization");
                task_exec.status = TaskExecutionStatus::InProgress;
                task_exec.started_at = Some(chrono::Utc::now());
                task_exec.task.clone()
            };

            // Bounded worker group shared across every running workflow: a
            // sequential-pattern workflow only ever holds one of these at a
            // time (its drive loop dispatches one task per iteration), while
            // a parallel-pattern workflow's whole ready set competes for
            // permits alongside every other active workflow.
            let _permit = match self.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return Err(OrchestrationError::Execution("dispatch worker group closed".into())),
            };

            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(self.config.task_timeout, self.transport.send_task(task)).await;

            let (success, error, instance_id) = match &outcome {
                Ok(Ok(result)) if result.is_success() => (true, None, Some(result.instance_id.clone())),
                Ok(Ok(result)) => (
                    false,
                    result.error.clone().or_else(|| Some("task failed".into())),
                    Some(result.instance_id.clone()),
                ),
                Ok(Err(err)) => (false, Some(err.to_string()), None),
                Err(_) => (false, Some("task execution timed out".into()), None),
            };
            let elapsed = started.elapsed().as_secs_f64();
            let quality = match &outcome {
                Ok(Ok(result)) => self.resolve_quality(result).await,
                _ => 0.0,
            };
            pool.complete_task(instance_id.as_deref(), success, elapsed, quality);
            self.metrics.write().record_task(success, elapsed);

            if success {
                let mut active = self.active.write().await;
                if let Some(exec) = active.get_mut(execution_id) {
                    if let Some(task_exec) = exec.task_executions.get_mut(assignment_id) {
                        task_exec.status = TaskExecutionStatus::Completed;
                        task_exec.completed_at = Some(chrono::Utc::now());
                    }
                    exec.active_tasks.remove(assignment_id);
                    exec.failed_tasks.remove(assignment_id);
                    exec.completed_tasks.insert(assignment_id.to_string());
                    exec.partial_results.remove(assignment_id);
                }
                return Ok(());
            }

            let error = error.unwrap_or_else(|| "unknown failure".into());
            let retry_count = {
                let mut active = self.active.write().await;
                // Same race as above: the execution may already be gone from
                // `active` (cancelled/rolled back) by the time this failed
                // dispatch gets here.
                let Some(exec) = active.get_mut(execution_id) else { return Ok(()) };
                if let Some(task_exec) = exec.task_executions.get_mut(assignment_id) {
                    task_exec.error = Some(error.clone());
                    if let Ok(Ok(result)) = &outcome {
                        if let Some(partial) = &result.output {
                            exec.partial_results.insert(
                                assignment_id.to_string(),
                                json!({
                                    "task_id": assignment_id,
                                    "result": partial.data,
                                    "preserved_at": chrono::Utc::now(),
                                    "reason": "task failed after producing partial output",
                                }),
                            );
                        }
                    }
                    task_exec.retry_count
                } else {
                    0
                }
            };

            let action = recovery::decide_recovery(retry_count, pool.idle_instance_count() > 0);
            match action {
                RecoveryAction::Retry => {
                    let delay = recovery::backoff_delay(retry_count);
                    self.move_task(execution_id, assignment_id, |exec, id| {
                        if let Some(task_exec) = exec.task_executions.get_mut(id) {
                            task_exec.retry_count += 1;
                            task_exec.status = TaskExecutionStatus::Pending;
                        }
                        exec.active_tasks.remove(id);
                        exec.failed_tasks.remove(id);
                        exec.pending_tasks.insert(id.to_string());
                    })
                    .await;
                    warn!(execution_id, assignment_id, retry_count = retry_count + 1, "retrying task after backoff");
                    tokio::time::sleep(delay).await;
                    self.move_task(execution_id, assignment_id, |exec, id| {
                        exec.pending_tasks.remove(id);
                        exec.failed_tasks.remove(id);
                        exec.active_tasks.insert(id.to_string());
                    })
                    .await;
                    continue;
                }
                RecoveryAction::Reassign => {
                    self.move_task(execution_id, assignment_id, |exec, id| {
                        if let Some(task_exec) = exec.task_executions.get_mut(id) {
                            task_exec.retry_count = 0;
                            task_exec.status = TaskExecutionStatus::InProgress;
                        }
                        exec.failed_tasks.remove(id);
                        exec.active_tasks.insert(id.to_string());
                    })
                    .await;
                    info!(execution_id, assignment_id, agent_type = %agent_type, "reassigning task to a new instance");
                    continue;
                }
                RecoveryAction::Skip => {
                    self.move_task(execution_id, assignment_id, |exec, id| {
                        if let Some(task_exec) = exec.task_executions.get_mut(id) {
                            task_exec.status = TaskExecutionStatus::Cancelled;
                        }
                        exec.active_tasks.remove(id);
                        exec.failed_tasks.insert(id.to_string());
                    })
                    .await;
                    return Ok(());
                }
                RecoveryAction::Abort => {
                    self.move_task(execution_id, assignment_id, |exec, id| {
                        if let Some(task_exec) = exec.task_executions.get_mut(id) {
                            task_exec.status = TaskExecutionStatus::Failed;
                        }
                        exec.active_tasks.remove(id);
                        exec.failed_tasks.insert(id.to_string());
                    })
                    .await;
                    self.record_critical_failure(execution_id, assignment_id, &error).await;
                    self.cancel_remaining(execution_id).await;
                    error!(execution_id, assignment_id, "aborting workflow after exhausting recovery options");
                    return Err(OrchestrationError::Execution(format!(
                        "assignment {assignment_id} failed: {error}"
                    )));
                }
            }
        }
    }

    /// Moves every remaining pending/active task into `failed_tasks` and
    /// marks it cancelled, preserving the disjoint-set invariant when a
    /// critical failure aborts the whole workflow.
    async fn cancel_remaining(&self, execution_id: &str) {
        let mut active = self.active.write().await;
        if let Some(exec) = active.get_mut(execution_id) {
            let remaining: Vec<String> = exec
                .active_tasks
                .iter()
                .chain(exec.pending_tasks.iter())
                .cloned()
                .collect();
            for id in remaining {
                exec.active_tasks.remove(&id);
                exec.pending_tasks.remove(&id);
                exec.failed_tasks.insert(id.clone());
                if let Some(task_exec) = exec.task_executions.get_mut(&id) {
                    task_exec.status = TaskExecutionStatus::Cancelled;
                    task_exec.completed_at = Some(chrono::Utc::now());
                }
            }
        }
    }

    async fn record_critical_failure(&self, execution_id: &str, assignment_id: &str, error: &str) {
        let mut active = self.active.write().await;
        if let Some(exec) = active.get_mut(execution_id) {
            exec.critical_failures.push(json!({
                "assignment_id": assignment_id,
                "error": error,
                "at": chrono::Utc::now(),
                "options": ["abort_workflow", "skip_task", "manual_intervention"],
            }));
        }
    }

    async fn checkpoint(&self, execution_id: &str, phase: &str, description: &str) {
        let mut active = self.active.write().await;
        if let Some(exec) = active.get_mut(execution_id) {
            let checkpoint = Checkpoint {
                id: uuid::Uuid::new_v4().to_string(),
                workflow_id: execution_id.to_string(),
                created_at: chrono::Utc::now(),
                phase: phase.to_string(),
                description: description.to_string(),
                recoverable: !exec.is_terminal(),
                current_step: exec.current_step,
                progress_percentage: exec.progress_percentage,
                snapshot: json!({
                    "phase": phase,
                    "completed_phases": exec.checkpoints.iter().map(|c| c.phase.clone()).collect::<Vec<_>>(),
                    "counts": {
                        "pending": exec.pending_tasks.len(),
                        "active": exec.active_tasks.len(),
                        "completed": exec.completed_tasks.len(),
                        "failed": exec.failed_tasks.len(),
                    },
                }),
            };
            exec.checkpoints.push(checkpoint);
        }
    }

    /// Background monitoring tick: fails executions that exceed the global
    /// timeout, and separately cancels any task that has sat `InProgress`
    /// longer than `task_timeout` — a backstop for a task whose own
    /// `tokio::time::timeout` in `run_one_task` never fired (e.g. the
    /// dispatching worker itself died without unwinding). Errors inside
    /// this loop are logged and swallowed so the monitor itself never
    /// dies; callers should run this in a loop with
    /// [`ExecutorConfig::heartbeat_interval`] between ticks.
    pub async fn monitor_tick(&self) {
        let now = chrono::Utc::now();
        let task_timeout = chrono::Duration::from_std(self.config.task_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let mut active = self.active.write().await;
        for exec in active.values_mut() {
            if let Some(started) = exec.started_at {
                if exec.state == ExecutionState::Running
                    && (now - started) > chrono::Duration::from_std(EXECUTION_TIMEOUT).unwrap()
                {
                    exec.state = ExecutionState::Failed;
                    exec.error_message = Some("execution exceeded the global timeout".into());
                    exec.completed_at = Some(now);
                }
            }

            if exec.is_terminal() {
                continue;
            }

            let active_ids = exec.active_tasks.clone();
            let stale: Vec<String> = exec
                .task_executions
                .iter()
                .filter(|(id, task_exec)| {
                    active_ids.contains(*id)
                        && task_exec.status == TaskExecutionStatus::InProgress
                        && task_exec
                            .started_at
                            .map(|started| (now - started) > task_timeout)
                            .unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect();

            for id in stale {
                warn!(execution_id = %exec.execution_id, assignment_id = %id, "monitor cancelling task stuck in progress past task_timeout");
                if let Some(task_exec) = exec.task_executions.get_mut(&id) {
                    task_exec.status = TaskExecutionStatus::Cancelled;
                    task_exec.completed_at = Some(now);
                    task_exec.error = Some("cancelled by monitor after exceeding task_timeout".into());
                }
                exec.active_tasks.remove(&id);
                exec.pending_tasks.remove(&id);
                exec.failed_tasks.insert(id);
            }
        }
    }
}

