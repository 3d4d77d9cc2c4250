//! Specialized-agent runtime: a single instance's state machine, local
//! priority queue, and worker loop.
//!
//! Ported from the original system's `SpecializedAgent` base class. The
//! blocking-thread-plus-`queue.PriorityQueue` worker loop becomes one Tokio
//! task per instance draining an `mpsc` channel into a `priority_queue`
//! (the same crate the teacher's own workflow queue is built on), so the
//! same priority/FIFO ordering holds without a dedicated OS thread per
//! agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, OrchestrationError};
use crate::task::{AgentResult, AgentTask, AgentType, ModelAssignment};

/// Lifecycle states a specialized agent instance moves through. Mirrors
/// the original `AgentState` enum name for name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
    Error,
    ShuttingDown,
    Terminated,
}

/// Implements the role-specific step of task execution. One implementation
/// per [`AgentType`], registered with the pool at construction time.
///
/// The default implementations shipped in this crate return deterministic
/// placeholder results (mirroring the mocked behaviour of the system this
/// was ported from) so the runtime is exercisable standalone; real
/// deployments register their own handlers for the roles they care about.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    fn agent_type(&self) -> AgentType;

    /// Cheap pre-flight check: is this task appropriate for this role.
    fn validate_task(&self, task: &AgentTask) -> bool;

    async fn execute(&self, task: &AgentTask) -> Result<AgentResult, AgentError>;
}

/// Monotonic id distinguishing queue items that happen to share a priority
/// and enqueue timestamp; only used for the `Hash`/`Eq` identity
/// `priority_queue::PriorityQueue` needs for its internal index, never
/// compared for ordering.
static QUEUE_ITEM_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

struct QueueItem {
    id: u64,
    enqueued_at: DateTime<Utc>,
    task: AgentTask,
    callback: Option<oneshot::Sender<AgentResult>>,
}

impl QueueItem {
    fn new(task: AgentTask, callback: Option<oneshot::Sender<AgentResult>>) -> Self {
        Self {
            id: QUEUE_ITEM_SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
            enqueued_at: Utc::now(),
            task,
            callback,
        }
    }

    fn priority(&self) -> QueuePriority {
        queue_priority(self.task.priority, self.enqueued_at)
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for QueueItem {}

impl std::hash::Hash for QueueItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Ordering key fed to `PriorityQueue`: lower `TaskPriority` values (CRITICAL
/// = 1) and earlier enqueue timestamps must pop first, but
/// `priority_queue::PriorityQueue` always pops its maximum, so both
/// components are negated — the resulting tuple's natural `Ord` then pops
/// exactly the CRITICAL-first, FIFO-on-ties order spec.md §4.2 describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueuePriority(i64, i64);

fn queue_priority(priority: crate::task::TaskPriority, enqueued_at: DateTime<Utc>) -> QueuePriority {
    QueuePriority(
        -(priority as i64),
        -enqueued_at.timestamp_nanos_opt().unwrap_or(0),
    )
}

#[derive(Debug, Clone, Default)]
pub struct PerformanceSnapshot {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_execution_time_secs: f64,
    pub average_quality: f64,
    pub success_rate: f64,
    pub resource_utilization: f64,
}

struct PerformanceTracker {
    tasks_completed: u64,
    tasks_failed: u64,
    total_execution_time_secs: f64,
    quality_scores: Vec<f64>,
    resource_utilization: f64,
}

impl PerformanceTracker {
    fn new() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            total_execution_time_secs: 0.0,
            quality_scores: Vec::new(),
            resource_utilization: 0.0,
        }
    }

    /// Records one completed task cycle. `resource_utilization` is the
    /// instance's local queue occupancy (`queue_len / max_queue_depth`) at
    /// the moment the task was picked up — the only load signal available
    /// without an external resource probe, standing in for the original's
    /// externally-reported CPU/memory gauge of the same name.
    fn record(&mut self, execution_time_secs: f64, success: bool, quality: f64, resource_utilization: f64) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.total_execution_time_secs += execution_time_secs;
        self.quality_scores.push(quality);
        if self.quality_scores.len() > 100 {
            self.quality_scores.remove(0);
        }
        self.resource_utilization = resource_utilization.clamp(0.0, 1.0);
    }

    fn snapshot(&self) -> PerformanceSnapshot {
        let total = self.tasks_completed + self.tasks_failed;
        let success_rate = if total > 0 {
            self.tasks_completed as f64 / total as f64
        } else {
            1.0
        };
        let average_execution_time_secs = if total > 0 {
            self.total_execution_time_secs / total as f64
        } else {
            0.0
        };
        let average_quality = if self.quality_scores.is_empty() {
            0.0
        } else {
            self.quality_scores.iter().sum::<f64>() / self.quality_scores.len() as f64
        };
        PerformanceSnapshot {
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            average_execution_time_secs,
            average_quality,
            success_rate,
            resource_utilization: self.resource_utilization,
        }
    }
}

fn queue_utilization(queue_len: usize, max_queue_depth: usize) -> f64 {
    (queue_len as f64 / max_queue_depth.max(1) as f64).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_type: AgentType,
    pub model_assignment: Option<ModelAssignment>,
    pub max_queue_depth: usize,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub idle_timeout: Duration,
}

impl AgentConfig {
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            model_assignment: None,
            max_queue_depth: 256,
            restart_count: 0,
            max_restarts: 3,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub instance_id: String,
    pub state: AgentState,
    pub queue_depth: usize,
    pub current_task_id: Option<String>,
    pub uptime_secs: i64,
}

enum Command {
    Enqueue(QueueItem),
    Shutdown,
}

/// A single running instance of a specialized agent.
pub struct AgentInstance {
    pub id: String,
    config: AgentConfig,
    handler: Arc<dyn RoleHandler>,
    state: Arc<RwLock<AgentState>>,
    performance: Arc<RwLock<PerformanceTracker>>,
    current_task: Arc<RwLock<Option<AgentTask>>>,
    pending_snapshot: Arc<RwLock<Vec<AgentTask>>>,
    created_at: DateTime<Utc>,
    command_tx: mpsc::UnboundedSender<Command>,
    queue_depth: Arc<std::sync::atomic::AtomicUsize>,
}

impl AgentInstance {
    /// Spawns the worker task and transitions the instance to `Ready`.
    pub fn spawn(config: AgentConfig, handler: Arc<dyn RoleHandler>) -> Arc<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(AgentState::Initializing));
        let performance = Arc::new(RwLock::new(PerformanceTracker::new()));
        let current_task = Arc::new(RwLock::new(None));
        let pending_snapshot = Arc::new(RwLock::new(Vec::new()));
        let queue_depth = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let instance = Arc::new(Self {
            id: id.clone(),
            config,
            handler: handler.clone(),
            state: state.clone(),
            performance: performance.clone(),
            current_task: current_task.clone(),
            pending_snapshot: pending_snapshot.clone(),
            created_at: Utc::now(),
            command_tx,
            queue_depth: queue_depth.clone(),
        });

        let max_queue_depth = instance.config.max_queue_depth;
        tokio::spawn(worker_loop(
            id,
            command_rx,
            handler,
            state,
            performance,
            current_task,
            pending_snapshot,
            queue_depth,
            max_queue_depth,
        ));

        instance
    }

    /// Queue a task for asynchronous execution; the returned receiver
    /// resolves once the task completes or fails.
    pub fn enqueue(
        &self,
        task: AgentTask,
    ) -> Result<oneshot::Receiver<AgentResult>, OrchestrationError> {
        if self.queue_depth.load(std::sync::atomic::Ordering::SeqCst) >= self.config.max_queue_depth {
            return Err(OrchestrationError::Capacity(format!(
                "agent {} queue is full",
                self.id
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.pending_snapshot.write().push(task.clone());
        let item = QueueItem::new(task, Some(tx));
        self.queue_depth.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.command_tx
            .send(Command::Enqueue(item))
            .map_err(|_| OrchestrationError::State(format!("agent {} worker has shut down", self.id)))?;
        Ok(rx)
    }

    /// Runs one task immediately on the calling task, bypassing the local
    /// queue entirely. Distinct from [`Self::enqueue`]: no ordering, no
    /// callback channel, and a task the role validator rejects is surfaced
    /// as an error rather than queued and later failed.
    pub async fn execute(&self, mut task: AgentTask) -> Result<AgentResult, OrchestrationError> {
        let state = self.state();
        if !matches!(state, AgentState::Ready | AgentState::Busy) {
            return Err(OrchestrationError::State(format!(
                "agent {} is {:?}, cannot execute a task synchronously",
                self.id, state
            )));
        }
        if !self.handler.validate_task(&task) {
            return Err(OrchestrationError::Validation(format!(
                "task type {} is not valid for agent {}",
                task.task_type, self.id
            )));
        }

        let was_ready = state == AgentState::Ready;
        if was_ready {
            *self.state.write() = AgentState::Busy;
        }
        let previous_current = self.current_task.write().replace(task.clone());
        let _ = task.start();

        let started = std::time::Instant::now();
        let outcome = std::panic::AssertUnwindSafe(self.handler.execute(&task))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        let (mut result, crashed) = match outcome {
            Ok(Ok(result)) => {
                task.complete().ok();
                (result, false)
            }
            Ok(Err(err)) => {
                task.fail();
                (
                    AgentResult::failure(&task, self.id.clone(), err.to_string(), elapsed),
                    false,
                )
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "role handler panicked".to_string());
                error!(agent_id = %self.id, task_id = %task.id, %message, "role handler crashed during synchronous execute");
                task.fail();
                (
                    AgentResult::failure(&task, self.id.clone(), message, elapsed),
                    true,
                )
            }
        };
        // The handler is shared across instances and may hardcode its own
        // placeholder id; the producing instance's real id always wins.
        result.instance_id = self.id.clone();

        let utilization = queue_utilization(self.queue_len(), self.config.max_queue_depth);
        self.performance
            .write()
            .record(elapsed, result.is_success(), result.metadata.quality, utilization);

        *self.current_task.write() = previous_current;
        if crashed {
            *self.state.write() = AgentState::Error;
        } else if was_ready {
            *self.state.write() = AgentState::Ready;
        }
        Ok(result)
    }

    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == AgentState::Ready
    }

    pub fn is_busy(&self) -> bool {
        self.state() == AgentState::Busy
    }

    pub fn has_failed(&self) -> bool {
        self.state() == AgentState::Error
    }

    pub fn queue_len(&self) -> usize {
        self.queue_depth.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn performance(&self) -> PerformanceSnapshot {
        self.performance.read().snapshot()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            instance_id: self.id.clone(),
            state: self.state(),
            queue_depth: self.queue_len(),
            current_task_id: self.current_task.read().as_ref().map(|t| t.id.clone()),
            uptime_secs: (Utc::now() - self.created_at).num_seconds(),
        }
    }

    /// Takes the instance's in-flight task (if any) plus everything still
    /// sitting in its local queue, for a pool's health monitor to requeue
    /// elsewhere. Leaves the instance with nothing pending.
    pub fn drain_for_recovery(&self) -> (Option<AgentTask>, Vec<AgentTask>) {
        let current = self.current_task.write().take();
        let pending = std::mem::take(&mut *self.pending_snapshot.write());
        self.queue_depth.store(0, std::sync::atomic::Ordering::SeqCst);
        (current, pending)
    }

    /// Requests a graceful shutdown. Idempotent once already terminated.
    pub async fn cleanup(&self) {
        if self.state() == AgentState::Terminated {
            warn!(agent_id = %self.id, "cleanup called on already-terminated agent");
            return;
        }
        *self.state.write() = AgentState::ShuttingDown;
        let _ = self.command_tx.send(Command::Shutdown);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while self.current_task.read().is_some() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        *self.state.write() = AgentState::Terminated;
    }
}

async fn worker_loop(
    instance_id: String,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    handler: Arc<dyn RoleHandler>,
    state: Arc<RwLock<AgentState>>,
    performance: Arc<RwLock<PerformanceTracker>>,
    current_task: Arc<RwLock<Option<AgentTask>>>,
    pending_snapshot: Arc<RwLock<Vec<AgentTask>>>,
    queue_depth: Arc<std::sync::atomic::AtomicUsize>,
    max_queue_depth: usize,
) {
    *state.write() = AgentState::Ready;
    info!(agent_id = %instance_id, agent_type = %handler.agent_type(), "agent ready");

    let mut queue: PriorityQueue<QueueItem, QueuePriority> = PriorityQueue::new();

    loop {
        if queue.is_empty() {
            match command_rx.recv().await {
                Some(Command::Enqueue(item)) => {
                    let priority = item.priority();
                    queue.push(item, priority);
                }
                Some(Command::Shutdown) | None => break,
            }
        }
        // Drain any further pending commands without blocking so a burst
        // of enqueues is reordered by priority before execution starts.
        while let Ok(cmd) = command_rx.try_recv() {
            match cmd {
                Command::Enqueue(item) => {
                    let priority = item.priority();
                    queue.push(item, priority);
                }
                Command::Shutdown => {
                    queue.clear();
                    *state.write() = AgentState::Terminated;
                    return;
                }
            }
        }

        let Some((mut item, _priority)) = queue.pop() else { continue };
        let remaining = queue_depth.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) - 1;
        pending_snapshot.write().retain(|t| t.id != item.task.id);
        *state.write() = AgentState::Busy;
        let _ = item.task.start();
        *current_task.write() = Some(item.task.clone());

        let started = std::time::Instant::now();
        let validated = handler.validate_task(&item.task);
        let outcome = if validated {
            std::panic::AssertUnwindSafe(handler.execute(&item.task))
                .catch_unwind()
                .await
        } else {
            Ok(Err(AgentError::Execution {
                agent_id: instance_id.clone(),
                task_id: item.task.id.clone(),
                message: format!("task type {} is not valid for this agent", item.task.task_type),
            }))
        };

        let mut result = match outcome {
            Ok(Ok(result)) => {
                item.task.complete().ok();
                result
            }
            Ok(Err(err)) => {
                error!(agent_id = %instance_id, task_id = %item.task.id, error = %err, "task execution raised");
                item.task.fail();
                AgentResult::failure(&item.task, instance_id.clone(), err.to_string(), started.elapsed().as_secs_f64())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "role handler panicked".to_string());
                error!(agent_id = %instance_id, task_id = %item.task.id, %message, "role handler crashed, instance entering ERROR state");
                item.task.fail();
                let mut result = AgentResult::failure(&item.task, instance_id.clone(), message, started.elapsed().as_secs_f64());
                result.instance_id = instance_id.clone();
                // Leave the crashed task recorded as current so the pool's
                // health monitor can recover it; the worker exits here and
                // never clears `current_task`.
                *state.write() = AgentState::Error;
                if let Some(callback) = item.callback.take() {
                    let _ = callback.send(result);
                }
                return;
            }
        };
        // The handler is shared across instances and may hardcode its own
        // placeholder id; the producing instance's real id always wins.
        result.instance_id = instance_id.clone();

        let elapsed = started.elapsed().as_secs_f64();
        let utilization = queue_utilization(remaining, max_queue_depth);
        performance
            .write()
            .record(elapsed, result.is_success(), result.metadata.quality, utilization);

        *current_task.write() = None;
        *state.write() = AgentState::Ready;

        if let Some(callback) = item.callback.take() {
            let _ = callback.send(result);
        }

        debug!(agent_id = %instance_id, "task cycle complete");
    }

    *state.write() = AgentState::Terminated;
}

/// Default placeholder handler: returns a deterministic mocked result for
/// any task whose `task_type` loosely matches the role's vocabulary. Mirrors
/// the original system's per-role agents, which likewise return mocked
/// output; real model invocation is left as an external hook.
pub struct PlaceholderHandler {
    agent_type: AgentType,
    keywords: Vec<&'static str>,
}

impl PlaceholderHandler {
    pub fn new(agent_type: AgentType, keywords: Vec<&'static str>) -> Self {
        Self { agent_type, keywords }
    }
}

#[async_trait]
impl RoleHandler for PlaceholderHandler {
    fn agent_type(&self) -> AgentType {
        self.agent_type.clone()
    }

    fn validate_task(&self, task: &AgentTask) -> bool {
        let lowered = task.task_type.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k))
    }

    async fn execute(&self, task: &AgentTask) -> Result<AgentResult, AgentError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let output = crate::task::TaskOutput::new(
            serde_json::json!({ "note": format!("placeholder output for {}", task.task_type) }),
            crate::task::DataFormat::Json,
            0.75,
        );
        Ok(AgentResult::success(task, "placeholder", output, "placeholder-model", 0.05))
    }
}

/// Builds the default dispatch table used when a deployment does not
/// register its own [`RoleHandler`] implementations.
pub fn default_handlers() -> Vec<Arc<dyn RoleHandler>> {
    vec![
        Arc::new(PlaceholderHandler::new(AgentType::Pm, vec!["plan", "roadmap", "requirement"])),
        Arc::new(PlaceholderHandler::new(AgentType::Ba, vec!["analysis", "story", "criteria"])),
        Arc::new(PlaceholderHandler::new(AgentType::Sa, vec!["architecture", "design", "schema"])),
        Arc::new(PlaceholderHandler::new(AgentType::Research, vec!["research", "investigate", "survey"])),
        Arc::new(PlaceholderHandler::new(AgentType::QualityJudge, vec!["review", "judge", "quality"])),
        Arc::new(PlaceholderHandler::new(
            AgentType::Implementation,
            vec!["implementation", "coding", "code_generation", "refactoring", "testing", "validation"],
        )),
    ]
}
