//! Agent pool: load balancing, auto-scaling, and health monitoring over a
//! set of same-typed [`AgentInstance`]s.
//!
//! Ported from the original system's `EnhancedAgentPool` /
//! `EnhancedLoadBalancer`. Formulas and thresholds below are taken
//! directly from that implementation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::{AgentConfig, AgentInstance, AgentState, RoleHandler};
use crate::error::OrchestrationError;
use crate::task::{AgentResult, AgentTask, AgentType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    Random,
    WeightedRoundRobin,
    LeastConnections,
    ResponseTime,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        LoadBalancingStrategy::LeastLoaded
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalingThresholds {
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub min_instances: usize,
    pub max_instances: usize,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub queue_threshold: usize,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self {
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            min_instances: 1,
            max_instances: 10,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
            queue_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub agent_type: String,
    pub total_instances: usize,
    pub idle_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub queued_tasks: usize,
    pub current_load: f64,
    pub peak_load: f64,
    pub success_rate: f64,
    pub average_response_time_secs: f64,
    pub average_quality: f64,
    pub strategy: LoadBalancingStrategy,
}

/// Detail row for one instance, as returned by [`AgentPool::instance_details`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDetail {
    pub instance_id: String,
    pub state: AgentState,
    pub current_task_id: Option<String>,
    pub queued_tasks: usize,
    pub tasks_completed: u64,
    pub success_rate: f64,
    pub average_execution_time_secs: f64,
    pub quality_score: f64,
    pub uptime_secs: i64,
}

struct QueuedTask {
    task: AgentTask,
    reply: tokio::sync::oneshot::Sender<AgentResult>,
}

struct Metrics {
    total_requests: u64,
    total_successes: u64,
    total_response_time_secs: f64,
    total_quality: f64,
    peak_load: f64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            total_requests: 0,
            total_successes: 0,
            total_response_time_secs: 0.0,
            total_quality: 0.0,
            peak_load: 0.0,
        }
    }

    fn record(&mut self, success: bool, response_time_secs: f64, quality: f64) {
        self.total_requests += 1;
        if success {
            self.total_successes += 1;
        }
        self.total_response_time_secs += response_time_secs;
        self.total_quality += crate::task::clamp_unit(quality);
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.total_successes as f64 / self.total_requests as f64
        }
    }

    fn average_response_time(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_response_time_secs / self.total_requests as f64
        }
    }

    fn average_quality(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_quality / self.total_requests as f64
        }
    }
}

/// Manages a homogeneous set of [`AgentInstance`]s for one [`AgentType`].
pub struct AgentPool {
    agent_type: AgentType,
    handler: Arc<dyn RoleHandler>,
    instances: RwLock<Vec<Arc<AgentInstance>>>,
    queued_tasks: RwLock<VecDeque<QueuedTask>>,
    thresholds: RwLock<ScalingThresholds>,
    strategy: RwLock<LoadBalancingStrategy>,
    metrics: RwLock<Metrics>,
    round_robin_cursor: RwLock<usize>,
    last_scale_up: RwLock<Option<tokio::time::Instant>>,
    last_scale_down: RwLock<Option<tokio::time::Instant>>,
    scaling_in_progress: RwLock<bool>,
}

impl AgentPool {
    pub fn new(agent_type: AgentType, handler: Arc<dyn RoleHandler>, thresholds: ScalingThresholds) -> Arc<Self> {
        Self::with_model_assignment(agent_type, handler, thresholds, None)
    }

    /// Like [`AgentPool::new`], but caps `thresholds.max_instances` against
    /// an opaque [`ModelAssignment`]'s `max_concurrent_instances` if one is
    /// supplied, matching the original pool's `model_assignment.max_concurrent_instances`
    /// clamp. The assignment itself is never otherwise interpreted.
    pub fn with_model_assignment(
        agent_type: AgentType,
        handler: Arc<dyn RoleHandler>,
        mut thresholds: ScalingThresholds,
        model_assignment: Option<crate::task::ModelAssignment>,
    ) -> Arc<Self> {
        if let Some(assignment) = &model_assignment {
            thresholds.max_instances = thresholds.max_instances.min(assignment.max_concurrent_instances);
        }
        let pool = Arc::new(Self {
            agent_type: agent_type.clone(),
            handler,
            instances: RwLock::new(Vec::new()),
            queued_tasks: RwLock::new(VecDeque::new()),
            thresholds: RwLock::new(thresholds),
            strategy: RwLock::new(LoadBalancingStrategy::default()),
            metrics: RwLock::new(Metrics::new()),
            round_robin_cursor: RwLock::new(0),
            last_scale_up: RwLock::new(None),
            last_scale_down: RwLock::new(None),
            scaling_in_progress: RwLock::new(false),
        });
        for _ in 0..thresholds.min_instances {
            pool.spawn_instance();
        }
        pool
    }

    fn spawn_instance(&self) -> Arc<AgentInstance> {
        let config = AgentConfig::new(self.agent_type.clone());
        let instance = AgentInstance::spawn(config, self.handler.clone());
        self.instances.write().push(instance.clone());
        instance
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        *self.strategy.write() = strategy;
    }

    pub fn update_thresholds(&self, thresholds: ScalingThresholds) {
        *self.thresholds.write() = thresholds;
    }

    /// Assigns a task to an idle instance if one is available, otherwise
    /// queues it and evaluates whether to scale up.
    pub async fn assign_task(self: &Arc<Self>, task: AgentTask) -> Result<tokio::sync::oneshot::Receiver<AgentResult>, OrchestrationError> {
        if let Some(instance) = self.select_idle_instance() {
            return instance.enqueue(task);
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queued_tasks.write().push_back(QueuedTask { task, reply: tx });
        self.evaluate_scaling().await;
        Ok(rx)
    }

    /// Called by the caller (typically the workflow executor) when a task
    /// finishes. Records the outcome against the pool metrics and, if the
    /// pool queue is non-empty and `instance_id` is now idle, hands it the
    /// next queued task (falling back to any idle instance otherwise) so
    /// queued work is never stranded.
    pub fn complete_task(&self, instance_id: Option<&str>, success: bool, response_time_secs: f64, quality: f64) {
        self.metrics.write().record(success, response_time_secs, quality);
        self.dispatch_next_queued(instance_id);
    }

    /// Hands one queued task (if any) to `preferred` when it exists (a
    /// just-spawned or just-freed instance accepts an enqueue the moment it
    /// exists, whether or not its worker has flipped to READY yet), or to
    /// any idle instance otherwise. Ported from
    /// `EnhancedAgentPool.complete_task` and the tail of `_scale_up`, both
    /// of which move exactly one queued task per call.
    fn dispatch_next_queued(&self, preferred: Option<&str>) {
        let target = preferred
            .and_then(|id| self.instances.read().iter().find(|i| i.id == id).cloned())
            .or_else(|| self.instances.read().iter().find(|i| i.is_ready()).cloned());

        let Some(instance) = target else { return };
        let Some(queued) = self.queued_tasks.write().pop_front() else { return };

        match instance.enqueue(queued.task) {
            Ok(mut receiver) => {
                let reply = queued.reply;
                tokio::spawn(async move {
                    if let Ok(result) = (&mut receiver).await {
                        let _ = reply.send(result);
                    }
                });
            }
            Err(err) => {
                warn!(instance_id = %instance.id, %err, "failed to dispatch queued task to idle instance");
            }
        }
    }

    fn select_idle_instance(&self) -> Option<Arc<AgentInstance>> {
        let instances = self.instances.read();
        let idle: Vec<&Arc<AgentInstance>> = instances
            .iter()
            .filter(|i| matches!(i.state(), AgentState::Ready))
            .collect();
        if idle.is_empty() {
            return None;
        }
        let chosen = match *self.strategy.read() {
            LoadBalancingStrategy::RoundRobin => {
                let mut cursor = self.round_robin_cursor.write();
                let pick = idle[*cursor % idle.len()];
                *cursor = cursor.wrapping_add(1);
                pick
            }
            LoadBalancingStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..idle.len());
                idle[idx]
            }
            LoadBalancingStrategy::LeastLoaded => idle
                .iter()
                .min_by(|a, b| instance_load(a).partial_cmp(&instance_load(b)).unwrap())
                .copied()
                .unwrap(),
            LoadBalancingStrategy::LeastConnections => idle
                .iter()
                .min_by_key(|i| i.queue_len())
                .copied()
                .unwrap(),
            LoadBalancingStrategy::ResponseTime => idle
                .iter()
                .min_by(|a, b| {
                    a.performance()
                        .average_execution_time_secs
                        .partial_cmp(&b.performance().average_execution_time_secs)
                        .unwrap()
                })
                .copied()
                .unwrap(),
            LoadBalancingStrategy::WeightedRoundRobin => {
                let weights: Vec<f64> = idle.iter().map(|i| weighted_score(i)).collect();
                let total_weight: f64 = weights.iter().sum();
                if total_weight <= 0.0 {
                    let mut cursor = self.round_robin_cursor.write();
                    let pick = idle[*cursor % idle.len()];
                    *cursor = cursor.wrapping_add(1);
                    pick
                } else {
                    let r = rand::thread_rng().gen_range(0.0..total_weight);
                    let mut cumulative = 0.0;
                    let mut chosen = *idle.last().unwrap();
                    for (candidate, weight) in idle.iter().zip(weights.iter()) {
                        cumulative += weight;
                        if r <= cumulative {
                            chosen = *candidate;
                            break;
                        }
                    }
                    chosen
                }
            }
        };
        Some(chosen.clone())
    }

    pub fn status(&self) -> PoolStatus {
        let instances = self.instances.read();
        let total = instances.len();
        let idle = instances.iter().filter(|i| i.is_ready()).count();
        let busy = instances.iter().filter(|i| i.is_busy()).count();
        let failed = instances
            .iter()
            .filter(|i| i.state() == AgentState::Error)
            .count();
        let current_load = if total > 0 { busy as f64 / total as f64 } else { 0.0 };
        let mut metrics = self.metrics.write();
        if current_load > metrics.peak_load {
            metrics.peak_load = current_load;
        }
        PoolStatus {
            agent_type: self.agent_type.to_string(),
            total_instances: total,
            idle_instances: idle,
            busy_instances: busy,
            failed_instances: failed,
            queued_tasks: self.queued_tasks.read().len(),
            current_load,
            peak_load: metrics.peak_load,
            success_rate: metrics.success_rate(),
            average_response_time_secs: metrics.average_response_time(),
            average_quality: metrics.average_quality(),
            strategy: *self.strategy.read(),
        }
    }

    pub fn idle_instance_count(&self) -> usize {
        self.instances.read().iter().filter(|i| i.is_ready()).count()
    }

    /// Per-instance detail listing beyond the pool-wide aggregate in
    /// [`AgentPool::status`], ported from `EnhancedAgentPool.get_instance_details`.
    pub fn instance_details(&self) -> Vec<InstanceDetail> {
        self.instances
            .read()
            .iter()
            .map(|instance| {
                let status = instance.status();
                let perf = instance.performance();
                InstanceDetail {
                    instance_id: status.instance_id,
                    state: status.state,
                    current_task_id: status.current_task_id,
                    queued_tasks: status.queue_depth,
                    tasks_completed: perf.tasks_completed,
                    success_rate: perf.success_rate,
                    average_execution_time_secs: perf.average_execution_time_secs,
                    quality_score: perf.average_quality,
                    uptime_secs: status.uptime_secs,
                }
            })
            .collect()
    }

    /// Periodic health check: evicts failed instances and refills the pool
    /// to `min_instances`. Ported from `_handle_failed_instance`, adapted to
    /// this crate's channel-per-task redesign (see DESIGN.md): each
    /// enqueued task's result channel is owned by its original caller, not
    /// the pool, so a crashed instance's in-flight and locally-queued work
    /// surfaces to the executor as a dropped-channel `Execution` error and
    /// is already retried/reassigned there — `_handle_failed_instance`'s
    /// explicit requeue onto the pool queue would just dispatch duplicate,
    /// unconsumed work under this design.
    pub fn check_health(&self) {
        let failed: Vec<Arc<AgentInstance>> = self
            .instances
            .read()
            .iter()
            .filter(|i| i.state() == AgentState::Error)
            .cloned()
            .collect();

        for instance in failed {
            let (current, pending) = instance.drain_for_recovery();
            warn!(
                agent_id = %instance.id,
                abandoned_current = current.is_some(),
                abandoned_queued = pending.len(),
                "removing failed instance from pool"
            );
            self.instances.write().retain(|i| i.id != instance.id);
        }

        let thresholds = *self.thresholds.read();
        while self.instances.read().len() < thresholds.min_instances {
            self.spawn_instance();
        }
        self.dispatch_next_queued(None);
    }

    /// Reactive auto-scaling: compares current load and queue depth against
    /// the configured thresholds, respecting cooldowns.
    pub async fn evaluate_scaling(&self) {
        if *self.scaling_in_progress.read() {
            return;
        }
        let status = self.status();
        let thresholds = *self.thresholds.read();
        let now = tokio::time::Instant::now();

        let can_scale_up = self
            .last_scale_up
            .read()
            .map(|t| now.duration_since(t) >= thresholds.scale_up_cooldown)
            .unwrap_or(true);
        let can_scale_down = self
            .last_scale_down
            .read()
            .map(|t| now.duration_since(t) >= thresholds.scale_down_cooldown)
            .unwrap_or(true);

        let should_scale_up = can_scale_up
            && status.total_instances < thresholds.max_instances
            && (status.current_load >= thresholds.scale_up_threshold
                || status.queued_tasks >= thresholds.queue_threshold);

        let should_scale_down = can_scale_down
            && status.total_instances > thresholds.min_instances
            && status.current_load <= thresholds.scale_down_threshold
            && status.queued_tasks == 0;

        if should_scale_up {
            *self.scaling_in_progress.write() = true;
            info!(agent_type = %self.agent_type, "scaling up pool");
            let instance = self.spawn_instance();
            self.dispatch_next_queued(Some(&instance.id));
            *self.last_scale_up.write() = Some(now);
            *self.scaling_in_progress.write() = false;
        } else if should_scale_down {
            *self.scaling_in_progress.write() = true;
            info!(agent_type = %self.agent_type, "scaling down pool");
            if let Some(instance) = self.select_idle_instance() {
                self.instances.write().retain(|i| i.id != instance.id);
                instance.cleanup().await;
            }
            *self.last_scale_down.write() = Some(now);
            *self.scaling_in_progress.write() = false;
        }
    }

    /// Operator override: clamps the requested size into
    /// `[min_instances, max_instances]`, matching the original system's
    /// observed clamp-rather-than-reject behaviour.
    pub async fn force_scale(&self, target: usize) {
        let thresholds = *self.thresholds.read();
        let target = target.clamp(thresholds.min_instances, thresholds.max_instances);
        let current = self.instances.read().len();
        if target > current {
            for _ in current..target {
                self.spawn_instance();
            }
        } else if target < current {
            let to_remove = current - target;
            let mut removed = 0;
            let idle_ids: Vec<String> = self
                .instances
                .read()
                .iter()
                .filter(|i| i.is_ready())
                .map(|i| i.id.clone())
                .take(to_remove)
                .collect();
            for id in idle_ids {
                if let Some(instance) = self.instances.write().iter().find(|i| i.id == id).cloned() {
                    self.instances.write().retain(|i| i.id != id);
                    instance.cleanup().await;
                    removed += 1;
                }
            }
            if removed < to_remove {
                warn!(agent_type = %self.agent_type, requested = to_remove, actual = removed, "force_scale could not remove enough idle instances");
            }
        }
    }

    pub async fn cleanup(&self) {
        let instances: Vec<Arc<AgentInstance>> = self.instances.write().drain(..).collect();
        for instance in instances {
            instance.cleanup().await;
        }
    }
}

/// Builds one pool per default role handler, all sharing the same scaling
/// thresholds. Convenient for tests and the standalone CLI; production
/// deployments typically register a custom handler per role instead.
pub fn build_default_pools(thresholds: ScalingThresholds) -> std::collections::HashMap<AgentType, Arc<AgentPool>> {
    crate::agent::default_handlers()
        .into_iter()
        .map(|handler| {
            let agent_type = handler.agent_type();
            (agent_type.clone(), AgentPool::new(agent_type, handler, thresholds))
        })
        .collect()
}

/// Ported from `_calculate_instance_load`: current task, queue depth, and
/// the instance's own resource utilization each contribute.
fn instance_load(instance: &Arc<AgentInstance>) -> f64 {
    let busy = if instance.is_busy() { 1.0 } else { 0.0 };
    busy + instance.queue_len() as f64 * 0.5 + instance.performance().resource_utilization
}

/// Ported from `_weighted_round_robin_selection`'s per-instance weight:
/// success rate, quality, and free capacity (`1 - resource_utilization`),
/// floored at 0.1 so an instance is never fully excluded from selection.
fn weighted_score(instance: &Arc<AgentInstance>) -> f64 {
    let perf = instance.performance();
    (perf.success_rate * 0.4 + perf.average_quality * 0.3 + (1.0 - perf.resource_utilization) * 0.3).max(0.1)
}
