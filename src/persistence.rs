//! Persisted-state envelope: the JSON shape a [`WorkflowExecution`] is
//! serialized into, and a trait so the actual storage backend (filesystem,
//! graph database, ...) stays pluggable and out of scope for this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestrationError;
use crate::workflow::{Checkpoint, WorkflowExecution};

/// The recovery-relevant sub-block of the persisted envelope: checkpoints,
/// partial results, critical failures, rollback info. Named and shaped per
/// spec.md §6's `metadata` object.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedMetadata {
    pub checkpoints: Vec<Checkpoint>,
    pub partial_results: std::collections::HashMap<String, Value>,
    pub critical_failures: Vec<Value>,
    pub rollback_info: Option<Value>,
}

/// Storage-agnostic JSON envelope for one workflow execution's recoverable
/// state, matching spec.md §6's documented shape exactly:
/// `{ execution_id, workflow_id, state, progress_percentage, metadata }`.
/// This is *not* a full serialization of `WorkflowExecution` — it carries
/// only the fields a recovery/observability backend needs, per spec.md
/// framing persistence backends as "the contract a store must meet," not a
/// full-state snapshot format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEnvelope {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub execution_id: String,
    pub workflow_id: String,
    pub state: String,
    pub progress_percentage: f64,
    pub metadata: PersistedMetadata,
}

impl PersistedEnvelope {
    pub fn wrap(execution: &WorkflowExecution) -> Self {
        Self {
            schema_version: 1,
            saved_at: Utc::now(),
            execution_id: execution.execution_id.clone(),
            workflow_id: execution.plan.id.clone(),
            state: format!("{:?}", execution.state),
            progress_percentage: execution.progress_percentage,
            metadata: PersistedMetadata {
                checkpoints: execution.checkpoints.clone(),
                partial_results: execution.partial_results.clone(),
                critical_failures: execution.critical_failures.clone(),
                rollback_info: execution.rollback_info.clone(),
            },
        }
    }
}

/// Storage backend for workflow execution state. Implementations are
/// expected to round-trip a `WorkflowExecution` through [`PersistedEnvelope`]
/// without loss.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save(&self, envelope: &PersistedEnvelope) -> Result<(), OrchestrationError>;
    async fn load(&self, execution_id: &str) -> Result<Option<PersistedEnvelope>, OrchestrationError>;
}

/// In-memory store used by tests and as a default when no durable backend
/// is configured.
pub struct InMemoryStore {
    entries: dashmap::DashMap<String, PersistedEnvelope>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: dashmap::DashMap::new(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn save(&self, envelope: &PersistedEnvelope) -> Result<(), OrchestrationError> {
        self.entries
            .insert(envelope.execution_id.clone(), envelope.clone());
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<PersistedEnvelope>, OrchestrationError> {
        Ok(self.entries.get(execution_id).map(|entry| entry.clone()))
    }
}

/// Filesystem-backed store: one `<execution_id>.json` file per envelope
/// under a configured directory. The concrete shape of the "filesystem
/// JSON" backend spec.md §1 names as an external collaborator, kept
/// behind the same [`PersistenceStore`] contract as [`InMemoryStore`] so a
/// deployment can swap one for the other without touching the executor.
pub struct FilesystemStore {
    dir: std::path::PathBuf,
}

impl FilesystemStore {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, execution_id: &str) -> std::path::PathBuf {
        self.dir.join(format!("{execution_id}.json"))
    }
}

#[async_trait]
impl PersistenceStore for FilesystemStore {
    async fn save(&self, envelope: &PersistedEnvelope) -> Result<(), OrchestrationError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| OrchestrationError::Execution(format!("persistence dir: {err}")))?;
        let body = serde_json::to_vec_pretty(envelope)
            .map_err(|err| OrchestrationError::Execution(format!("serialize envelope: {err}")))?;
        tokio::fs::write(self.path_for(&envelope.execution_id), body)
            .await
            .map_err(|err| OrchestrationError::Execution(format!("write envelope: {err}")))
    }

    async fn load(&self, execution_id: &str) -> Result<Option<PersistedEnvelope>, OrchestrationError> {
        match tokio::fs::read(self.path_for(execution_id)).await {
            Ok(body) => {
                let envelope = serde_json::from_slice(&body)
                    .map_err(|err| OrchestrationError::Execution(format!("deserialize envelope: {err}")))?;
                Ok(Some(envelope))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(OrchestrationError::Execution(format!("read envelope: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;
    use crate::workflow::{AgentAssignment, ExecutionPattern, WorkflowPlan};

    fn sample_execution() -> WorkflowExecution {
        let plan = WorkflowPlan {
            id: "plan-1".into(),
            name: "sample".into(),
            pattern: ExecutionPattern::Sequential,
            assignments: vec![AgentAssignment {
                agent_type: crate::task::AgentType::Implementation,
                task_type: "implementation_task".into(),
                input: serde_json::json!({}),
                priority: TaskPriority::Medium,
                depends_on: vec![],
                id: "a1".into(),
            }],
        };
        WorkflowExecution::new(plan)
    }

    #[tokio::test]
    async fn round_trips_through_json() {
        let store = InMemoryStore::new();
        let mut execution = sample_execution();
        execution.checkpoints.push(Checkpoint {
            id: "cp-1".into(),
            workflow_id: execution.execution_id.clone(),
            created_at: Utc::now(),
            phase: "workflow_started".into(),
            description: "workflow started".into(),
            recoverable: true,
            current_step: 0,
            progress_percentage: 0.0,
            snapshot: serde_json::json!({"phase": "workflow_started", "completed_phases": [], "counts": {"pending": 1, "active": 0, "completed": 0, "failed": 0}}),
        });
        execution
            .partial_results
            .insert("a1".into(), serde_json::json!({"note": "partial"}));

        let envelope = PersistedEnvelope::wrap(&execution);
        let id = envelope.execution_id.clone();
        store.save(&envelope).await.unwrap();

        let json = serde_json::to_string(&envelope).unwrap();
        let reparsed: PersistedEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed.execution_id, id);
        assert_eq!(reparsed.metadata.checkpoints, envelope.metadata.checkpoints);
        assert_eq!(reparsed.metadata.partial_results, envelope.metadata.partial_results);

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, id);
    }

    #[tokio::test]
    async fn filesystem_store_round_trips_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        let execution = sample_execution();
        let envelope = PersistedEnvelope::wrap(&execution);
        let id = envelope.execution_id.clone();

        assert!(store.load(&id).await.unwrap().is_none());

        store.save(&envelope).await.unwrap();
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, id);
        assert_eq!(loaded.workflow_id, envelope.workflow_id);

        assert!(store.load("no-such-execution").await.unwrap().is_none());
    }
}
