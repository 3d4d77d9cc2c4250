//! A self-contained [`AgentTransport`] that dispatches directly into this
//! process's agent pools, for running the engine standalone (tests, the
//! `orchestratorctl` binary) without a real external agent process on the
//! other end.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OrchestrationError;
use crate::interfaces::AgentTransport;
use crate::pool::AgentPool;
use crate::task::{AgentResult, AgentTask, AgentType};

pub struct LocalPoolTransport {
    pools: HashMap<AgentType, Arc<AgentPool>>,
}

impl LocalPoolTransport {
    pub fn new(pools: HashMap<AgentType, Arc<AgentPool>>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl AgentTransport for LocalPoolTransport {
    async fn send_task(&self, task: AgentTask) -> Result<AgentResult, OrchestrationError> {
        let pool = self
            .pools
            .get(&task.agent_type)
            .ok_or_else(|| OrchestrationError::Distribution(format!("no pool for {}", task.agent_type)))?
            .clone();
        let receiver = pool.assign_task(task).await?;
        receiver
            .await
            .map_err(|_| OrchestrationError::Execution("agent instance dropped the result channel".into()))
    }
}
