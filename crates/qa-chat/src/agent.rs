use async_trait::async_trait;
use qa_core::Agent;
use qa_error::{QaError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Agent 目录：按 id 查找助手配置。轮次内配置只读，
/// 变更通过 invalidate 让后续轮次看到新配置。
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get(&self, agent_id: Uuid) -> Result<Agent>;

    async fn list(&self) -> Result<Vec<Agent>>;

    async fn invalidate(&self, agent_id: Uuid);
}

/// 配置文件驱动的 Agent 目录
pub struct StaticAgentDirectory {
    agents: Arc<RwLock<HashMap<Uuid, Agent>>>,
}

impl StaticAgentDirectory {
    pub fn new(agents: Vec<Agent>) -> Self {
        let map = agents.into_iter().map(|a| (a.id, a)).collect();
        Self {
            agents: Arc::new(RwLock::new(map)),
        }
    }

    /// 配置热更新入口：替换或新增一条 Agent
    pub async fn upsert(&self, agent: Agent) {
        let mut agents = self.agents.write().await;
        agents.insert(agent.id, agent);
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn get(&self, agent_id: Uuid) -> Result<Agent> {
        let agents = self.agents.read().await;
        agents.get(&agent_id).cloned().ok_or_else(|| QaError::NotFound {
            resource: format!("agent {}", agent_id),
        })
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        let agents = self.agents.read().await;
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn invalidate(&self, _agent_id: Uuid) {
        // 静态目录直接读内存表，无缓存层需要失效
    }
}
