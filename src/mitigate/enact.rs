//! Collaborator seams for enacting mitigations.
//!
//! The engine never talks to identity, agent-lifecycle, or orchestration
//! services directly; it goes through these traits so deployments wire in
//! their own clients and tests wire in failures.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::ActionType;

/// Identity/auth service: MFA enforcement and entity blocking.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn enforce(&self, entity_id: &str, action: &str) -> Result<()>;
}

/// Agent lifecycle manager: isolation and restarts.
#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    async fn isolate(&self, agent_id: &str) -> Result<()>;
    async fn restart(&self, agent_id: &str) -> Result<()>;
}

/// Resource orchestrator for scale-out actions.
#[async_trait]
pub trait ResourceOrchestrator: Send + Sync {
    async fn scale(&self, target: &str, delta: i32) -> Result<()>;
}

/// Bundle of collaborator handles the engine enacts through.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityService>,
    pub agents: Arc<dyn AgentLifecycle>,
    pub resources: Arc<dyn ResourceOrchestrator>,
}

impl Collaborators {
    /// Enact one action against one entity.
    pub async fn enact(&self, action: ActionType, entity_id: &str) -> Result<()> {
        match action {
            ActionType::RequireMfa => self.identity.enforce(entity_id, "require_mfa").await,
            ActionType::BlockEntity => self.identity.enforce(entity_id, "block").await,
            ActionType::IsolateAgent => self.agents.isolate(entity_id).await,
            ActionType::ScaleResources => self.resources.scale(entity_id, 1).await,
            // Engine-internal actions: recorded state is the enforcement.
            ActionType::RateLimit | ActionType::IncreaseMonitoring => {
                info!(entity = entity_id, action = %action, "internal mitigation active");
                Ok(())
            }
        }
    }

    /// Log-only collaborators for standalone operation and local runs.
    pub fn log_only() -> Self {
        Self {
            identity: Arc::new(LogIdentityService),
            agents: Arc::new(LogAgentLifecycle),
            resources: Arc::new(LogResourceOrchestrator),
        }
    }
}

pub struct LogIdentityService;

#[async_trait]
impl IdentityService for LogIdentityService {
    async fn enforce(&self, entity_id: &str, action: &str) -> Result<()> {
        info!(entity = entity_id, action, "identity enforcement requested");
        Ok(())
    }
}

pub struct LogAgentLifecycle;

#[async_trait]
impl AgentLifecycle for LogAgentLifecycle {
    async fn isolate(&self, agent_id: &str) -> Result<()> {
        info!(agent = agent_id, "agent isolation requested");
        Ok(())
    }

    async fn restart(&self, agent_id: &str) -> Result<()> {
        info!(agent = agent_id, "agent restart requested");
        Ok(())
    }
}

pub struct LogResourceOrchestrator;

#[async_trait]
impl ResourceOrchestrator for LogResourceOrchestrator {
    async fn scale(&self, target: &str, delta: i32) -> Result<()> {
        info!(target, delta, "resource scale requested");
        Ok(())
    }
}
