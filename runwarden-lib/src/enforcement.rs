//! Enforcement directives delivered back to the reporting agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::EnforcementAction;

/// One remedial action for one running container instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementDirective {
    pub action: EnforcementAction,
    pub alert_id: String,
    pub policy_id: String,
    pub deployment_id: String,
    pub container_instance_id: String,
    pub pod_id: String,
    /// Indicator whose process triggered the directive
    pub indicator_id: String,
}

/// Delivery failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InjectError {
    #[error("Agent {agent_id} is disconnected")]
    Disconnected { agent_id: String },

    #[error("Agent {agent_id} rejected directive: {message}")]
    Rejected { agent_id: String, message: String },
}

/// Outbound channel to the agent an indicator came from.
#[async_trait]
pub trait MessageInjector: Send + Sync {
    /// Identifier of the agent behind this channel, for logging.
    fn agent_id(&self) -> &str;

    async fn inject(&self, directive: EnforcementDirective) -> Result<(), InjectError>;
}
