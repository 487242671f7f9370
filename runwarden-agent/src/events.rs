//! Input events and their dispatch onto the services.

use runwarden_lib::Services;
use runwarden_lib::alerts::ReconcileError;
use runwarden_lib::baseline::BaselineError;
use runwarden_lib::enforcement::MessageInjector;
use runwarden_lib::models::{BaselineKey, ProcessIndicator};
use runwarden_lib::pipeline::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::local::{LocalDeploymentLookup, LoggingInjector};

/// One line of agent input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A process execution reported by an agent.
    Indicator {
        #[serde(default = "default_agent_id")]
        agent_id: String,
        indicator: ProcessIndicator,
    },
    /// A deployment was deleted from the cluster.
    DeploymentRemoved { deployment_id: String },
    /// A user locked or unlocked a container's baseline.
    BaselineLock {
        #[serde(flatten)]
        key: BaselineKey,
        locked: bool,
    },
}

fn default_agent_id() -> String {
    "local".to_owned()
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    #[error("Malformed event: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Baseline(#[from] BaselineError),
}

impl AgentEvent {
    pub fn parse(line: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Applies events to the services, keeping one injector per reporting agent.
pub struct EventProcessor {
    services: Services,
    lookup: Arc<LocalDeploymentLookup>,
    injectors: HashMap<String, Arc<dyn MessageInjector>>,
}

impl EventProcessor {
    pub fn new(services: Services, lookup: Arc<LocalDeploymentLookup>) -> Self {
        Self {
            services,
            lookup,
            injectors: HashMap::new(),
        }
    }

    fn injector(&mut self, agent_id: &str) -> Arc<dyn MessageInjector> {
        let injector = self
            .injectors
            .entry(agent_id.to_owned())
            .or_insert_with(|| Arc::new(LoggingInjector::new(agent_id)));
        Arc::clone(injector)
    }

    pub async fn handle(&mut self, event: AgentEvent) -> Result<(), EventError> {
        match event {
            AgentEvent::Indicator {
                agent_id,
                indicator,
            } => {
                self.lookup.observe(&indicator).await;
                let injector = self.injector(&agent_id);
                self.services
                    .pipeline
                    .submit_indicator(indicator, injector)?;
            }
            AgentEvent::DeploymentRemoved { deployment_id } => {
                self.lookup.mark_removed(&deployment_id).await;
                let outcome = self
                    .services
                    .reconciler
                    .resolve_deployment(&deployment_id)
                    .await?;
                let baselines = self
                    .services
                    .baselines
                    .remove_for_deployment(&deployment_id)
                    .await?;
                info!(
                    deployment_id,
                    resolved = outcome.stale.len(),
                    deactivated = outcome.updated.len(),
                    baselines,
                    "Deployment removed"
                );
            }
            AgentEvent::BaselineLock { key, locked } => {
                match self.services.baselines.user_lock(&key, locked).await? {
                    Some(_) => {}
                    None => debug!(baseline = %key, "No baseline to lock"),
                }
            }
        }
        Ok(())
    }
}
