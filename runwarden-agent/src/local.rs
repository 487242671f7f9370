//! In-process stand-ins for the services the pipeline talks to.
//!
//! The agent has no deployment inventory or notifier service of its own, so
//! it learns containers from the indicators it sees and reports everything
//! through stdout and the log.

use async_trait::async_trait;
use runwarden_lib::detection::{
    AlertNotifier, BaselineResultsCleaner, ContainerInstance, DeploymentLookup, DetectionError,
    RiskReprocessor,
};
use runwarden_lib::enforcement::{EnforcementDirective, InjectError, MessageInjector};
use runwarden_lib::models::{Alert, ProcessIndicator};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Inventory {
    /// deployment id -> container id -> pod id
    containers: HashMap<String, BTreeMap<String, Option<String>>>,
    removed: HashSet<String>,
}

/// Deployment inventory built from observed indicators.
#[derive(Debug, Default)]
pub struct LocalDeploymentLookup {
    inventory: RwLock<Inventory>,
}

impl LocalDeploymentLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the container an indicator ran in.
    pub async fn observe(&self, indicator: &ProcessIndicator) {
        let mut inventory = self.inventory.write().await;
        inventory.removed.remove(&indicator.deployment_id);
        inventory
            .containers
            .entry(indicator.deployment_id.clone())
            .or_default()
            .insert(
                indicator.signal.container_id.clone(),
                indicator.pod_id.clone(),
            );
    }

    /// Forget a deleted deployment's containers and report it inactive.
    pub async fn mark_removed(&self, deployment_id: &str) {
        let mut inventory = self.inventory.write().await;
        inventory.containers.remove(deployment_id);
        inventory.removed.insert(deployment_id.to_owned());
    }
}

#[async_trait]
impl DeploymentLookup for LocalDeploymentLookup {
    async fn is_inactive(&self, deployment_id: &str) -> Result<bool, DetectionError> {
        Ok(self.inventory.read().await.removed.contains(deployment_id))
    }

    async fn find_container_instance(
        &self,
        deployment_id: &str,
        container_id_prefix: &str,
    ) -> Result<Option<ContainerInstance>, DetectionError> {
        if container_id_prefix.is_empty() {
            return Ok(None);
        }
        let inventory = self.inventory.read().await;
        let found = inventory
            .containers
            .get(deployment_id)
            .and_then(|containers| {
                containers
                    .iter()
                    .find(|(id, _)| id.starts_with(container_id_prefix))
            })
            .map(|(id, pod)| ContainerInstance {
                instance_id: id.clone(),
                pod_id: pod.clone().unwrap_or_default(),
            });
        Ok(found)
    }
}

/// Writes every notified alert to stdout as one JSON line.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

#[async_trait]
impl AlertNotifier for StdoutNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), DetectionError> {
        let failed = |message: String| DetectionError::Notification {
            alert_id: alert.id.clone(),
            message,
        };
        let line = serde_json::to_string(alert).map_err(|e| failed(e.to_string()))?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}").map_err(|e| failed(e.to_string()))?;
        stdout.flush().map_err(|e| failed(e.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct LoggingRiskReprocessor;

#[async_trait]
impl RiskReprocessor for LoggingRiskReprocessor {
    async fn reprocess_deployments(&self, deployment_ids: &[String]) -> Result<(), DetectionError> {
        debug!(deployments = ?deployment_ids, "Risk reprocessing requested");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LoggingResultsCleaner;

#[async_trait]
impl BaselineResultsCleaner for LoggingResultsCleaner {
    async fn remove_results_for_deployment(&self, deployment_id: &str) -> Result<(), DetectionError> {
        debug!(deployment_id, "Baseline results cleared");
        Ok(())
    }
}

/// Delivers enforcement by logging it; the reporting agent is the event
/// stream, which has no return channel.
#[derive(Debug)]
pub struct LoggingInjector {
    agent_id: String,
}

impl LoggingInjector {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl MessageInjector for LoggingInjector {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn inject(&self, directive: EnforcementDirective) -> Result<(), InjectError> {
        info!(
            agent_id = %self.agent_id,
            action = ?directive.action,
            alert_id = %directive.alert_id,
            deployment_id = %directive.deployment_id,
            container_instance_id = %directive.container_instance_id,
            pod_id = %directive.pod_id,
            "Enforcement directive issued"
        );
        Ok(())
    }
}
