//! A self-contained policy engine that only reports baseline deviations.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

use super::{DetectionError, DetectionScope, PolicyEngine};
use crate::models::{
    Alert, DeploymentRef, LifecycleStage, MAX_PROCESS_VIOLATIONS_PER_ALERT, PolicyRef,
    ProcessIndicator, Severity, Violation,
};

/// Raises one runtime alert per deployment for processes outside a locked
/// baseline, under a single configured policy. Policy rules are not evaluated.
/// Each alert references at most `max_processes` processes, earliest first.
#[derive(Debug, Clone)]
pub struct BaselineOnlyEngine {
    policy: PolicyRef,
    max_processes: usize,
}

impl BaselineOnlyEngine {
    pub const DEFAULT_POLICY_ID: &'static str = "unauthorized-process-execution";

    pub fn new(policy: PolicyRef) -> Self {
        Self {
            policy,
            max_processes: MAX_PROCESS_VIOLATIONS_PER_ALERT,
        }
    }

    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    pub fn policy(&self) -> &PolicyRef {
        &self.policy
    }
}

impl Default for BaselineOnlyEngine {
    fn default() -> Self {
        Self::new(PolicyRef::new(
            Self::DEFAULT_POLICY_ID,
            "Unauthorized Process Execution",
            Severity::High,
        ))
    }
}

#[async_trait]
impl PolicyEngine for BaselineOnlyEngine {
    async fn compute_violations(
        &self,
        stage: LifecycleStage,
        scope: &DetectionScope,
    ) -> Result<Vec<Alert>, DetectionError> {
        let DetectionScope::BaselineViolations { indicators } = scope else {
            return Ok(Vec::new());
        };
        if stage != LifecycleStage::Runtime {
            return Ok(Vec::new());
        }

        let mut by_deployment: BTreeMap<&str, Vec<ProcessIndicator>> = BTreeMap::new();
        for indicator in indicators {
            by_deployment
                .entry(indicator.deployment_id.as_str())
                .or_default()
                .push(indicator.clone());
        }

        let alerts: Vec<Alert> = by_deployment
            .into_values()
            .filter_map(|mut processes| {
                processes.sort_by(|a, b| a.signal.time.cmp(&b.signal.time));
                processes.truncate(self.max_processes);
                let first = processes.first()?;
                let deployment = DeploymentRef {
                    id: first.deployment_id.clone(),
                    name: first.deployment_id.clone(),
                    cluster_id: first.cluster_id.clone(),
                    namespace: first.namespace.clone(),
                    inactive: false,
                };
                let violation = Violation::new("Process not in baseline")
                    .with_attribute("container", first.container_name.as_str());
                let latest = processes.last().map(|p| p.signal.time);
                let mut alert = Alert::new(self.policy.clone(), deployment, LifecycleStage::Runtime)
                    .with_violation(violation)
                    .with_processes(processes);
                if let Some(time) = latest {
                    alert.time = time;
                }
                Some(alert)
            })
            .collect();

        debug!(alerts = alerts.len(), "Computed baseline violations");
        Ok(alerts)
    }

    async fn policy_exists(&self, policy_id: &str) -> Result<bool, DetectionError> {
        Ok(policy_id == self.policy.id)
    }

    async fn is_deployment_excluded(
        &self,
        _deployment_id: &str,
        _policy_id: &str,
    ) -> Result<bool, DetectionError> {
        Ok(false)
    }
}
