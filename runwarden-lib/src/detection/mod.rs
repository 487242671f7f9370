//! Interfaces to the collaborators that live outside this crate.
//!
//! Policy matching, deployment inventory, notification delivery, risk scoring
//! and baseline-result bookkeeping are owned by other services. The stores and
//! the pipeline only see them through the traits below.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Alert, LifecycleStage, ProcessIndicator};

pub mod baseline_only;

pub use baseline_only::BaselineOnlyEngine;

/// Errors reported by external collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DetectionError {
    #[error("Policy engine failure: {0}")]
    Engine(String),

    #[error("Deployment lookup failed for {deployment_id}: {message}")]
    Lookup {
        deployment_id: String,
        message: String,
    },

    #[error("Notification failed for alert {alert_id}: {message}")]
    Notification { alert_id: String, message: String },

    #[error("Risk reprocessing failed: {0}")]
    Risk(String),

    #[error("Baseline result cleanup failed for {deployment_id}: {message}")]
    Cleanup {
        deployment_id: String,
        message: String,
    },
}

/// What a detection run evaluates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionScope {
    /// Runtime policies for the given deployments, fed by fresh indicators.
    Deployments {
        deployment_ids: Vec<String>,
        indicators: Vec<ProcessIndicator>,
    },
    /// Every deployment against one policy.
    Policy(String),
    /// Processes that fell outside a locked baseline.
    BaselineViolations { indicators: Vec<ProcessIndicator> },
}

/// A running container instance resolved from an agent-reported id prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInstance {
    pub instance_id: String,
    pub pod_id: String,
}

/// The policy-matching engine.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn compute_violations(
        &self,
        stage: LifecycleStage,
        scope: &DetectionScope,
    ) -> Result<Vec<Alert>, DetectionError>;

    async fn policy_exists(&self, policy_id: &str) -> Result<bool, DetectionError>;

    async fn is_deployment_excluded(
        &self,
        deployment_id: &str,
        policy_id: &str,
    ) -> Result<bool, DetectionError>;
}

/// Deployment inventory.
#[async_trait]
pub trait DeploymentLookup: Send + Sync {
    async fn is_inactive(&self, deployment_id: &str) -> Result<bool, DetectionError>;

    async fn find_container_instance(
        &self,
        deployment_id: &str,
        container_id_prefix: &str,
    ) -> Result<Option<ContainerInstance>, DetectionError>;
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), DetectionError>;
}

#[async_trait]
pub trait RiskReprocessor: Send + Sync {
    async fn reprocess_deployments(&self, deployment_ids: &[String]) -> Result<(), DetectionError>;
}

#[async_trait]
pub trait BaselineResultsCleaner: Send + Sync {
    async fn remove_results_for_deployment(&self, deployment_id: &str) -> Result<(), DetectionError>;
}
