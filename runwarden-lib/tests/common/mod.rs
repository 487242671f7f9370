//! Shared fakes for the integration tests.

#![allow(dead_code, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use runwarden_lib::Collaborators;
use runwarden_lib::detection::{
    AlertNotifier, BaselineResultsCleaner, ContainerInstance, DeploymentLookup, DetectionError,
    DetectionScope, PolicyEngine, RiskReprocessor,
};
use runwarden_lib::enforcement::{EnforcementDirective, InjectError, MessageInjector};
use runwarden_lib::models::{
    Alert, DeploymentRef, EnforcementAction, LifecycleStage, PolicyRef, ProcessIndicator,
    ProcessSignal, Severity, Violation,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const KILL_POLICY: &str = "kill-netcat";
pub const BASELINE_POLICY: &str = "unauthorized-process";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

pub fn indicator(id: &str, deployment: &str, container: &str, path: &str, secs: i64) -> ProcessIndicator {
    ProcessIndicator {
        id: id.to_owned(),
        deployment_id: deployment.to_owned(),
        container_name: container.to_owned(),
        cluster_id: "cluster-1".to_owned(),
        namespace: "prod".to_owned(),
        pod_id: Some(format!("{deployment}-pod")),
        signal: ProcessSignal {
            process_name: path.rsplit('/').next().unwrap_or(path).to_owned(),
            exec_file_path: path.to_owned(),
            args: String::new(),
            uid: 1000,
            time: at(secs),
            container_id: format!("{deployment}{container}0123456789"),
        },
    }
}

pub fn alert(policy: &str, deployment: &str, stage: LifecycleStage) -> Alert {
    Alert::new(
        PolicyRef::new(policy, policy, Severity::High),
        DeploymentRef::new(deployment, deployment),
        stage,
    )
}

/// Flags every execution of `flagged_binary` under a kill-enforced policy and
/// reports baseline violations under a second policy.
#[derive(Default)]
pub struct FakePolicyEngine {
    pub flagged_binary: Option<String>,
    pub missing_policies: HashSet<String>,
    pub excluded: HashSet<(String, String)>,
    pub baseline_calls: Mutex<Vec<Vec<String>>>,
}

impl FakePolicyEngine {
    pub fn flagging(binary: &str) -> Self {
        Self {
            flagged_binary: Some(binary.to_owned()),
            ..Self::default()
        }
    }

    fn group_alerts(
        policy: PolicyRef,
        indicators: Vec<ProcessIndicator>,
        enforcement: Option<EnforcementAction>,
    ) -> Vec<Alert> {
        let mut by_deployment: BTreeMap<String, Vec<ProcessIndicator>> = BTreeMap::new();
        for indicator in indicators {
            by_deployment
                .entry(indicator.deployment_id.clone())
                .or_default()
                .push(indicator);
        }
        by_deployment
            .into_iter()
            .map(|(deployment, processes)| {
                let mut alert = Alert::new(
                    policy.clone(),
                    DeploymentRef::new(deployment.as_str(), deployment.as_str()),
                    LifecycleStage::Runtime,
                )
                .with_violation(Violation::new(policy.name.as_str()))
                .with_processes(processes);
                if let Some(action) = enforcement {
                    alert = alert.with_enforcement(action, "terminate offending pod");
                }
                alert
            })
            .collect()
    }
}

#[async_trait]
impl PolicyEngine for FakePolicyEngine {
    async fn compute_violations(
        &self,
        _stage: LifecycleStage,
        scope: &DetectionScope,
    ) -> Result<Vec<Alert>, DetectionError> {
        match scope {
            DetectionScope::Deployments { indicators, .. } => {
                let Some(binary) = &self.flagged_binary else {
                    return Ok(Vec::new());
                };
                let flagged: Vec<ProcessIndicator> = indicators
                    .iter()
                    .filter(|i| &i.signal.exec_file_path == binary)
                    .cloned()
                    .collect();
                Ok(Self::group_alerts(
                    PolicyRef::new(KILL_POLICY, "Netcat Execution", Severity::Critical),
                    flagged,
                    Some(EnforcementAction::KillPod),
                ))
            }
            DetectionScope::BaselineViolations { indicators } => {
                self.baseline_calls
                    .lock()
                    .expect("engine lock")
                    .push(indicators.iter().map(|i| i.id.clone()).collect());
                Ok(Self::group_alerts(
                    PolicyRef::new(BASELINE_POLICY, "Unauthorized Process", Severity::High),
                    indicators.clone(),
                    None,
                ))
            }
            DetectionScope::Policy(_) => Ok(Vec::new()),
        }
    }

    async fn policy_exists(&self, policy_id: &str) -> Result<bool, DetectionError> {
        Ok(!self.missing_policies.contains(policy_id))
    }

    async fn is_deployment_excluded(
        &self,
        deployment_id: &str,
        policy_id: &str,
    ) -> Result<bool, DetectionError> {
        Ok(self
            .excluded
            .contains(&(deployment_id.to_owned(), policy_id.to_owned())))
    }
}

/// Resolves any container id prefix of at least 12 characters to an instance.
#[derive(Default)]
pub struct FakeDeployments {
    pub inactive: HashSet<String>,
    pub gone_containers: HashSet<String>,
}

#[async_trait]
impl DeploymentLookup for FakeDeployments {
    async fn is_inactive(&self, deployment_id: &str) -> Result<bool, DetectionError> {
        Ok(self.inactive.contains(deployment_id))
    }

    async fn find_container_instance(
        &self,
        deployment_id: &str,
        container_id_prefix: &str,
    ) -> Result<Option<ContainerInstance>, DetectionError> {
        if container_id_prefix.len() < 12 || self.gone_containers.contains(container_id_prefix) {
            return Ok(None);
        }
        Ok(Some(ContainerInstance {
            instance_id: format!("docker://{container_id_prefix}"),
            pod_id: format!("{deployment_id}-pod"),
        }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notified: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), DetectionError> {
        self.notified
            .lock()
            .expect("notifier lock")
            .push(alert.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRisk {
    pub reprocessed: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl RiskReprocessor for RecordingRisk {
    async fn reprocess_deployments(&self, deployment_ids: &[String]) -> Result<(), DetectionError> {
        self.reprocessed
            .lock()
            .expect("risk lock")
            .push(deployment_ids.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCleaner {
    pub cleaned: Mutex<Vec<String>>,
}

#[async_trait]
impl BaselineResultsCleaner for RecordingCleaner {
    async fn remove_results_for_deployment(&self, deployment_id: &str) -> Result<(), DetectionError> {
        self.cleaned
            .lock()
            .expect("cleaner lock")
            .push(deployment_id.to_owned());
        Ok(())
    }
}

/// Injector standing in for one agent connection.
pub struct RecordingInjector {
    pub agent: String,
    pub fail: bool,
    pub directives: Mutex<Vec<EnforcementDirective>>,
}

impl RecordingInjector {
    pub fn new(agent: &str) -> Arc<Self> {
        Arc::new(Self {
            agent: agent.to_owned(),
            fail: false,
            directives: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(agent: &str) -> Arc<Self> {
        Arc::new(Self {
            agent: agent.to_owned(),
            fail: true,
            directives: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<EnforcementDirective> {
        self.directives.lock().expect("injector lock").clone()
    }
}

#[async_trait]
impl MessageInjector for RecordingInjector {
    fn agent_id(&self) -> &str {
        &self.agent
    }

    async fn inject(&self, directive: EnforcementDirective) -> Result<(), InjectError> {
        if self.fail {
            return Err(InjectError::Disconnected {
                agent_id: self.agent.clone(),
            });
        }
        self.directives
            .lock()
            .expect("injector lock")
            .push(directive);
        Ok(())
    }
}

/// Fakes plus the collaborator bundle built from them.
pub struct Fakes {
    pub engine: Arc<FakePolicyEngine>,
    pub deployments: Arc<FakeDeployments>,
    pub notifier: Arc<RecordingNotifier>,
    pub risk: Arc<RecordingRisk>,
    pub cleaner: Arc<RecordingCleaner>,
}

impl Fakes {
    pub fn new(engine: FakePolicyEngine, deployments: FakeDeployments) -> Self {
        Self {
            engine: Arc::new(engine),
            deployments: Arc::new(deployments),
            notifier: Arc::new(RecordingNotifier::default()),
            risk: Arc::new(RecordingRisk::default()),
            cleaner: Arc::new(RecordingCleaner::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            policies: self.engine.clone(),
            deployments: self.deployments.clone(),
            notifier: self.notifier.clone(),
            risk: self.risk.clone(),
            baseline_results: self.cleaner.clone(),
        }
    }

    pub fn reprocessed_deployments(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for batch in self.risk.reprocessed.lock().expect("risk lock").iter() {
            for id in batch {
                *counts.entry(id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}
