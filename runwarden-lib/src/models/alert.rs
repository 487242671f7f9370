//! Alert data structures and types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::models::indicator::ProcessIndicator;

/// When a policy is evaluated against a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Build,
    Deploy,
    Runtime,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Deploy => write!(f, "deploy"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Alert violation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationState {
    Active,
    Snoozed,
    Resolved,
}

impl fmt::Display for ViolationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Snoozed => write!(f, "snoozed"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Policy severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Invalid severity: {s}")),
        }
    }
}

/// The policy an alert was raised for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRef {
    pub id: String,
    pub name: String,
    pub severity: Severity,
}

impl PolicyRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            severity,
        }
    }
}

/// The monitored workload an alert belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeploymentRef {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    pub namespace: String,
    /// Set once the deployment has been removed from its cluster.
    #[serde(default)]
    pub inactive: bool,
}

impl DeploymentRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A single structured violation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub message: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Violation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Default cap on the processes a single alert references.
pub const MAX_PROCESS_VIOLATIONS_PER_ALERT: usize = 40;

/// Process activity that violated a runtime policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProcessViolation {
    /// Human-readable summary of `processes`
    pub message: String,
    pub processes: Vec<ProcessIndicator>,
}

impl ProcessViolation {
    /// Build a violation over `processes` with a freshly rendered message.
    pub fn from_processes(processes: Vec<ProcessIndicator>) -> Self {
        let mut violation = Self {
            message: String::new(),
            processes,
        };
        violation.refresh_message();
        violation
    }

    /// Re-render `message` from the current process list.
    pub fn refresh_message(&mut self) {
        self.message = describe_processes(&self.processes);
    }

    /// Keep only the first `max` processes. Returns whether anything was
    /// dropped; the message is re-rendered when it was.
    pub fn truncate(&mut self, max: usize) -> bool {
        if self.processes.len() <= max {
            return false;
        }
        self.processes.truncate(max);
        self.refresh_message();
        true
    }

    /// Latest signal time among the referenced processes.
    pub fn latest_signal_time(&self) -> Option<DateTime<Utc>> {
        self.processes.iter().map(|p| p.signal.time).max()
    }
}

fn describe_processes(processes: &[ProcessIndicator]) -> String {
    let Some(first) = processes.first() else {
        return String::new();
    };
    let first_binary = first.baseline_item();

    if processes.len() == 1 {
        let signal = &first.signal;
        return if signal.args.is_empty() {
            format!(
                "Binary '{first_binary}' executed without arguments under user ID {}",
                signal.uid
            )
        } else {
            format!(
                "Binary '{first_binary}' executed with arguments '{}' under user ID {}",
                signal.args, signal.uid
            )
        };
    }

    let mut binaries: Vec<&str> = Vec::new();
    for process in processes {
        let binary = process.baseline_item();
        if !binaries.contains(&binary) {
            binaries.push(binary);
        }
    }

    if binaries.len() == 1 {
        format!(
            "Binary '{first_binary}' executed with {} different arguments",
            processes.len()
        )
    } else {
        let quoted: Vec<String> = binaries.iter().map(|b| format!("'{b}'")).collect();
        format!("{} binaries executed: {}", binaries.len(), quoted.join(", "))
    }
}

/// Remedial directive kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    ScaleToZero,
    UnsatisfiableNodeConstraint,
    KillPod,
    FailBuild,
    FailKubeRequest,
    FailDeploymentCreate,
    FailDeploymentUpdate,
}

impl EnforcementAction {
    /// Whether the action terminates running workload instances.
    pub fn is_kill(self) -> bool {
        matches!(self, Self::KillPod)
    }
}

/// Enforcement attached to an alert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Enforcement {
    pub action: EnforcementAction,
    pub message: String,
}

/// A persisted record of a policy violation for one deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub policy: PolicyRef,
    pub deployment: DeploymentRef,
    pub lifecycle_stage: LifecycleStage,
    pub state: ViolationState,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub process_violation: Option<ProcessViolation>,
    #[serde(default)]
    pub enforcement: Option<Enforcement>,
    /// Set once when the alert is first created.
    pub first_occurred: DateTime<Utc>,
    /// Time of the last change to the violations.
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snooze_till: Option<DateTime<Utc>>,
    /// User-owned, sorted and deduplicated.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Alert {
    /// Create an active alert with a fresh id.
    pub fn new(policy: PolicyRef, deployment: DeploymentRef, lifecycle_stage: LifecycleStage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            policy,
            deployment,
            lifecycle_stage,
            state: ViolationState::Active,
            violations: Vec::new(),
            process_violation: None,
            enforcement: None,
            first_occurred: now,
            time: now,
            resolved_at: None,
            snooze_till: None,
            tags: Vec::new(),
        }
    }

    pub fn with_violation(mut self, violation: Violation) -> Self {
        self.violations.push(violation);
        self
    }

    pub fn with_processes(mut self, processes: Vec<ProcessIndicator>) -> Self {
        self.process_violation = Some(ProcessViolation::from_processes(processes));
        self
    }

    pub fn with_enforcement(mut self, action: EnforcementAction, message: impl Into<String>) -> Self {
        self.enforcement = Some(Enforcement {
            action,
            message: message.into(),
        });
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn policy_id(&self) -> &str {
        &self.policy.id
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment.id
    }

    /// Two alerts describe the same violation when these match.
    pub fn merge_key(&self) -> (&str, &str) {
        (&self.policy.id, &self.deployment.id)
    }

    pub fn is_active(&self) -> bool {
        self.state == ViolationState::Active
    }

    /// Processes referenced by the process violation, if any.
    pub fn processes(&self) -> &[ProcessIndicator] {
        self.process_violation
            .as_ref()
            .map_or(&[], |pv| pv.processes.as_slice())
    }

    /// Drop processes beyond `max`. Returns whether the alert changed.
    pub fn cap_processes(&mut self, max: usize) -> bool {
        self.process_violation
            .as_mut()
            .is_some_and(|pv| pv.truncate(max))
    }

    pub fn has_kill_enforcement(&self) -> bool {
        self.enforcement
            .as_ref()
            .is_some_and(|e| e.action.is_kill())
    }

    /// Check the fields every persisted alert needs.
    pub fn validate(&self) -> Result<(), AlertError> {
        if self.id.trim().is_empty() {
            return Err(AlertError::MissingField("id"));
        }
        if self.policy.id.trim().is_empty() {
            return Err(AlertError::MissingField("policy.id"));
        }
        if self.deployment.id.trim().is_empty() {
            return Err(AlertError::MissingField("deployment.id"));
        }
        Ok(())
    }

    /// Mark resolved, keeping the record for history.
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.state = ViolationState::Resolved;
        self.resolved_at = Some(now);
        self.snooze_till = None;
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self.tags.sort_unstable();
        self.tags.dedup();
    }

    pub fn remove_tags(&mut self, tags: &[String]) {
        self.tags.retain(|t| !tags.contains(t));
    }
}

/// Alert-related errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AlertError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}
