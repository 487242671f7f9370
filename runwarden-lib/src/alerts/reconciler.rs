//! Alert reconciliation.
//!
//! A detection run produces the alerts that currently hold for some scope. The
//! reconciler compares them against the active alerts on record for the same
//! scope and classifies each into new, updated or stale, then persists the
//! three lists and notifies for every persisted change.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::merge::{MergeOutcome, merge_alerts};
use super::store::AlertStore;
use crate::detection::{AlertNotifier, DeploymentLookup, DetectionError, PolicyEngine};
use crate::error::ErrorList;
use crate::models::{Alert, LifecycleStage};
use crate::storage::{AlertQuery, StorageError};
use crate::sync::fan_out;

/// Reconciliation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error("Failed to fetch previous alerts: {0}")]
    Fetch(#[from] StorageError),

    #[error("Detection collaborator failed: {0}")]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Persist(#[from] ErrorList),
}

/// Which active alerts on record a reconciliation covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertScope {
    pub lifecycle_stage: Option<LifecycleStage>,
    pub deployment_ids: Option<Vec<String>>,
    pub policy_id: Option<String>,
}

impl AlertScope {
    pub fn for_deployment(deployment_id: impl Into<String>, stage: Option<LifecycleStage>) -> Self {
        Self {
            lifecycle_stage: stage,
            deployment_ids: Some(vec![deployment_id.into()]),
            policy_id: None,
        }
    }

    pub fn for_deployments(stage: LifecycleStage, deployment_ids: Vec<String>) -> Self {
        Self {
            lifecycle_stage: Some(stage),
            deployment_ids: Some(deployment_ids),
            policy_id: None,
        }
    }

    pub fn for_policy(policy_id: impl Into<String>) -> Self {
        Self {
            policy_id: Some(policy_id.into()),
            ..Self::default()
        }
    }

    pub fn for_stage(stage: LifecycleStage) -> Self {
        Self {
            lifecycle_stage: Some(stage),
            ..Self::default()
        }
    }

    fn active_query(&self) -> AlertQuery {
        AlertQuery {
            lifecycle_stage: self.lifecycle_stage,
            deployment_ids: self.deployment_ids.clone(),
            policy_id: self.policy_id.clone(),
            ..AlertQuery::active()
        }
    }
}

/// Classification of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub new: Vec<Alert>,
    pub updated: Vec<Alert>,
    pub stale: Vec<Alert>,
}

impl ReconcileOutcome {
    pub fn has_changes(&self) -> bool {
        !(self.new.is_empty() && self.updated.is_empty() && self.stale.is_empty())
    }

    /// Deployments touched by any of the three lists, sorted and deduplicated.
    pub fn deployment_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .new
            .iter()
            .chain(&self.updated)
            .chain(&self.stale)
            .map(|a| a.deployment_id().to_owned())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

type MergeKey = (String, String);

fn merge_key(alert: &Alert) -> MergeKey {
    (alert.policy_id().to_owned(), alert.deployment_id().to_owned())
}

/// Reconciles detection output against the alert history.
#[derive(Clone)]
pub struct Reconciler {
    alerts: AlertStore,
    policies: Arc<dyn PolicyEngine>,
    deployments: Arc<dyn DeploymentLookup>,
    notifier: Arc<dyn AlertNotifier>,
    max_process_violations: usize,
    fan_out_concurrency: usize,
}

impl Reconciler {
    pub fn new(
        alerts: AlertStore,
        policies: Arc<dyn PolicyEngine>,
        deployments: Arc<dyn DeploymentLookup>,
        notifier: Arc<dyn AlertNotifier>,
        max_process_violations: usize,
        fan_out_concurrency: usize,
    ) -> Self {
        Self {
            alerts,
            policies,
            deployments,
            notifier,
            max_process_violations,
            fan_out_concurrency,
        }
    }

    pub fn alert_store(&self) -> &AlertStore {
        &self.alerts
    }

    /// Classify `current` against the active alerts in `scope`. Nothing is
    /// written.
    pub async fn reconcile(
        &self,
        current: Vec<Alert>,
        scope: &AlertScope,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let previous = self.alerts.search_all(&scope.active_query()).await?;
        let now = Utc::now();

        let previous_by_key: HashMap<MergeKey, usize> = previous
            .iter()
            .enumerate()
            .map(|(i, a)| (merge_key(a), i))
            .collect();
        let mut matched = vec![false; previous.len()];

        let mut outcome = ReconcileOutcome::default();
        let mut new_by_key: HashMap<MergeKey, usize> = HashMap::new();
        let mut updated_by_key: HashMap<MergeKey, usize> = HashMap::new();

        for mut alert in current {
            if let Err(e) = alert.validate() {
                error!(alert_id = %alert.id, error = %e, "Dropping malformed alert from detection output");
                continue;
            }
            let key = merge_key(&alert);

            if let Some(&prev_idx) = previous_by_key.get(&key) {
                matched[prev_idx] = true;
                // A second alert for the same pair merges into the first
                // merge result, not into the stored alert again.
                let slot = updated_by_key.get(&key).copied();
                let base = slot.map_or(&previous[prev_idx], |i| &outcome.updated[i]);
                if let MergeOutcome::Merged(merged) =
                    merge_alerts(base, alert, self.max_process_violations)
                {
                    if *merged == previous[prev_idx] {
                        continue;
                    }
                    match slot {
                        Some(i) => outcome.updated[i] = *merged,
                        None => {
                            updated_by_key.insert(key, outcome.updated.len());
                            outcome.updated.push(*merged);
                        }
                    }
                }
                continue;
            }

            if let Some(&new_idx) = new_by_key.get(&key) {
                if let MergeOutcome::Merged(merged) =
                    merge_alerts(&outcome.new[new_idx], alert, self.max_process_violations)
                {
                    outcome.new[new_idx] = *merged;
                }
                continue;
            }

            alert.first_occurred = now;
            if alert.cap_processes(self.max_process_violations) {
                debug!(
                    alert_id = %alert.id,
                    max = self.max_process_violations,
                    "Truncated process violations of new alert"
                );
            }
            new_by_key.insert(key, outcome.new.len());
            outcome.new.push(alert);
        }

        for (mut old, _) in previous
            .into_iter()
            .zip(matched)
            .filter(|(_, was_matched)| !was_matched)
        {
            let mut marked_inactive = false;
            if old.lifecycle_stage == LifecycleStage::Runtime
                && !old.deployment.inactive
                && self.deployments.is_inactive(old.deployment_id()).await?
            {
                old.deployment.inactive = true;
                marked_inactive = true;
            }

            if self.is_stale(&old, scope).await? {
                outcome.stale.push(old);
            } else if marked_inactive {
                outcome.updated.push(old);
            }
        }

        debug!(
            new = outcome.new.len(),
            updated = outcome.updated.len(),
            stale = outcome.stale.len(),
            "Reconciled alerts"
        );
        Ok(outcome)
    }

    /// Whether a previously active alert that detection no longer produces
    /// should be resolved.
    async fn is_stale(&self, alert: &Alert, scope: &AlertScope) -> Result<bool, DetectionError> {
        if alert.lifecycle_stage != LifecycleStage::Runtime {
            return Ok(true);
        }
        if !self.policies.policy_exists(alert.policy_id()).await? {
            return Ok(true);
        }
        match scope.policy_id.as_deref() {
            Some(policy_id) if policy_id == alert.policy_id() => {
                self.policies
                    .is_deployment_excluded(alert.deployment_id(), policy_id)
                    .await
            }
            _ => Ok(false),
        }
    }

    /// Reconcile, then persist and notify. Every sub-list is attempted even if
    /// another fails; failures come back aggregated.
    pub async fn reconcile_and_persist(
        &self,
        current: Vec<Alert>,
        scope: &AlertScope,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let outcome = self.reconcile(current, scope).await?;
        self.persist(&outcome).await?;
        if outcome.has_changes() {
            info!(
                new = outcome.new.len(),
                updated = outcome.updated.len(),
                stale = outcome.stale.len(),
                "Persisted reconciled alerts"
            );
        }
        Ok(outcome)
    }

    /// Write the three lists of a reconciliation and notify for each alert:
    /// new and updated alerts as they are, stale alerts resolved.
    pub async fn persist(&self, outcome: &ReconcileOutcome) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new("persisting reconciled alerts");

        // Stale goes last so a resolution is never overwritten by an update.
        for (label, alerts) in [
            ("inserting new alerts", outcome.new.clone()),
            ("updating alerts", outcome.updated.clone()),
        ] {
            if let Err(list) = self.write_and_notify(label, alerts).await {
                errors.extend(list);
            }
        }

        let now = Utc::now();
        let resolved: Vec<Alert> = outcome
            .stale
            .iter()
            .cloned()
            .map(|mut alert| {
                alert.resolve(now);
                alert
            })
            .collect();
        if let Err(list) = self.write_and_notify("resolving stale alerts", resolved).await {
            errors.extend(list);
        }

        errors.into_result()
    }

    async fn write_and_notify(&self, description: &str, alerts: Vec<Alert>) -> Result<(), ErrorList> {
        if alerts.is_empty() {
            return Ok(());
        }
        let report = fan_out(
            description,
            alerts,
            self.fan_out_concurrency,
            |alert| alert.id.clone(),
            |alert| {
                let store = self.alerts.clone();
                let notifier = Arc::clone(&self.notifier);
                async move {
                    store
                        .upsert_alert(&alert)
                        .await
                        .map_err(|e| format!("upsert: {e}"))?;
                    if let Err(e) = notifier.notify(&alert).await {
                        warn!(alert_id = %alert.id, error = %e, "Alert notification failed");
                        return Err(format!("notify: {e}"));
                    }
                    Ok::<(), String>(())
                }
            },
        )
        .await;
        report.into_result().map(|_| ())
    }

    /// Reconcile one deployment's alerts for a lifecycle stage.
    pub async fn reconcile_for_deployment(
        &self,
        deployment_id: &str,
        stage: LifecycleStage,
        alerts: Vec<Alert>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let scope = AlertScope::for_deployment(deployment_id, Some(stage));
        self.reconcile_and_persist(alerts, &scope).await
    }

    /// Reconcile after a policy definition changed.
    pub async fn reconcile_for_policy_change(
        &self,
        policy_id: &str,
        alerts: Vec<Alert>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile_and_persist(alerts, &AlertScope::for_policy(policy_id))
            .await
    }

    /// Reconcile a removed deployment against an empty batch: its build and
    /// deploy alerts resolve, its runtime alerts are marked inactive.
    pub async fn resolve_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let scope = AlertScope::for_deployment(deployment_id, None);
        self.reconcile_and_persist(Vec::new(), &scope).await
    }
}
