//! Indicator flush pipeline.
//!
//! Agents submit process indicators one at a time; they accumulate in a
//! pending map until a flush drains them. A flush cycle runs
//! Draining, Persisting, Detecting, Reconciling and Enforcing in that order.
//! Flushes are triggered by submissions (rate limited) and by a periodic
//! ticker; at most one cycle runs at a time and a trigger that finds a cycle
//! in flight is skipped, since the running or next cycle picks up whatever is
//! pending.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertScope, ReconcileError, Reconciler};
use crate::baseline::{BaselineError, BaselineStore};
use crate::config::PipelineConfig;
use crate::detection::{
    DeploymentLookup, DetectionError, DetectionScope, PolicyEngine, RiskReprocessor,
};
use crate::enforcement::{EnforcementDirective, MessageInjector};
use crate::models::{Alert, BaselineKey, IndicatorError, LifecycleStage, LockMode, ProcessIndicator};
use crate::rate_limiter::RateLimiter;
use crate::storage::{IndicatorStorage, StorageError};
use crate::sync::TryGate;

/// Floor for the periodic flush cadence; a zero period cannot drive a ticker.
const MIN_PERIODIC_INTERVAL: Duration = Duration::from_millis(1);
use crate::telemetry::{PerformanceTimer, PipelineMetrics};

/// Flush pipeline errors. Any of these stops the cycle it happened in.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("Invalid indicator: {0}")]
    InvalidIndicator(#[from] IndicatorError),

    #[error("Failed to persist indicator batch: {0}")]
    Persist(#[source] StorageError),

    #[error("Violation detection failed: {0}")]
    Detection(#[from] DetectionError),

    #[error("Reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Outcome of one flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushReport {
    /// Another cycle held the gate; nothing was drained.
    Skipped,
    Completed(FlushStats),
}

/// What one completed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub indicators: usize,
    pub alerts_detected: usize,
    pub new_alerts: usize,
    pub updated_alerts: usize,
    pub stale_alerts: usize,
    pub baselines_created: usize,
    pub enforcement_dispatched: usize,
    pub enforcement_failed: usize,
}

/// Collaborators and stores the pipeline drives.
pub struct PipelineDeps {
    pub indicators: Arc<dyn IndicatorStorage>,
    pub baselines: BaselineStore,
    pub reconciler: Reconciler,
    pub policies: Arc<dyn PolicyEngine>,
    pub deployments: Arc<dyn DeploymentLookup>,
    pub risk: Arc<dyn RiskReprocessor>,
    pub metrics: Arc<PipelineMetrics>,
}

struct PendingIndicator {
    indicator: ProcessIndicator,
    injector: Arc<dyn MessageInjector>,
}

struct Inner {
    pending: Mutex<HashMap<String, PendingIndicator>>,
    limiter: RateLimiter,
    gate: TryGate,
    periodic_interval: Duration,
    violation_lock_mode: LockMode,
    deps: PipelineDeps,
}

/// Baseline findings for one flush.
#[derive(Default)]
struct BaselineFindings {
    candidates: Vec<ProcessIndicator>,
    created: usize,
    reprocess_now: BTreeSet<String>,
    reprocess_after_lock: BTreeSet<String>,
}

/// Handle to the flush pipeline; clones share the same pending map and gate.
#[derive(Clone)]
pub struct IndicatorPipeline {
    inner: Arc<Inner>,
}

impl IndicatorPipeline {
    pub fn new(config: &PipelineConfig, violation_lock_mode: LockMode, deps: PipelineDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                limiter: RateLimiter::new(config.rate_limit()),
                gate: TryGate::new(),
                periodic_interval: config.periodic_flush_interval().max(MIN_PERIODIC_INTERVAL),
                violation_lock_mode,
                deps,
            }),
        }
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.inner.deps.metrics)
    }

    /// Number of indicators waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingIndicator>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Queue an indicator for the next flush, remembering the agent it came
    /// from. A later submission with the same id replaces the earlier one.
    ///
    /// When the rate limiter admits it, an immediate flush is started in the
    /// background on the current tokio runtime.
    pub fn submit_indicator(
        &self,
        indicator: ProcessIndicator,
        injector: Arc<dyn MessageInjector>,
    ) -> Result<(), PipelineError> {
        indicator.validate()?;
        let id = indicator.id.clone();
        self.lock_pending()
            .insert(id.clone(), PendingIndicator { indicator, injector });
        self.inner.deps.metrics.record_submitted();
        debug!(indicator_id = %id, "Queued process indicator");

        if self.inner.limiter.allow() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let pipeline = self.clone();
                    handle.spawn(async move {
                        if let Err(e) = pipeline.flush().await {
                            error!(error = %e, "Triggered indicator flush failed");
                        }
                    });
                }
                Err(_) => debug!("No runtime available; leaving indicator for the periodic flush"),
            }
        }
        Ok(())
    }

    /// Run one flush cycle unless one is already in flight.
    pub async fn flush(&self) -> Result<FlushReport, PipelineError> {
        let Some(_gate) = self.inner.gate.try_acquire() else {
            self.inner.deps.metrics.record_skipped();
            debug!("Flush already in progress; skipping");
            return Ok(FlushReport::Skipped);
        };

        let drained = std::mem::take(&mut *self.lock_pending());
        if drained.is_empty() {
            return Ok(FlushReport::Completed(FlushStats::default()));
        }

        let timer = PerformanceTimer::start("indicator_flush");
        match self.run_cycle(drained).await {
            Ok(stats) => {
                let duration = timer.finish();
                self.inner.deps.metrics.record_cycle(
                    stats.indicators,
                    stats.new_alerts + stats.updated_alerts + stats.stale_alerts,
                    duration,
                );
                info!(
                    indicators = stats.indicators,
                    new_alerts = stats.new_alerts,
                    updated_alerts = stats.updated_alerts,
                    stale_alerts = stats.stale_alerts,
                    duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    "Indicator flush completed"
                );
                Ok(FlushReport::Completed(stats))
            }
            Err(e) => {
                self.inner.deps.metrics.record_failure();
                error!(error = %e, "Indicator flush cycle failed");
                Err(e)
            }
        }
    }

    /// Flush until nothing is pending, waiting out cycles already in flight.
    pub async fn drain(&self) -> Result<(), PipelineError> {
        loop {
            match self.flush().await? {
                FlushReport::Skipped => tokio::time::sleep(Duration::from_millis(25)).await,
                FlushReport::Completed(_) if self.pending_len() == 0 => return Ok(()),
                FlushReport::Completed(_) => {}
            }
        }
    }

    /// Flush on the configured cadence until `shutdown` resolves, then drain
    /// whatever is still pending.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut ticker = interval(self.inner.periodic_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        tokio::pin!(shutdown);

        info!(
            interval_ms = u64::try_from(self.inner.periodic_interval.as_millis()).unwrap_or(u64::MAX),
            "Starting periodic indicator flush"
        );
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested; draining pending indicators");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Periodic flush failed");
                    }
                }
            }
        }

        if let Err(e) = self.drain().await {
            error!(error = %e, "Final indicator drain failed");
        }
    }

    async fn run_cycle(
        &self,
        drained: HashMap<String, PendingIndicator>,
    ) -> Result<FlushStats, PipelineError> {
        let deps = &self.inner.deps;
        let mut indicators: Vec<ProcessIndicator> =
            drained.values().map(|p| p.indicator.clone()).collect();
        indicators.sort_by(|a, b| a.signal.time.cmp(&b.signal.time).then_with(|| a.id.cmp(&b.id)));

        let mut stats = FlushStats {
            indicators: indicators.len(),
            ..FlushStats::default()
        };

        deps.indicators
            .upsert_indicators(&indicators)
            .await
            .map_err(PipelineError::Persist)?;
        debug!(count = indicators.len(), "Persisted indicator batch");

        let deployment_ids: Vec<String> = indicators
            .iter()
            .map(|i| i.deployment_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut batch = deps
            .policies
            .compute_violations(
                LifecycleStage::Runtime,
                &DetectionScope::Deployments {
                    deployment_ids: deployment_ids.clone(),
                    indicators: indicators.clone(),
                },
            )
            .await?;

        let findings = self.check_baselines(&indicators).await;
        stats.baselines_created = findings.created;
        if !findings.candidates.is_empty() {
            debug!(
                candidates = findings.candidates.len(),
                "Evaluating processes outside locked baselines"
            );
            let baseline_alerts = deps
                .policies
                .compute_violations(
                    LifecycleStage::Runtime,
                    &DetectionScope::BaselineViolations {
                        indicators: findings.candidates,
                    },
                )
                .await?;
            batch.extend(baseline_alerts);
        }
        self.schedule_reprocessing(findings.reprocess_now.into_iter().collect(), None);
        self.schedule_reprocessing(
            findings.reprocess_after_lock.into_iter().collect(),
            Some(deps.baselines.auto_lock_duration()),
        );
        stats.alerts_detected = batch.len();

        let scope = AlertScope::for_deployments(LifecycleStage::Runtime, deployment_ids.clone());
        let outcome = deps.reconciler.reconcile(batch.clone(), &scope).await?;
        if let Err(errors) = deps.reconciler.persist(&outcome).await {
            warn!(error = %errors, "Some reconciled alerts could not be persisted");
        }
        stats.new_alerts = outcome.new.len();
        stats.updated_alerts = outcome.updated.len();
        stats.stale_alerts = outcome.stale.len();
        if outcome.has_changes() {
            self.schedule_reprocessing(deployment_ids, None);
        }

        let (dispatched, failed) = self.enforce(&batch, &drained).await;
        stats.enforcement_dispatched = dispatched;
        stats.enforcement_failed = failed;
        Ok(stats)
    }

    /// Consult the baseline of every (deployment, container) in the batch.
    ///
    /// Per-container failures are logged and leave that container out of this
    /// cycle's baseline evaluation.
    async fn check_baselines(&self, indicators: &[ProcessIndicator]) -> BaselineFindings {
        let mut groups: BTreeMap<BaselineKey, Vec<&ProcessIndicator>> = BTreeMap::new();
        for indicator in indicators {
            groups
                .entry(BaselineKey::for_indicator(indicator))
                .or_default()
                .push(indicator);
        }

        let mut findings = BaselineFindings::default();
        for (key, group) in groups {
            if let Err(e) = self.check_baseline(&key, &group, &mut findings).await {
                warn!(baseline = %key, error = %e, "Baseline check failed");
            }
        }
        findings
    }

    async fn check_baseline(
        &self,
        key: &BaselineKey,
        group: &[&ProcessIndicator],
        findings: &mut BaselineFindings,
    ) -> Result<(), BaselineError> {
        let baselines = &self.inner.deps.baselines;
        let items: BTreeSet<&str> = group.iter().map(|i| i.baseline_item()).collect();

        let Some(baseline) = baselines.get(key).await? else {
            baselines.upsert(key, items, true).await?;
            self.inner.deps.metrics.record_baseline_created();
            findings.created += 1;
            findings
                .reprocess_after_lock
                .insert(key.deployment_id.clone());
            debug!(baseline = %key, "Created baseline from observed processes");
            return Ok(());
        };

        let unseen: Vec<&ProcessIndicator> = group
            .iter()
            .copied()
            .filter(|i| !baseline.contains(i.baseline_item()))
            .collect();
        if unseen.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        if baseline.locked_under_mode(self.inner.violation_lock_mode, now) {
            findings
                .candidates
                .extend(unseen.into_iter().cloned());
        } else if baseline.is_rox_locked(now) || baseline.is_user_locked(now) {
            findings.reprocess_now.insert(key.deployment_id.clone());
        } else {
            let new_items: BTreeSet<&str> = unseen.iter().map(|i| i.baseline_item()).collect();
            baselines
                .update_elements(key, new_items, std::iter::empty::<&str>(), true)
                .await?;
            debug!(baseline = %key, "Added observed processes to unlocked baseline");
        }
        Ok(())
    }

    /// Fire-and-forget risk reprocessing, optionally delayed.
    fn schedule_reprocessing(&self, deployment_ids: Vec<String>, delay: Option<Duration>) {
        if deployment_ids.is_empty() {
            return;
        }
        let risk = Arc::clone(&self.inner.deps.risk);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = risk.reprocess_deployments(&deployment_ids).await {
                warn!(error = %e, deployments = deployment_ids.len(), "Risk reprocessing failed");
            }
        });
    }

    /// Dispatch kill directives for every process referenced by a kill-enforced
    /// alert through the agent that reported it. Returns (dispatched, failed).
    async fn enforce(
        &self,
        batch: &[Alert],
        drained: &HashMap<String, PendingIndicator>,
    ) -> (usize, usize) {
        let deps = &self.inner.deps;
        let mut dispatched = 0;
        let mut failed = 0;

        for alert in batch.iter().filter(|a| a.has_kill_enforcement()) {
            let Some(enforcement) = alert.enforcement.as_ref() else {
                continue;
            };
            for process in alert.processes() {
                let Some(pending) = drained.get(&process.id) else {
                    debug!(indicator_id = %process.id, "Indicator not in this flush; no origin agent");
                    continue;
                };
                let instance = match deps
                    .deployments
                    .find_container_instance(&process.deployment_id, &process.signal.container_id)
                    .await
                {
                    Ok(Some(instance)) => instance,
                    Ok(None) => {
                        debug!(
                            deployment_id = %process.deployment_id,
                            container_id = %process.signal.container_id,
                            "Container instance no longer running; skipping enforcement"
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!(indicator_id = %process.id, error = %e, "Container lookup failed");
                        deps.metrics.record_enforcement(false);
                        failed += 1;
                        continue;
                    }
                };

                let directive = EnforcementDirective {
                    action: enforcement.action,
                    alert_id: alert.id.clone(),
                    policy_id: alert.policy_id().to_owned(),
                    deployment_id: process.deployment_id.clone(),
                    container_instance_id: instance.instance_id,
                    pod_id: instance.pod_id,
                    indicator_id: process.id.clone(),
                };
                match pending.injector.inject(directive).await {
                    Ok(()) => {
                        deps.metrics.record_enforcement(true);
                        dispatched += 1;
                        info!(
                            agent_id = pending.injector.agent_id(),
                            indicator_id = %process.id,
                            "Dispatched enforcement"
                        );
                    }
                    Err(e) => {
                        deps.metrics.record_enforcement(false);
                        failed += 1;
                        warn!(
                            agent_id = pending.injector.agent_id(),
                            indicator_id = %process.id,
                            error = %e,
                            "Enforcement dispatch failed"
                        );
                    }
                }
            }
        }
        (dispatched, failed)
    }
}
