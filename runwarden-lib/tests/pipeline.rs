//! Indicator flush pipeline behaviour: baseline consultation, violation
//! detection, enforcement dispatch and flush coordination.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use async_trait::async_trait;
use common::{
    BASELINE_POLICY, FakeDeployments, FakePolicyEngine, Fakes, KILL_POLICY, RecordingInjector,
    indicator,
};
use runwarden_lib::Services;
use runwarden_lib::config::Config;
use runwarden_lib::detection::{DetectionError, DetectionScope, PolicyEngine};
use runwarden_lib::models::{Alert, BaselineKey, EnforcementAction, LifecycleStage, LockMode};
use runwarden_lib::pipeline::{FlushReport, FlushStats, PipelineError};
use runwarden_lib::storage::{AlertQuery, IndicatorStorage, MemoryStorage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_test::traced_test;

/// Config whose rate limiter never admits an immediate flush, so tests decide
/// when cycles run.
fn manual_config() -> Config {
    let mut config = Config::default();
    config.pipeline.flush_burst = 0;
    config.pipeline.flush_rate_limit_interval_ms = 3_600_000;
    config
}

fn build(config: &Config, fakes: &Fakes) -> (Services, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let services = Services::new(config, Arc::clone(&storage), fakes.collaborators());
    (services, storage)
}

fn web_key() -> BaselineKey {
    BaselineKey::new("dep-1", "web", "cluster-1", "prod")
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn completed(services: &Services) -> FlushStats {
    match services.pipeline.flush().await.expect("Flush failed") {
        FlushReport::Completed(stats) => stats,
        FlushReport::Skipped => panic!("flush unexpectedly skipped"),
    }
}

#[tokio::test]
async fn test_first_observation_creates_auto_locking_baseline() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let (services, _) = build(&manual_config(), &fakes);
    let agent = RecordingInjector::new("agent-1");

    for (id, path, t) in [("i1", "/bin/sh", 1), ("i2", "/usr/bin/python", 2)] {
        services
            .pipeline
            .submit_indicator(indicator(id, "dep-1", "web", path, t), agent.clone())
            .expect("Failed to submit indicator");
    }
    assert_eq!(services.pipeline.pending_len(), 2);

    let stats = completed(&services).await;
    assert_eq!(stats.indicators, 2);
    assert_eq!(stats.baselines_created, 1);
    assert_eq!(stats.alerts_detected, 0);
    assert_eq!(services.pipeline.pending_len(), 0);

    let baseline = services
        .baselines
        .get(&web_key())
        .await
        .expect("get")
        .expect("baseline created");
    assert!(baseline.contains("/bin/sh"));
    assert!(baseline.contains("/usr/bin/python"));
    assert!(baseline.elements.values().all(|e| e.auto));
    assert!(!baseline.is_rox_locked(chrono::Utc::now()));
    assert!(baseline.stack_rox_locked_timestamp.is_some());
    assert!(fakes.engine.baseline_calls.lock().unwrap().is_empty());
    assert_eq!(services.metrics.snapshot().baselines_created, 1);
}

#[tokio::test]
async fn test_unlocked_baseline_absorbs_new_process() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let (services, _) = build(&manual_config(), &fakes);
    services
        .baselines
        .upsert(&web_key(), ["/bin/sh"], true)
        .await
        .expect("Failed to create baseline");

    services
        .pipeline
        .submit_indicator(
            indicator("i1", "dep-1", "web", "/usr/bin/curl", 5),
            RecordingInjector::new("agent-1"),
        )
        .expect("Failed to submit indicator");
    let stats = completed(&services).await;
    assert_eq!(stats.baselines_created, 0);
    assert_eq!(stats.new_alerts, 0);

    let baseline = services
        .baselines
        .get(&web_key())
        .await
        .expect("get")
        .expect("baseline exists");
    assert!(baseline.contains("/usr/bin/curl"));
    assert!(fakes.engine.baseline_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_user_locked_baseline_raises_violation() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let (services, _) = build(&manual_config(), &fakes);
    services
        .baselines
        .upsert(&web_key(), ["/bin/sh"], true)
        .await
        .expect("Failed to create baseline");
    services
        .baselines
        .user_lock(&web_key(), true)
        .await
        .expect("Failed to lock baseline");

    let agent = RecordingInjector::new("agent-1");
    for (id, path) in [("i1", "/bin/sh"), ("i2", "/usr/bin/curl")] {
        services
            .pipeline
            .submit_indicator(indicator(id, "dep-1", "web", path, 7), agent.clone())
            .expect("Failed to submit indicator");
    }
    let stats = completed(&services).await;
    assert_eq!(stats.new_alerts, 1);
    assert_eq!(stats.alerts_detected, 1);

    assert_eq!(
        *fakes.engine.baseline_calls.lock().unwrap(),
        vec![vec!["i2".to_owned()]]
    );
    let alerts = services
        .alerts
        .list_alerts(&AlertQuery::active().with_policy(BASELINE_POLICY))
        .await
        .expect("list");
    assert_eq!(alerts.len(), 1);
    let ids: Vec<&str> = alerts[0].processes().iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["i2"]);

    let baseline = services
        .baselines
        .get(&web_key())
        .await
        .expect("get")
        .expect("baseline exists");
    assert!(!baseline.contains("/usr/bin/curl"), "locked baseline must not grow");
    assert_eq!(fakes.notifier.notified.lock().unwrap().len(), 1);

    eventually("risk reprocessing", || {
        fakes.reprocessed_deployments().contains_key("dep-1")
    })
    .await;
}

#[tokio::test]
async fn test_lock_outside_violation_mode_only_reprocesses_risk() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let mut config = manual_config();
    config.baseline.auto_lock_duration_secs = 0;
    config.baseline.violation_lock_mode = LockMode::UserLocked;
    let (services, _) = build(&config, &fakes);
    services
        .baselines
        .upsert(&web_key(), ["/bin/sh"], true)
        .await
        .expect("Failed to create baseline");

    services
        .pipeline
        .submit_indicator(
            indicator("i1", "dep-1", "web", "/usr/bin/curl", 9),
            RecordingInjector::new("agent-1"),
        )
        .expect("Failed to submit indicator");
    let stats = completed(&services).await;
    assert_eq!(stats.alerts_detected, 0);
    assert!(fakes.engine.baseline_calls.lock().unwrap().is_empty());

    let baseline = services
        .baselines
        .get(&web_key())
        .await
        .expect("get")
        .expect("baseline exists");
    assert!(!baseline.contains("/usr/bin/curl"));

    eventually("risk reprocessing", || {
        fakes.reprocessed_deployments().contains_key("dep-1")
    })
    .await;
}

#[tokio::test]
#[traced_test]
async fn test_kill_enforcement_reaches_reporting_agent() {
    let fakes = Fakes::new(FakePolicyEngine::flagging("/usr/bin/nc"), FakeDeployments::default());
    let (services, _) = build(&manual_config(), &fakes);
    let agent = RecordingInjector::new("agent-1");
    let bystander = RecordingInjector::new("agent-2");

    services
        .pipeline
        .submit_indicator(indicator("i1", "dep-1", "web", "/usr/bin/nc", 3), agent.clone())
        .expect("Failed to submit indicator");
    services
        .pipeline
        .submit_indicator(indicator("i2", "dep-2", "api", "/bin/sh", 3), bystander.clone())
        .expect("Failed to submit indicator");

    let stats = completed(&services).await;
    assert_eq!(stats.enforcement_dispatched, 1);
    assert_eq!(stats.enforcement_failed, 0);

    let received = agent.received();
    assert_eq!(received.len(), 1);
    let directive = &received[0];
    assert_eq!(directive.action, EnforcementAction::KillPod);
    assert_eq!(directive.policy_id, KILL_POLICY);
    assert_eq!(directive.deployment_id, "dep-1");
    assert_eq!(directive.indicator_id, "i1");
    assert_eq!(directive.pod_id, "dep-1-pod");
    assert!(bystander.received().is_empty());

    let stored: Vec<Alert> = services
        .alerts
        .list_alerts(&AlertQuery::active().with_policy(KILL_POLICY))
        .await
        .expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(directive.alert_id, stored[0].id);
    assert!(logs_contain("Dispatched enforcement"));
    assert_eq!(services.metrics.snapshot().enforcement_dispatched, 1);
}

#[tokio::test]
#[traced_test]
async fn test_failed_enforcement_is_counted_not_fatal() {
    let fakes = Fakes::new(FakePolicyEngine::flagging("/usr/bin/nc"), FakeDeployments::default());
    let (services, _) = build(&manual_config(), &fakes);

    services
        .pipeline
        .submit_indicator(
            indicator("i1", "dep-1", "web", "/usr/bin/nc", 3),
            RecordingInjector::failing("agent-1"),
        )
        .expect("Failed to submit indicator");

    let stats = completed(&services).await;
    assert_eq!(stats.enforcement_dispatched, 0);
    assert_eq!(stats.enforcement_failed, 1);
    assert_eq!(stats.new_alerts, 1);
    assert!(logs_contain("Enforcement dispatch failed"));
    assert_eq!(services.metrics.snapshot().enforcement_failures, 1);
}

#[tokio::test]
async fn test_enforcement_skips_vanished_container() {
    let mut deployments = FakeDeployments::default();
    deployments
        .gone_containers
        .insert("dep-1web0123456789".to_owned());
    let fakes = Fakes::new(FakePolicyEngine::flagging("/usr/bin/nc"), deployments);
    let (services, _) = build(&manual_config(), &fakes);
    let agent = RecordingInjector::new("agent-1");

    services
        .pipeline
        .submit_indicator(indicator("i1", "dep-1", "web", "/usr/bin/nc", 3), agent.clone())
        .expect("Failed to submit indicator");

    let stats = completed(&services).await;
    assert_eq!(stats.enforcement_dispatched, 0);
    assert_eq!(stats.enforcement_failed, 0);
    assert!(agent.received().is_empty());
}

#[tokio::test]
async fn test_resubmitted_indicator_replaces_pending_entry() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let (services, storage) = build(&manual_config(), &fakes);
    let agent = RecordingInjector::new("agent-1");

    services
        .pipeline
        .submit_indicator(indicator("i1", "dep-1", "web", "/bin/sh", 1), agent.clone())
        .expect("Failed to submit indicator");
    services
        .pipeline
        .submit_indicator(indicator("i1", "dep-1", "web", "/bin/bash", 2), agent.clone())
        .expect("Failed to submit indicator");
    assert_eq!(services.pipeline.pending_len(), 1);

    let stats = completed(&services).await;
    assert_eq!(stats.indicators, 1);
    let stored = storage
        .get_indicator("i1")
        .await
        .expect("get")
        .expect("indicator persisted");
    assert_eq!(stored.signal.exec_file_path, "/bin/bash");
    assert_eq!(services.metrics.snapshot().indicators_submitted, 2);
}

#[tokio::test]
async fn test_invalid_indicator_rejected() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let (services, _) = build(&manual_config(), &fakes);

    let mut bad = indicator("i1", "dep-1", "web", "/bin/sh", 1);
    bad.deployment_id.clear();
    let result = services
        .pipeline
        .submit_indicator(bad, RecordingInjector::new("agent-1"));
    assert!(matches!(result, Err(PipelineError::InvalidIndicator(_))));
    assert_eq!(services.pipeline.pending_len(), 0);
}

#[tokio::test]
async fn test_empty_flush_is_not_a_cycle() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let (services, _) = build(&manual_config(), &fakes);

    assert_eq!(completed(&services).await, FlushStats::default());
    assert_eq!(services.metrics.snapshot().flush_cycles, 0);
}

/// Engine that parks inside detection until released.
struct ParkedEngine {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl PolicyEngine for ParkedEngine {
    async fn compute_violations(
        &self,
        _stage: LifecycleStage,
        _scope: &DetectionScope,
    ) -> Result<Vec<Alert>, DetectionError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }

    async fn policy_exists(&self, _policy_id: &str) -> Result<bool, DetectionError> {
        Ok(true)
    }

    async fn is_deployment_excluded(
        &self,
        _deployment_id: &str,
        _policy_id: &str,
    ) -> Result<bool, DetectionError> {
        Ok(false)
    }
}

#[tokio::test]
#[traced_test]
async fn test_concurrent_flush_is_skipped_and_pending_survives() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut collaborators = fakes.collaborators();
    collaborators.policies = Arc::new(ParkedEngine {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    });
    let services = Services::new(
        &manual_config(),
        Arc::new(MemoryStorage::new()),
        collaborators,
    );
    let agent = RecordingInjector::new("agent-1");

    services
        .pipeline
        .submit_indicator(indicator("i1", "dep-1", "web", "/bin/sh", 1), agent.clone())
        .expect("Failed to submit indicator");

    let pipeline = services.pipeline.clone();
    let in_flight = tokio::spawn(async move { pipeline.flush().await });
    entered.notified().await;

    services
        .pipeline
        .submit_indicator(indicator("i2", "dep-1", "web", "/bin/ls", 2), agent.clone())
        .expect("Failed to submit indicator");
    assert_eq!(
        services.pipeline.flush().await.expect("flush"),
        FlushReport::Skipped
    );
    assert!(logs_contain("Flush already in progress"));

    release.notify_one();
    let report = in_flight.await.expect("join").expect("flush");
    match report {
        FlushReport::Completed(stats) => assert_eq!(stats.indicators, 1),
        FlushReport::Skipped => panic!("first flush should have run"),
    }
    assert_eq!(services.pipeline.pending_len(), 1);

    release.notify_one();
    services.pipeline.drain().await.expect("drain");
    assert_eq!(services.pipeline.pending_len(), 0);

    let snapshot = services.metrics.snapshot();
    assert_eq!(snapshot.flush_skipped, 1);
    assert_eq!(snapshot.flush_cycles, 2);
    assert_eq!(snapshot.indicators_flushed, 2);
}

#[tokio::test]
async fn test_submission_triggers_immediate_flush() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let (services, _) = build(&Config::default(), &fakes);

    services
        .pipeline
        .submit_indicator(
            indicator("i1", "dep-1", "web", "/bin/sh", 1),
            RecordingInjector::new("agent-1"),
        )
        .expect("Failed to submit indicator");

    let metrics = services.metrics.clone();
    eventually("triggered flush", || metrics.snapshot().flush_cycles == 1).await;
    assert_eq!(services.pipeline.pending_len(), 0);
}

#[tokio::test]
async fn test_run_flushes_periodically_and_drains_on_shutdown() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let mut config = manual_config();
    config.pipeline.periodic_flush_interval_ms = 20;
    let (services, _) = build(&config, &fakes);
    let agent = RecordingInjector::new("agent-1");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let pipeline = services.pipeline.clone();
    let runner = tokio::spawn(async move {
        pipeline
            .run(async move {
                let _ = stop_rx.await;
            })
            .await;
    });

    services
        .pipeline
        .submit_indicator(indicator("i1", "dep-1", "web", "/bin/sh", 1), agent.clone())
        .expect("Failed to submit indicator");
    let pipeline = services.pipeline.clone();
    eventually("periodic flush", || pipeline.pending_len() == 0).await;

    services
        .pipeline
        .submit_indicator(indicator("i2", "dep-1", "web", "/bin/ls", 2), agent.clone())
        .expect("Failed to submit indicator");
    stop_tx.send(()).expect("runner alive");
    runner.await.expect("runner join");

    assert_eq!(services.pipeline.pending_len(), 0);
    assert_eq!(services.metrics.snapshot().indicators_flushed, 2);
}

#[tokio::test]
async fn test_run_with_zero_period_still_flushes() {
    let fakes = Fakes::new(FakePolicyEngine::default(), FakeDeployments::default());
    let mut config = manual_config();
    config.pipeline.periodic_flush_interval_ms = 0;
    let (services, _) = build(&config, &fakes);
    let agent = RecordingInjector::new("agent-1");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let pipeline = services.pipeline.clone();
    let runner = tokio::spawn(async move {
        pipeline
            .run(async move {
                let _ = stop_rx.await;
            })
            .await;
    });

    services
        .pipeline
        .submit_indicator(indicator("i1", "dep-1", "web", "/bin/sh", 1), agent)
        .expect("Failed to submit indicator");
    let pipeline = services.pipeline.clone();
    eventually("periodic flush", || pipeline.pending_len() == 0).await;

    stop_tx.send(()).expect("runner alive");
    runner.await.expect("runner join");
    assert_eq!(services.metrics.snapshot().indicators_flushed, 1);
}
