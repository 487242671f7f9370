#![allow(
    clippy::unwrap_used, // We allow unwraps in benchmarks
    clippy::expect_used, // We allow expects in benchmarks
    clippy::as_conversions,
    clippy::cast_lossless
)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use runwarden_lib::alerts::{AlertScope, merge_alerts};
use runwarden_lib::config::Config;
use runwarden_lib::detection::{
    AlertNotifier, BaselineResultsCleaner, ContainerInstance, DeploymentLookup, DetectionError,
    DetectionScope, PolicyEngine, RiskReprocessor,
};
use runwarden_lib::models::{
    Alert, DeploymentRef, LifecycleStage, PolicyRef, ProcessIndicator, ProcessSignal, Severity,
};
use runwarden_lib::storage::MemoryStorage;
use runwarden_lib::{Collaborators, Services};
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Collaborator that accepts everything and reports nothing.
struct Quiet;

#[async_trait]
impl PolicyEngine for Quiet {
    async fn compute_violations(
        &self,
        _stage: LifecycleStage,
        _scope: &DetectionScope,
    ) -> Result<Vec<Alert>, DetectionError> {
        Ok(Vec::new())
    }

    async fn policy_exists(&self, _policy_id: &str) -> Result<bool, DetectionError> {
        Ok(true)
    }

    async fn is_deployment_excluded(&self, _d: &str, _p: &str) -> Result<bool, DetectionError> {
        Ok(false)
    }
}

#[async_trait]
impl DeploymentLookup for Quiet {
    async fn is_inactive(&self, _deployment_id: &str) -> Result<bool, DetectionError> {
        Ok(false)
    }

    async fn find_container_instance(
        &self,
        _deployment_id: &str,
        _prefix: &str,
    ) -> Result<Option<ContainerInstance>, DetectionError> {
        Ok(None)
    }
}

#[async_trait]
impl AlertNotifier for Quiet {
    async fn notify(&self, _alert: &Alert) -> Result<(), DetectionError> {
        Ok(())
    }
}

#[async_trait]
impl RiskReprocessor for Quiet {
    async fn reprocess_deployments(&self, _ids: &[String]) -> Result<(), DetectionError> {
        Ok(())
    }
}

#[async_trait]
impl BaselineResultsCleaner for Quiet {
    async fn remove_results_for_deployment(&self, _id: &str) -> Result<(), DetectionError> {
        Ok(())
    }
}

fn collaborators() -> Collaborators {
    let quiet = Arc::new(Quiet);
    Collaborators {
        policies: quiet.clone(),
        deployments: quiet.clone(),
        notifier: quiet.clone(),
        risk: quiet.clone(),
        baseline_results: quiet,
    }
}

fn process(id: usize, deployment: &str, secs: i64) -> ProcessIndicator {
    ProcessIndicator {
        id: format!("{deployment}-{id}"),
        deployment_id: deployment.to_owned(),
        container_name: "web".to_owned(),
        cluster_id: "cluster-1".to_owned(),
        namespace: "prod".to_owned(),
        pod_id: None,
        signal: ProcessSignal {
            process_name: "sh".to_owned(),
            exec_file_path: "/bin/sh".to_owned(),
            args: format!("-c job-{id}"),
            uid: 0,
            time: Utc.timestamp_opt(secs, 0).unwrap(),
            container_id: "0123456789abcdef".to_owned(),
        },
    }
}

fn runtime_alert(deployment: &str, processes: Vec<ProcessIndicator>) -> Alert {
    Alert::new(
        PolicyRef::new("policy-1", "Shell Spawned", Severity::High),
        DeploymentRef::new(deployment, deployment),
        LifecycleStage::Runtime,
    )
    .with_processes(processes)
}

/// Merge a fresh detection into an alert already holding processes.
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_alerts");

    for existing in [1_usize, 10, 39] {
        let old = runtime_alert(
            "dep-1",
            (0..existing).map(|i| process(i, "dep-1", i as i64)).collect(),
        );
        let new = runtime_alert(
            "dep-1",
            (0..40).map(|i| process(i + 100, "dep-1", 1_000 + i as i64)).collect(),
        );
        group.bench_with_input(BenchmarkId::new("runtime", existing), &existing, |b, _| {
            b.iter(|| black_box(merge_alerts(&old, new.clone(), 40)));
        });
    }

    group.finish();
}

/// Reconcile a batch against a store already holding one active alert per
/// deployment, half of which are reproduced.
fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");
    let rt = Runtime::new().expect("Failed to create runtime");

    for deployments in [10_usize, 100, 1000] {
        let services = Services::new(
            &Config::default(),
            Arc::new(MemoryStorage::new()),
            collaborators(),
        );
        let ids: Vec<String> = (0..deployments).map(|i| format!("dep-{i}")).collect();
        let seeded: Vec<Alert> = ids
            .iter()
            .map(|id| runtime_alert(id, vec![process(0, id, 1)]))
            .collect();
        rt.block_on(services.alerts.upsert_alerts(seeded))
            .expect("Failed to seed alerts");

        let batch: Vec<Alert> = ids
            .iter()
            .step_by(2)
            .map(|id| runtime_alert(id, vec![process(1, id, 2)]))
            .collect();
        let scope = AlertScope::for_deployments(LifecycleStage::Runtime, ids.clone());

        group.bench_with_input(
            BenchmarkId::new("classify", deployments),
            &deployments,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    let outcome = services
                        .reconciler
                        .reconcile(batch.clone(), &scope)
                        .await
                        .expect("Failed to reconcile");
                    black_box(outcome)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_merge, bench_reconcile);
criterion_main!(benches);
