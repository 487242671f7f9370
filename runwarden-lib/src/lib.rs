#![forbid(unsafe_code)]

//! runwarden-lib: alert reconciliation and process baselines for runtime
//! workload monitoring.
//!
//! This library provides:
//! - Alert storage, merging and reconciliation against detection output
//! - Per-container process baselines with lock and graveyard semantics
//! - The batched indicator flush pipeline that drives both
//! - Concurrency primitives: keyed exclusion, a try-gate, bounded fan-out
//! - Configuration management with hierarchical overrides
//! - Memory and redb storage backends
//!
//! [`Services`] wires everything together from a [`config::Config`] and the
//! external collaborators in [`detection`].

use std::sync::Arc;

pub mod alerts;
pub mod baseline;
pub mod config;
pub mod detection;
pub mod enforcement;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod rate_limiter;
pub mod storage;
pub mod sync;
pub mod telemetry;

use alerts::{AlertStore, Reconciler};
use baseline::BaselineStore;
use config::Config;
use detection::{
    AlertNotifier, BaselineResultsCleaner, DeploymentLookup, PolicyEngine, RiskReprocessor,
};
use pipeline::{IndicatorPipeline, PipelineDeps};
use storage::{
    AlertStorage, BaselineStorage, IndicatorStorage, MemoryStorage, RedbStorage, StorageError,
};
use telemetry::PipelineMetrics;

/// External collaborators the services depend on.
#[derive(Clone)]
pub struct Collaborators {
    pub policies: Arc<dyn PolicyEngine>,
    pub deployments: Arc<dyn DeploymentLookup>,
    pub notifier: Arc<dyn AlertNotifier>,
    pub risk: Arc<dyn RiskReprocessor>,
    pub baseline_results: Arc<dyn BaselineResultsCleaner>,
}

/// Composition root: every store and the pipeline, sharing one storage
/// backend and one set of collaborators.
#[derive(Clone)]
pub struct Services {
    pub alerts: AlertStore,
    pub baselines: BaselineStore,
    pub reconciler: Reconciler,
    pub pipeline: IndicatorPipeline,
    pub metrics: Arc<PipelineMetrics>,
}

impl Services {
    /// Build the services over an explicit storage backend.
    pub fn new<S>(config: &Config, storage: Arc<S>, collaborators: Collaborators) -> Self
    where
        S: AlertStorage + BaselineStorage + IndicatorStorage + 'static,
    {
        let alert_storage: Arc<dyn AlertStorage> = storage.clone();
        let baseline_storage: Arc<dyn BaselineStorage> = storage.clone();
        let indicator_storage: Arc<dyn IndicatorStorage> = storage;

        let alerts = AlertStore::new(
            alert_storage,
            config.alerts.max_alerts_per_list,
            config.alerts.fan_out_concurrency,
        );
        let baselines = BaselineStore::new(
            baseline_storage,
            Arc::clone(&collaborators.baseline_results),
            config.baseline.auto_lock_duration(),
        );
        let reconciler = Reconciler::new(
            alerts.clone(),
            Arc::clone(&collaborators.policies),
            Arc::clone(&collaborators.deployments),
            Arc::clone(&collaborators.notifier),
            config.alerts.max_process_violations_per_alert,
            config.alerts.fan_out_concurrency,
        );
        let metrics = Arc::new(PipelineMetrics::new());
        let pipeline = IndicatorPipeline::new(
            &config.pipeline,
            config.baseline.violation_lock_mode,
            PipelineDeps {
                indicators: indicator_storage,
                baselines: baselines.clone(),
                reconciler: reconciler.clone(),
                policies: collaborators.policies,
                deployments: collaborators.deployments,
                risk: collaborators.risk,
                metrics: Arc::clone(&metrics),
            },
        );

        Self {
            alerts,
            baselines,
            reconciler,
            pipeline,
            metrics,
        }
    }

    /// Build the services over the backend named by `config.database`: redb
    /// when a path is set, in-memory otherwise.
    pub fn from_config(config: &Config, collaborators: Collaborators) -> Result<Self, StorageError> {
        match &config.database.path {
            Some(path) => {
                let storage = RedbStorage::open(path, config.database.read_only)?;
                Ok(Self::new(config, Arc::new(storage), collaborators))
            }
            None => {
                let storage = if config.database.read_only {
                    MemoryStorage::read_only()
                } else {
                    MemoryStorage::new()
                };
                Ok(Self::new(config, Arc::new(storage), collaborators))
            }
        }
    }
}
