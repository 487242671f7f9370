//! Persistence interfaces and backends.
//!
//! The stores in this crate only need key-value access by id plus a
//! structured scan, so persistence is expressed as three narrow async traits.
//! Two backends implement all of them: [`MemoryStorage`] for tests and
//! ephemeral agents, and [`RedbStorage`] for durable single-node use.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Alert, LifecycleStage, ProcessBaseline, ProcessIndicator, ViolationState};

pub mod memory;
pub mod redb_store;

pub use memory::MemoryStorage;
pub use redb_store::RedbStorage;

/// Database operation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    #[error("Database open error: {0}")]
    DatabaseOpen(#[from] redb::DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Permission denied: {operation} is not allowed on a read-only store")]
    PermissionDenied { operation: &'static str },

    #[error("Blocking storage task failed: {0}")]
    Task(String),

    #[error("{operation} {key}: {source}")]
    Context {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Wrap with the operation and key that failed; the kind is preserved.
    pub fn context(self, operation: &'static str, key: impl Into<String>) -> Self {
        Self::Context {
            operation,
            key: key.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error (or the error it wraps) is a permission failure.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::PermissionDenied { .. } => true,
            Self::Context { source, .. } => source.is_permission_denied(),
            _ => false,
        }
    }
}

/// Structured alert search.
///
/// Every `Some` field narrows the result; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertQuery {
    pub states: Option<Vec<ViolationState>>,
    pub lifecycle_stage: Option<LifecycleStage>,
    pub deployment_ids: Option<Vec<String>>,
    pub policy_id: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AlertQuery {
    /// All alerts in the `Active` state.
    pub fn active() -> Self {
        Self {
            states: Some(vec![ViolationState::Active]),
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: LifecycleStage) -> Self {
        self.lifecycle_stage = Some(stage);
        self
    }

    pub fn with_deployments<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deployment_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        self.states
            .as_ref()
            .is_none_or(|states| states.contains(&alert.state))
            && self
                .lifecycle_stage
                .is_none_or(|stage| stage == alert.lifecycle_stage)
            && self
                .deployment_ids
                .as_ref()
                .is_none_or(|ids| ids.iter().any(|id| id == alert.deployment_id()))
            && self
                .policy_id
                .as_ref()
                .is_none_or(|id| id == alert.policy_id())
    }

    /// Filter, order newest first (ties broken by id) and paginate.
    pub fn apply<I>(&self, alerts: I) -> Vec<Alert>
    where
        I: IntoIterator<Item = Alert>,
    {
        let mut matched: Vec<Alert> = alerts.into_iter().filter(|a| self.matches(a)).collect();
        matched.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.id.cmp(&b.id)));
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Alert persistence.
#[async_trait]
pub trait AlertStorage: Send + Sync {
    async fn get_alert(&self, id: &str) -> Result<Option<Alert>, StorageError>;

    async fn upsert_alert(&self, alert: &Alert) -> Result<(), StorageError>;

    /// Returns whether an alert was removed.
    async fn delete_alert(&self, id: &str) -> Result<bool, StorageError>;

    async fn search_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>, StorageError>;

    /// Number of alerts matching the query, ignoring pagination.
    async fn count_alerts(&self, query: &AlertQuery) -> Result<usize, StorageError>;
}

/// Process baseline persistence.
#[async_trait]
pub trait BaselineStorage: Send + Sync {
    async fn get_baseline(&self, id: &str) -> Result<Option<ProcessBaseline>, StorageError>;

    async fn upsert_baseline(&self, baseline: &ProcessBaseline) -> Result<(), StorageError>;

    /// Returns whether a baseline was removed.
    async fn delete_baseline(&self, id: &str) -> Result<bool, StorageError>;

    async fn baselines_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<ProcessBaseline>, StorageError>;
}

/// Process indicator persistence.
#[async_trait]
pub trait IndicatorStorage: Send + Sync {
    /// Insert or replace a batch of indicators by id.
    async fn upsert_indicators(&self, indicators: &[ProcessIndicator]) -> Result<(), StorageError>;

    async fn get_indicator(&self, id: &str) -> Result<Option<ProcessIndicator>, StorageError>;

    async fn indicators_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<ProcessIndicator>, StorageError>;
}
