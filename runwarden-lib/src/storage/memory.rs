//! In-process storage backend.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{AlertQuery, AlertStorage, BaselineStorage, IndicatorStorage, StorageError};
use crate::models::{Alert, ProcessBaseline, ProcessIndicator};

/// Hash-map backed storage. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    alerts: RwLock<HashMap<String, Alert>>,
    baselines: RwLock<HashMap<String, ProcessBaseline>>,
    indicators: RwLock<HashMap<String, ProcessIndicator>>,
    read_only: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects every write with `PermissionDenied`.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    fn check_writable(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::PermissionDenied { operation });
        }
        Ok(())
    }
}

#[async_trait]
impl AlertStorage for MemoryStorage {
    async fn get_alert(&self, id: &str) -> Result<Option<Alert>, StorageError> {
        Ok(self.alerts.read().await.get(id).cloned())
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        self.check_writable("upsert_alert")?;
        self.alerts
            .write()
            .await
            .insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn delete_alert(&self, id: &str) -> Result<bool, StorageError> {
        self.check_writable("delete_alert")?;
        Ok(self.alerts.write().await.remove(id).is_some())
    }

    async fn search_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>, StorageError> {
        let alerts = self.alerts.read().await;
        Ok(query.apply(alerts.values().cloned()))
    }

    async fn count_alerts(&self, query: &AlertQuery) -> Result<usize, StorageError> {
        let alerts = self.alerts.read().await;
        Ok(alerts.values().filter(|a| query.matches(a)).count())
    }
}

#[async_trait]
impl BaselineStorage for MemoryStorage {
    async fn get_baseline(&self, id: &str) -> Result<Option<ProcessBaseline>, StorageError> {
        Ok(self.baselines.read().await.get(id).cloned())
    }

    async fn upsert_baseline(&self, baseline: &ProcessBaseline) -> Result<(), StorageError> {
        self.check_writable("upsert_baseline")?;
        self.baselines
            .write()
            .await
            .insert(baseline.id.clone(), baseline.clone());
        Ok(())
    }

    async fn delete_baseline(&self, id: &str) -> Result<bool, StorageError> {
        self.check_writable("delete_baseline")?;
        Ok(self.baselines.write().await.remove(id).is_some())
    }

    async fn baselines_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<ProcessBaseline>, StorageError> {
        let baselines = self.baselines.read().await;
        let mut matched: Vec<ProcessBaseline> = baselines
            .values()
            .filter(|b| b.key.deployment_id == deployment_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }
}

#[async_trait]
impl IndicatorStorage for MemoryStorage {
    async fn upsert_indicators(&self, indicators: &[ProcessIndicator]) -> Result<(), StorageError> {
        self.check_writable("upsert_indicators")?;
        let mut table = self.indicators.write().await;
        for indicator in indicators {
            table.insert(indicator.id.clone(), indicator.clone());
        }
        Ok(())
    }

    async fn get_indicator(&self, id: &str) -> Result<Option<ProcessIndicator>, StorageError> {
        Ok(self.indicators.read().await.get(id).cloned())
    }

    async fn indicators_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<ProcessIndicator>, StorageError> {
        let indicators = self.indicators.read().await;
        let mut matched: Vec<ProcessIndicator> = indicators
            .values()
            .filter(|i| i.deployment_id == deployment_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.signal.time.cmp(&b.signal.time).then_with(|| a.id.cmp(&b.id)));
        Ok(matched)
    }
}
