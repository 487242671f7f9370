//! Alert store.
//!
//! Writers of a single alert id are serialized through a keyed lock; batch
//! writes fan out one task per alert and report every failure together.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorList;
use crate::models::{Alert, AlertError, ViolationState};
use crate::storage::{AlertQuery, AlertStorage, StorageError};
use crate::sync::{KeyedMutex, fan_out};

/// Alert store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AlertStoreError {
    #[error("Invalid alert: {0}")]
    Validation(#[from] AlertError),

    #[error("Invalid request for alert {id}: {reason}")]
    InvalidRequest { id: String, reason: String },

    #[error("Alert storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AlertStoreError {
    fn invalid(id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            id: id.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Keyed-exclusive access to persisted alerts.
#[derive(Clone)]
pub struct AlertStore {
    storage: Arc<dyn AlertStorage>,
    locks: KeyedMutex,
    max_alerts_per_list: usize,
    fan_out_concurrency: usize,
}

impl AlertStore {
    pub fn new(
        storage: Arc<dyn AlertStorage>,
        max_alerts_per_list: usize,
        fan_out_concurrency: usize,
    ) -> Self {
        Self {
            storage,
            locks: KeyedMutex::new(),
            max_alerts_per_list,
            fan_out_concurrency,
        }
    }

    pub async fn get_alert(&self, id: &str) -> Result<Option<Alert>, AlertStoreError> {
        Ok(self.storage.get_alert(id).await?)
    }

    /// One page of matching alerts; the page size never exceeds the
    /// configured list cap.
    pub async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>, AlertStoreError> {
        let mut capped = query.clone();
        capped.limit = Some(
            query
                .limit
                .map_or(self.max_alerts_per_list, |l| l.min(self.max_alerts_per_list)),
        );
        Ok(self.storage.search_alerts(&capped).await?)
    }

    pub async fn count_alerts(&self, query: &AlertQuery) -> Result<usize, AlertStoreError> {
        Ok(self.storage.count_alerts(query).await?)
    }

    /// Every matching alert, without the list cap. Used by reconciliation,
    /// which must see the whole previous set.
    pub async fn search_all(&self, query: &AlertQuery) -> Result<Vec<Alert>, StorageError> {
        let mut unpaged = query.clone();
        unpaged.offset = 0;
        unpaged.limit = None;
        self.storage.search_alerts(&unpaged).await
    }

    /// Insert or replace one alert.
    pub async fn upsert_alert(&self, alert: &Alert) -> Result<(), AlertStoreError> {
        alert.validate()?;
        let _guard = self.locks.acquire(&alert.id).await;
        self.storage.upsert_alert(alert).await?;
        debug!(alert_id = %alert.id, state = %alert.state, "Upserted alert");
        Ok(())
    }

    /// Upsert a batch in parallel. Successful writes stay committed even when
    /// others fail.
    pub async fn upsert_alerts(&self, alerts: Vec<Alert>) -> Result<(), ErrorList> {
        let report = fan_out(
            "upserting alerts",
            alerts,
            self.fan_out_concurrency,
            |alert| alert.id.clone(),
            |alert| {
                let store = self.clone();
                async move { store.upsert_alert(&alert).await }
            },
        )
        .await;
        report.into_result().map(|_| ())
    }

    /// Mark an alert resolved. Resolving a resolved alert changes nothing.
    pub async fn resolve_alert(&self, id: &str) -> Result<Option<Alert>, AlertStoreError> {
        self.modify(id, |alert| {
            if alert.state == ViolationState::Resolved {
                return Ok(false);
            }
            alert.resolve(Utc::now());
            Ok(true)
        })
        .await
    }

    pub async fn resolve_alerts(&self, ids: Vec<String>) -> Result<Vec<Alert>, ErrorList> {
        let report = fan_out(
            "resolving alerts",
            ids,
            self.fan_out_concurrency,
            String::clone,
            |id| {
                let store = self.clone();
                async move {
                    store.resolve_alert(&id).await.and_then(|found| {
                        found.ok_or_else(|| AlertStoreError::invalid(&id, "alert does not exist"))
                    })
                }
            },
        )
        .await;
        report.into_result()
    }

    /// Snooze an active alert until `until`.
    pub async fn snooze_alert(
        &self,
        id: &str,
        until: DateTime<Utc>,
    ) -> Result<Option<Alert>, AlertStoreError> {
        if until <= Utc::now() {
            return Err(AlertStoreError::invalid(id, "snooze time must be in the future"));
        }
        self.modify(id, |alert| {
            if alert.state == ViolationState::Resolved {
                return Err(AlertStoreError::invalid(&alert.id, "cannot snooze a resolved alert"));
            }
            alert.state = ViolationState::Snoozed;
            alert.snooze_till = Some(until);
            Ok(true)
        })
        .await
    }

    pub async fn add_tags(&self, id: &str, tags: &[String]) -> Result<Option<Alert>, AlertStoreError> {
        self.modify(id, |alert| {
            let before = alert.tags.clone();
            alert.add_tags(tags.iter().cloned());
            Ok(alert.tags != before)
        })
        .await
    }

    pub async fn remove_tags(
        &self,
        id: &str,
        tags: &[String],
    ) -> Result<Option<Alert>, AlertStoreError> {
        self.modify(id, |alert| {
            let before = alert.tags.len();
            alert.remove_tags(tags);
            Ok(alert.tags.len() != before)
        })
        .await
    }

    /// Administrative pruning of resolved alerts. The query must be restricted
    /// to the resolved state.
    pub async fn delete_alerts(&self, query: &AlertQuery) -> Result<usize, AlertStoreError> {
        let resolved_only = query
            .states
            .as_ref()
            .is_some_and(|s| !s.is_empty() && s.iter().all(|st| *st == ViolationState::Resolved));
        if !resolved_only {
            return Err(AlertStoreError::invalid(
                "*",
                "only resolved alerts can be deleted",
            ));
        }

        let doomed = self.search_all(query).await?;
        let mut deleted = 0;
        for alert in &doomed {
            let _guard = self.locks.acquire(&alert.id).await;
            if self.storage.delete_alert(&alert.id).await? {
                deleted += 1;
            }
        }
        info!(deleted, "Pruned resolved alerts");
        Ok(deleted)
    }

    /// Read-modify-write under the alert's lock. `apply` returns whether it
    /// changed anything; unchanged alerts are not rewritten.
    async fn modify<F>(&self, id: &str, apply: F) -> Result<Option<Alert>, AlertStoreError>
    where
        F: FnOnce(&mut Alert) -> Result<bool, AlertStoreError>,
    {
        let _guard = self.locks.acquire(id).await;
        let Some(mut alert) = self.storage.get_alert(id).await? else {
            return Ok(None);
        };
        if apply(&mut alert)? {
            self.storage.upsert_alert(&alert).await?;
            debug!(alert_id = %id, state = %alert.state, "Modified alert");
        }
        Ok(Some(alert))
    }
}
