//! Process baseline store.
//!
//! Every mutation of a baseline happens under the keyed lock for its id, so
//! concurrent flush cycles and user edits of the same container are applied
//! one after another against the latest persisted state.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detection::{BaselineResultsCleaner, DetectionError};
use crate::models::{BaselineKey, BaselineKeyError, ProcessBaseline};
use crate::storage::{BaselineStorage, StorageError};
use crate::sync::KeyedMutex;

/// Baseline store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BaselineError {
    #[error("Invalid baseline key: {0}")]
    Validation(#[from] BaselineKeyError),

    #[error("Baseline {id} already exists")]
    AlreadyExists { id: String },

    #[error("Baseline storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to clean baseline results for deployment {deployment_id}: {source}")]
    Cleanup {
        deployment_id: String,
        #[source]
        source: DetectionError,
    },
}

/// Keyed-exclusive access to persisted process baselines.
#[derive(Clone)]
pub struct BaselineStore {
    storage: Arc<dyn BaselineStorage>,
    cleaner: Arc<dyn BaselineResultsCleaner>,
    locks: KeyedMutex,
    auto_lock_duration: Duration,
}

impl BaselineStore {
    pub fn new(
        storage: Arc<dyn BaselineStorage>,
        cleaner: Arc<dyn BaselineResultsCleaner>,
        auto_lock_duration: Duration,
    ) -> Self {
        Self {
            storage,
            cleaner,
            locks: KeyedMutex::new(),
            auto_lock_duration,
        }
    }

    pub fn auto_lock_duration(&self) -> Duration {
        self.auto_lock_duration
    }

    pub async fn get(&self, key: &BaselineKey) -> Result<Option<ProcessBaseline>, BaselineError> {
        key.validate()?;
        Ok(self.storage.get_baseline(&key.id()).await?)
    }

    /// Store a new baseline. Fails if one already exists for the key.
    pub async fn add(&self, mut baseline: ProcessBaseline) -> Result<ProcessBaseline, BaselineError> {
        baseline.key.validate()?;
        baseline.id = baseline.key.id();
        baseline.last_update = baseline.last_update.max(baseline.created);

        let _guard = self.locks.acquire(&baseline.id).await;
        if self.storage.get_baseline(&baseline.id).await?.is_some() {
            return Err(BaselineError::AlreadyExists { id: baseline.id });
        }
        self.storage.upsert_baseline(&baseline).await?;
        info!(baseline = %baseline.key, "Added process baseline");
        Ok(baseline)
    }

    /// Delete a baseline. When it was the deployment's last one, the
    /// deployment's baseline evaluation results are cleaned up too.
    pub async fn remove(&self, key: &BaselineKey) -> Result<bool, BaselineError> {
        key.validate()?;
        let removed = {
            let _guard = self.locks.acquire(&key.id()).await;
            self.storage.delete_baseline(&key.id()).await?
        };
        if !removed {
            return Ok(false);
        }
        info!(baseline = %key, "Removed process baseline");

        let remaining = self
            .storage
            .baselines_for_deployment(&key.deployment_id)
            .await?;
        if remaining.is_empty() {
            self.clean_results(&key.deployment_id).await?;
        }
        Ok(true)
    }

    /// Create the baseline with `items` or add `items` to the existing one.
    ///
    /// A created baseline locks itself automatically once the configured
    /// auto-lock duration has elapsed.
    pub async fn upsert<I, S>(
        &self,
        key: &BaselineKey,
        items: I,
        auto: bool,
    ) -> Result<ProcessBaseline, BaselineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        key.validate()?;
        let id = key.id();
        let _guard = self.locks.acquire(&id).await;
        let now = Utc::now();

        let baseline = match self.storage.get_baseline(&id).await? {
            Some(mut existing) => {
                existing.apply_element_updates(items, std::iter::empty::<&str>(), auto, now);
                existing
            }
            None => {
                let mut created = ProcessBaseline::new(key.clone(), now);
                created.apply_element_updates(items, std::iter::empty::<&str>(), auto, now);
                created.stack_rox_locked_timestamp = Some(self.auto_lock_deadline(now));
                debug!(
                    baseline = %key,
                    elements = created.elements.len(),
                    "Creating process baseline"
                );
                created
            }
        };
        self.storage.upsert_baseline(&baseline).await?;
        Ok(baseline)
    }

    /// Apply additions and removals to an existing baseline.
    ///
    /// Returns `None` when no baseline exists for `key`.
    pub async fn update_elements<A, R>(
        &self,
        key: &BaselineKey,
        to_add: A,
        to_remove: R,
        auto: bool,
    ) -> Result<Option<ProcessBaseline>, BaselineError>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        key.validate()?;
        let id = key.id();
        let _guard = self.locks.acquire(&id).await;

        let Some(mut baseline) = self.storage.get_baseline(&id).await? else {
            return Ok(None);
        };
        baseline.apply_element_updates(to_add, to_remove, auto, Utc::now());
        self.storage.upsert_baseline(&baseline).await?;
        Ok(Some(baseline))
    }

    /// Set or clear the user lock.
    ///
    /// Nothing is written when the baseline is already in the requested state.
    pub async fn user_lock(
        &self,
        key: &BaselineKey,
        locked: bool,
    ) -> Result<Option<ProcessBaseline>, BaselineError> {
        key.validate()?;
        let id = key.id();
        let _guard = self.locks.acquire(&id).await;

        let Some(mut baseline) = self.storage.get_baseline(&id).await? else {
            return Ok(None);
        };
        if baseline.set_user_lock(locked, Utc::now()) {
            self.storage.upsert_baseline(&baseline).await?;
            info!(baseline = %key, locked, "Changed baseline user lock");
        }
        Ok(Some(baseline))
    }

    pub async fn list_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<ProcessBaseline>, BaselineError> {
        Ok(self.storage.baselines_for_deployment(deployment_id).await?)
    }

    /// Drop every baseline of a deleted deployment and its evaluation results.
    pub async fn remove_for_deployment(&self, deployment_id: &str) -> Result<usize, BaselineError> {
        let baselines = self.storage.baselines_for_deployment(deployment_id).await?;
        let mut removed = 0;
        for baseline in &baselines {
            let _guard = self.locks.acquire(&baseline.id).await;
            if self.storage.delete_baseline(&baseline.id).await? {
                removed += 1;
            }
        }
        self.clean_results(deployment_id).await?;
        info!(deployment_id, removed, "Removed baselines for deployment");
        Ok(removed)
    }

    async fn clean_results(&self, deployment_id: &str) -> Result<(), BaselineError> {
        self.cleaner
            .remove_results_for_deployment(deployment_id)
            .await
            .map_err(|source| {
                warn!(deployment_id, error = %source, "Baseline result cleanup failed");
                BaselineError::Cleanup {
                    deployment_id: deployment_id.to_owned(),
                    source,
                }
            })
    }

    fn auto_lock_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.auto_lock_duration)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{BaselineElement, LockMode};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCleaner {
        cleaned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BaselineResultsCleaner for RecordingCleaner {
        async fn remove_results_for_deployment(
            &self,
            deployment_id: &str,
        ) -> Result<(), DetectionError> {
            self.cleaned
                .lock()
                .expect("cleaner lock")
                .push(deployment_id.to_owned());
            Ok(())
        }
    }

    fn store() -> (BaselineStore, Arc<RecordingCleaner>) {
        let cleaner = Arc::new(RecordingCleaner::default());
        let store = BaselineStore::new(
            Arc::new(MemoryStorage::new()),
            cleaner.clone(),
            Duration::from_secs(3600),
        );
        (store, cleaner)
    }

    fn key(container: &str) -> BaselineKey {
        BaselineKey::new("dep-1", container, "cluster", "default")
    }

    #[tokio::test]
    async fn upsert_creates_with_auto_lock_deadline() {
        let (store, _) = store();
        let baseline = store
            .upsert(&key("web"), ["/bin/sh"], true)
            .await
            .expect("upsert");

        assert_eq!(
            baseline.elements.get("/bin/sh"),
            Some(&BaselineElement { auto: true })
        );
        let deadline = baseline
            .stack_rox_locked_timestamp
            .expect("rox lock deadline set");
        assert_eq!(deadline - baseline.created, TimeDelta::hours(1));
        assert!(!baseline.locked_under_mode(LockMode::RoxLocked, Utc::now()));
    }

    #[tokio::test]
    async fn upsert_existing_adds_items() {
        let (store, _) = store();
        store.upsert(&key("web"), ["a"], true).await.expect("create");
        let updated = store.upsert(&key("web"), ["b"], false).await.expect("update");
        assert_eq!(updated.elements.len(), 2);
        assert_eq!(updated.elements.get("b"), Some(&BaselineElement { auto: false }));
    }

    #[tokio::test]
    async fn add_rejects_existing() {
        let (store, _) = store();
        let baseline = ProcessBaseline::new(key("web"), Utc::now());
        store.add(baseline.clone()).await.expect("first add");
        let err = store.add(baseline).await.expect_err("second add");
        assert!(matches!(err, BaselineError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn invalid_key_is_rejected() {
        let (store, _) = store();
        let err = store
            .get(&BaselineKey::new("", "web", "k", "n"))
            .await
            .expect_err("empty deployment id");
        assert!(matches!(
            err,
            BaselineError::Validation(BaselineKeyError::MissingField("deployment_id"))
        ));
    }

    #[tokio::test]
    async fn update_missing_returns_none() {
        let (store, _) = store();
        let updated = store
            .update_elements(&key("web"), ["a"], [] as [&str; 0], false)
            .await
            .expect("update");
        assert!(updated.is_none());
        assert!(store.user_lock(&key("web"), true).await.expect("lock").is_none());
    }

    #[tokio::test]
    async fn user_lock_toggles_and_persists() {
        let (store, _) = store();
        store.upsert(&key("web"), ["a"], true).await.expect("create");

        let locked = store
            .user_lock(&key("web"), true)
            .await
            .expect("lock")
            .expect("baseline exists");
        assert!(locked.is_user_locked(Utc::now()));

        let again = store
            .user_lock(&key("web"), true)
            .await
            .expect("lock again")
            .expect("baseline exists");
        assert_eq!(again.user_locked_timestamp, locked.user_locked_timestamp);

        let fetched = store.get(&key("web")).await.expect("get").expect("exists");
        assert_eq!(fetched.user_locked_timestamp, locked.user_locked_timestamp);
    }

    #[tokio::test]
    async fn unlock_drops_scheduled_user_lock() {
        let (store, _) = store();
        let mut baseline = ProcessBaseline::new(key("web"), Utc::now());
        baseline.user_locked_timestamp = Some(Utc::now() + TimeDelta::hours(1));
        store.add(baseline).await.expect("add");

        let unlocked = store
            .user_lock(&key("web"), false)
            .await
            .expect("unlock")
            .expect("baseline exists");
        assert!(unlocked.user_locked_timestamp.is_none());

        let fetched = store.get(&key("web")).await.expect("get").expect("exists");
        assert!(fetched.user_locked_timestamp.is_none());
        assert!(!fetched.is_user_locked(Utc::now() + TimeDelta::hours(2)));
    }

    #[tokio::test]
    async fn removing_last_baseline_cleans_results() {
        let (store, cleaner) = store();
        store.upsert(&key("web"), ["a"], true).await.expect("create web");
        store.upsert(&key("db"), ["b"], true).await.expect("create db");

        assert!(store.remove(&key("web")).await.expect("remove web"));
        assert!(cleaner.cleaned.lock().expect("lock").is_empty());

        assert!(store.remove(&key("db")).await.expect("remove db"));
        assert_eq!(*cleaner.cleaned.lock().expect("lock"), vec!["dep-1".to_owned()]);

        assert!(!store.remove(&key("db")).await.expect("remove missing"));
    }

    #[tokio::test]
    async fn remove_for_deployment_drops_all() {
        let (store, cleaner) = store();
        store.upsert(&key("web"), ["a"], true).await.expect("create web");
        store.upsert(&key("db"), ["b"], true).await.expect("create db");

        let removed = store.remove_for_deployment("dep-1").await.expect("remove all");
        assert_eq!(removed, 2);
        assert!(store.list_for_deployment("dep-1").await.expect("list").is_empty());
        assert_eq!(cleaner.cleaned.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_upserts_lose_nothing() {
        let (store, _) = store();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert(&key("web"), [format!("proc-{i}")], true)
                    .await
                    .expect("upsert");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        let baseline = store.get(&key("web")).await.expect("get").expect("exists");
        assert_eq!(baseline.elements.len(), 16);
    }
}
