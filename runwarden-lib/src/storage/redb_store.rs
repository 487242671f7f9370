//! Durable storage backend on redb.
//!
//! Every record is stored as a JSON value in a `&str`-keyed table. redb calls
//! block, so each operation runs on the blocking thread pool.

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{AlertQuery, AlertStorage, BaselineStorage, IndicatorStorage, StorageError};
use crate::models::{Alert, ProcessBaseline, ProcessIndicator};

type JsonTable = TableDefinition<'static, &'static str, Vec<u8>>;

/// Table definitions for the database schema.
pub struct Tables;

impl Tables {
    /// Alerts keyed by alert id
    pub const ALERTS: JsonTable = TableDefinition::new("alerts");

    /// Process baselines keyed by baseline id
    pub const BASELINES: JsonTable = TableDefinition::new("baselines");

    /// Process indicators keyed by indicator id
    pub const INDICATORS: JsonTable = TableDefinition::new("indicators");
}

/// redb-backed storage.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
    read_only: bool,
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage")
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl RedbStorage {
    /// Open (or create) the database at `path` and make sure every table exists.
    ///
    /// A read-only store only opens an existing file and never writes to it,
    /// not even the schema.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, StorageError> {
        let db = if read_only {
            Database::open(path.as_ref())?
        } else {
            Database::create(path.as_ref())?
        };
        let storage = Self {
            db: Arc::new(db),
            read_only,
        };
        if !read_only {
            storage.initialize_schema()?;
        }
        info!(
            path = %path.as_ref().display(),
            read_only,
            "Opened redb storage"
        );
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            write_txn.open_table(Tables::ALERTS)?;
            write_txn.open_table(Tables::BASELINES)?;
            write_txn.open_table(Tables::INDICATORS)?;
        }
        write_txn.commit()?;
        debug!("redb schema initialized");
        Ok(())
    }

    fn check_writable(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::PermissionDenied { operation });
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn get_json<T: DeserializeOwned>(
    db: &Database,
    definition: JsonTable,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(definition) {
        Ok(table) => table,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match table.get(key)? {
        Some(value) => Ok(Some(serde_json::from_slice(&value.value())?)),
        None => Ok(None),
    }
}

fn scan_json<T, P>(db: &Database, definition: JsonTable, mut keep: P) -> Result<Vec<T>, StorageError>
where
    T: DeserializeOwned,
    P: FnMut(&T) -> bool,
{
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(definition) {
        Ok(table) => table,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        let record: T = serde_json::from_slice(&value.value())?;
        if keep(&record) {
            records.push(record);
        }
    }
    Ok(records)
}

fn put_json<T: Serialize>(
    db: &Database,
    definition: JsonTable,
    records: &[(String, T)],
) -> Result<(), StorageError> {
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(definition)?;
        for (key, record) in records {
            let bytes = serde_json::to_vec(record)?;
            table.insert(key.as_str(), bytes)?;
        }
    }
    write_txn.commit()?;
    Ok(())
}

fn remove_key(db: &Database, definition: JsonTable, key: &str) -> Result<bool, StorageError> {
    let write_txn = db.begin_write()?;
    let removed = {
        let mut table = write_txn.open_table(definition)?;
        let existing = table.remove(key)?;
        existing.is_some()
    };
    write_txn.commit()?;
    Ok(removed)
}

#[async_trait]
impl AlertStorage for RedbStorage {
    async fn get_alert(&self, id: &str) -> Result<Option<Alert>, StorageError> {
        let key = id.to_owned();
        self.blocking(move |db| get_json(db, Tables::ALERTS, &key))
            .await
            .map_err(|e| e.context("get alert", id))
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        self.check_writable("upsert_alert")?;
        let records = vec![(alert.id.clone(), alert.clone())];
        self.blocking(move |db| put_json(db, Tables::ALERTS, &records))
            .await
            .map_err(|e| e.context("upsert alert", alert.id.as_str()))
    }

    async fn delete_alert(&self, id: &str) -> Result<bool, StorageError> {
        self.check_writable("delete_alert")?;
        let key = id.to_owned();
        self.blocking(move |db| remove_key(db, Tables::ALERTS, &key))
            .await
            .map_err(|e| e.context("delete alert", id))
    }

    async fn search_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>, StorageError> {
        let filter = query.clone();
        let matched = self
            .blocking(move |db| scan_json(db, Tables::ALERTS, |a: &Alert| filter.matches(a)))
            .await
            .map_err(|e| e.context("search alerts", "*"))?;
        Ok(query.apply(matched))
    }

    async fn count_alerts(&self, query: &AlertQuery) -> Result<usize, StorageError> {
        let filter = query.clone();
        self.blocking(move |db| {
            scan_json(db, Tables::ALERTS, |a: &Alert| filter.matches(a)).map(|v| v.len())
        })
        .await
        .map_err(|e| e.context("count alerts", "*"))
    }
}

#[async_trait]
impl BaselineStorage for RedbStorage {
    async fn get_baseline(&self, id: &str) -> Result<Option<ProcessBaseline>, StorageError> {
        let key = id.to_owned();
        self.blocking(move |db| get_json(db, Tables::BASELINES, &key))
            .await
            .map_err(|e| e.context("get baseline", id))
    }

    async fn upsert_baseline(&self, baseline: &ProcessBaseline) -> Result<(), StorageError> {
        self.check_writable("upsert_baseline")?;
        let records = vec![(baseline.id.clone(), baseline.clone())];
        self.blocking(move |db| put_json(db, Tables::BASELINES, &records))
            .await
            .map_err(|e| e.context("upsert baseline", baseline.id.as_str()))
    }

    async fn delete_baseline(&self, id: &str) -> Result<bool, StorageError> {
        self.check_writable("delete_baseline")?;
        let key = id.to_owned();
        self.blocking(move |db| remove_key(db, Tables::BASELINES, &key))
            .await
            .map_err(|e| e.context("delete baseline", id))
    }

    async fn baselines_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<ProcessBaseline>, StorageError> {
        let wanted = deployment_id.to_owned();
        self.blocking(move |db| {
            scan_json(db, Tables::BASELINES, |b: &ProcessBaseline| {
                b.key.deployment_id == wanted
            })
        })
        .await
        .map_err(|e| e.context("list baselines for deployment", deployment_id))
    }
}

#[async_trait]
impl IndicatorStorage for RedbStorage {
    async fn upsert_indicators(&self, indicators: &[ProcessIndicator]) -> Result<(), StorageError> {
        self.check_writable("upsert_indicators")?;
        if indicators.is_empty() {
            return Ok(());
        }
        let records: Vec<(String, ProcessIndicator)> = indicators
            .iter()
            .map(|i| (i.id.clone(), i.clone()))
            .collect();
        let count = records.len();
        self.blocking(move |db| put_json(db, Tables::INDICATORS, &records))
            .await
            .map_err(|e| e.context("upsert indicators", format!("batch of {count}")))
    }

    async fn get_indicator(&self, id: &str) -> Result<Option<ProcessIndicator>, StorageError> {
        let key = id.to_owned();
        self.blocking(move |db| get_json(db, Tables::INDICATORS, &key))
            .await
            .map_err(|e| e.context("get indicator", id))
    }

    async fn indicators_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<ProcessIndicator>, StorageError> {
        let wanted = deployment_id.to_owned();
        let mut matched = self
            .blocking(move |db| {
                scan_json(db, Tables::INDICATORS, |i: &ProcessIndicator| {
                    i.deployment_id == wanted
                })
            })
            .await
            .map_err(|e| e.context("list indicators for deployment", deployment_id))?;
        matched.sort_by(|a, b| a.signal.time.cmp(&b.signal.time).then_with(|| a.id.cmp(&b.id)));
        Ok(matched)
    }
}
