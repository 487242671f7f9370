//! Process baseline data structures and the lock/graveyard state machine.
//!
//! A baseline is the allow-list of process names expected in one container of
//! one deployment. Processes observed while the baseline is unlocked are added
//! automatically; processes a user removes go to the graveyard so automatic
//! observation cannot silently bring them back.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::models::indicator::ProcessIndicator;

/// Identifies the container a baseline belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BaselineKey {
    pub deployment_id: String,
    pub container_name: String,
    pub cluster_id: String,
    pub namespace: String,
}

impl BaselineKey {
    pub fn new(
        deployment_id: impl Into<String>,
        container_name: impl Into<String>,
        cluster_id: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            container_name: container_name.into(),
            cluster_id: cluster_id.into(),
            namespace: namespace.into(),
        }
    }

    /// The key of the baseline covering an indicator's container.
    pub fn for_indicator(indicator: &ProcessIndicator) -> Self {
        Self::new(
            indicator.deployment_id.as_str(),
            indicator.container_name.as_str(),
            indicator.cluster_id.as_str(),
            indicator.namespace.as_str(),
        )
    }

    pub fn validate(&self) -> Result<(), BaselineKeyError> {
        let fields = [
            ("deployment_id", &self.deployment_id),
            ("container_name", &self.container_name),
            ("cluster_id", &self.cluster_id),
            ("namespace", &self.namespace),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(BaselineKeyError::MissingField(field));
            }
        }
        Ok(())
    }

    /// Deterministic, reversible id for this key.
    pub fn id(&self) -> String {
        [
            &self.deployment_id,
            &self.container_name,
            &self.cluster_id,
            &self.namespace,
        ]
        .iter()
        .map(|part| URL_SAFE_NO_PAD.encode(part.as_bytes()))
        .collect::<Vec<_>>()
        .join(".")
    }

    /// Decode a key from an id produced by [`BaselineKey::id`].
    pub fn from_id(id: &str) -> Result<Self, BaselineKeyError> {
        let parts = id
            .split('.')
            .map(|part| {
                let bytes = URL_SAFE_NO_PAD
                    .decode(part)
                    .map_err(|e| BaselineKeyError::MalformedId(format!("{id}: {e}")))?;
                String::from_utf8(bytes)
                    .map_err(|e| BaselineKeyError::MalformedId(format!("{id}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        match <[String; 4]>::try_from(parts) {
            Ok([deployment_id, container_name, cluster_id, namespace]) => Ok(Self {
                deployment_id,
                container_name,
                cluster_id,
                namespace,
            }),
            Err(parts) => Err(BaselineKeyError::MalformedId(format!(
                "{id}: expected 4 components, found {}",
                parts.len()
            ))),
        }
    }
}

impl fmt::Display for BaselineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cluster_id, self.namespace, self.deployment_id, self.container_name
        )
    }
}

/// Baseline key errors.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BaselineKeyError {
    #[error("Missing required key field: {0}")]
    MissingField(&'static str),
    #[error("Malformed baseline id: {0}")]
    MalformedId(String),
}

/// Bookkeeping for one process name in `elements` or `element_graveyard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineElement {
    /// Added (or removed) by automatic observation rather than a user.
    pub auto: bool,
}

/// Which lock timestamps must have elapsed for a baseline to count as locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    RoxLocked,
    UserLocked,
    Either,
    Both,
}

/// Allow-list of expected process names for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessBaseline {
    pub id: String,
    pub key: BaselineKey,
    #[serde(default)]
    pub elements: BTreeMap<String, BaselineElement>,
    #[serde(default)]
    pub element_graveyard: BTreeMap<String, BaselineElement>,
    pub created: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub user_locked_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stack_rox_locked_timestamp: Option<DateTime<Utc>>,
}

impl ProcessBaseline {
    /// An empty, unlocked baseline created at `now`.
    pub fn new(key: BaselineKey, now: DateTime<Utc>) -> Self {
        Self {
            id: key.id(),
            key,
            elements: BTreeMap::new(),
            element_graveyard: BTreeMap::new(),
            created: now,
            last_update: now,
            user_locked_timestamp: None,
            stack_rox_locked_timestamp: None,
        }
    }

    pub fn contains(&self, item: &str) -> bool {
        self.elements.contains_key(item)
    }

    pub fn is_user_locked(&self, now: DateTime<Utc>) -> bool {
        self.user_locked_timestamp.is_some_and(|t| t <= now)
    }

    pub fn is_rox_locked(&self, now: DateTime<Utc>) -> bool {
        self.stack_rox_locked_timestamp.is_some_and(|t| t <= now)
    }

    /// Pure lock predicate; needs no exclusion.
    pub fn locked_under_mode(&self, mode: LockMode, now: DateTime<Utc>) -> bool {
        let rox = self.is_rox_locked(now);
        let user = self.is_user_locked(now);
        match mode {
            LockMode::RoxLocked => rox,
            LockMode::UserLocked => user,
            LockMode::Either => rox || user,
            LockMode::Both => rox && user,
        }
    }

    /// Apply additions and removals following the graveyard rules.
    ///
    /// Automatic additions never resurrect a graveyard entry. A present element
    /// is only re-tagged if it was added automatically. Removals move the item
    /// to the graveyard unless a user-owned graveyard entry already exists.
    /// `last_update` is bumped unconditionally.
    pub fn apply_element_updates<A, R>(&mut self, to_add: A, to_remove: R, auto: bool, now: DateTime<Utc>)
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        for item in to_add {
            let item = item.as_ref();
            if auto && self.element_graveyard.contains_key(item) {
                continue;
            }
            let replaceable = self.elements.get(item).is_none_or(|existing| existing.auto);
            if replaceable {
                self.element_graveyard.remove(item);
                self.elements
                    .insert(item.to_owned(), BaselineElement { auto });
            }
        }

        for item in to_remove {
            let item = item.as_ref();
            self.elements.remove(item);
            let replaceable = self
                .element_graveyard
                .get(item)
                .is_none_or(|existing| existing.auto);
            if replaceable {
                self.element_graveyard
                    .insert(item.to_owned(), BaselineElement { auto });
            }
        }

        self.touch(now);
    }

    /// Set or clear the user lock. Returns `false` (and changes nothing) when
    /// the baseline is already in the requested state. Unlocking also drops a
    /// lock scheduled for later.
    pub fn set_user_lock(&mut self, locked: bool, now: DateTime<Utc>) -> bool {
        let unchanged = if locked {
            self.is_user_locked(now)
        } else {
            self.user_locked_timestamp.is_none()
        };
        if unchanged {
            return false;
        }
        self.user_locked_timestamp = locked.then_some(now);
        self.touch(now);
        true
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_update = now.max(self.created);
    }
}
