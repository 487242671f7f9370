//! Process indicator data structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The raw process execution observed by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSignal {
    pub process_name: String,
    #[serde(default)]
    pub exec_file_path: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub uid: u32,
    pub time: DateTime<Utc>,
    /// Container runtime id; agents may report a truncated prefix.
    pub container_id: String,
}

/// A recorded process execution inside a deployment's container.
///
/// Immutable once recorded; alerts and baselines reference indicators but never
/// change them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessIndicator {
    pub id: String,
    pub deployment_id: String,
    pub container_name: String,
    pub cluster_id: String,
    pub namespace: String,
    #[serde(default)]
    pub pod_id: Option<String>,
    pub signal: ProcessSignal,
}

impl ProcessIndicator {
    /// The name under which this process is tracked in a baseline: the
    /// executable path when known, the process name otherwise.
    pub fn baseline_item(&self) -> &str {
        if self.signal.exec_file_path.is_empty() {
            &self.signal.process_name
        } else {
            &self.signal.exec_file_path
        }
    }

    pub fn validate(&self) -> Result<(), IndicatorError> {
        let required = [
            ("id", &self.id),
            ("deployment_id", &self.deployment_id),
            ("container_name", &self.container_name),
            ("signal.container_id", &self.signal.container_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(IndicatorError::MissingField(field));
            }
        }
        if self.baseline_item().trim().is_empty() {
            return Err(IndicatorError::MissingField("signal.process_name"));
        }
        Ok(())
    }
}

/// Indicator validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum IndicatorError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}
