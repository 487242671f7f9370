//! Core data models for alert reconciliation and process baselines.
//!
//! This module provides the records the rest of the crate reads and writes:
//! alerts, the process indicators they reference, and per-container process
//! baselines.

pub mod alert;
pub mod baseline;
pub mod indicator;

// Re-export the main types for convenience
pub use alert::{
    Alert, AlertError, DeploymentRef, Enforcement, EnforcementAction, LifecycleStage,
    MAX_PROCESS_VIOLATIONS_PER_ALERT, PolicyRef, ProcessViolation, Severity, Violation,
    ViolationState,
};
pub use baseline::{
    BaselineElement, BaselineKey, BaselineKeyError, LockMode, ProcessBaseline,
};
pub use indicator::{IndicatorError, ProcessIndicator, ProcessSignal};
