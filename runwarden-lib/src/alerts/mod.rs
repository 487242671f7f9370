//! Alert storage, merging and reconciliation.

pub mod merge;
pub mod reconciler;
pub mod store;

pub use merge::{MergeOutcome, merge_alerts};
pub use reconciler::{AlertScope, ReconcileError, ReconcileOutcome, Reconciler};
pub use store::{AlertStore, AlertStoreError};
