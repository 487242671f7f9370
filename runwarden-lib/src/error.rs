//! Aggregated error reporting for batch operations.
//!
//! Batch writers (multi-alert upserts, reconciliation persistence) commit every
//! item they can and report the failures together. `ErrorList` is the
//! composite they return: a leading description plus one entry per failed
//! item, each carrying enough context (key and operation) to act on.

use std::fmt;

/// Composite error listing every failure of a partially-applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorList {
    start: String,
    errors: Vec<String>,
}

impl ErrorList {
    /// Create an empty list whose rendered form starts with `start`.
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            errors: Vec::new(),
        }
    }

    /// Record a failure.
    pub fn push(&mut self, error: impl fmt::Display) {
        self.errors.push(error.to_string());
    }

    /// Record a failure with the key it relates to.
    pub fn push_keyed(&mut self, key: &str, error: impl fmt::Display) {
        self.errors.push(format!("{key}: {error}"));
    }

    /// Append every failure of another list.
    pub fn extend(&mut self, other: Self) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The itemized failures, in the order they were recorded.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// `Ok(())` if nothing failed, the list itself otherwise.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: [{}]", self.start, self.errors.join(", "))
    }
}

impl std::error::Error for ErrorList {}
