//! Pipeline telemetry.
//!
//! Counters are plain atomics shared between the flush cycle and whoever
//! reports them; [`PipelineMetrics::snapshot`] produces a serializable copy.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for the indicator flush pipeline.
///
/// # Thread Safety
///
/// All counters use relaxed atomic operations and may be updated from any task.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Indicators accepted by `submit_indicator`
    pub indicators_submitted_total: AtomicU64,
    /// Indicators drained and persisted by completed flush cycles
    pub indicators_flushed_total: AtomicU64,
    /// Flush cycles that ran to completion
    pub flush_cycles_total: AtomicU64,
    /// Flush cycles skipped because another cycle held the gate
    pub flush_skipped_total: AtomicU64,
    /// Flush cycles stopped by a failed stage
    pub flush_failures_total: AtomicU64,
    /// Alerts in the new, updated and stale lists combined
    pub alerts_reconciled_total: AtomicU64,
    /// Baselines created by observation
    pub baselines_created_total: AtomicU64,
    /// Enforcement directives delivered
    pub enforcement_dispatched_total: AtomicU64,
    /// Enforcement directives that could not be delivered
    pub enforcement_failures_total: AtomicU64,
    /// Time spent in completed flush cycles, in milliseconds
    pub flush_duration_ms_total: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.indicators_submitted_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.flush_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.flush_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_baseline_created(&self) {
        self.baselines_created_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one delivered (`true`) or failed (`false`) enforcement directive.
    pub fn record_enforcement(&self, delivered: bool) {
        if delivered {
            self.enforcement_dispatched_total
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.enforcement_failures_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a completed flush cycle.
    pub fn record_cycle(&self, indicators: usize, alerts: usize, duration: Duration) {
        self.flush_cycles_total.fetch_add(1, Ordering::Relaxed);
        self.indicators_flushed_total
            .fetch_add(to_u64(indicators), Ordering::Relaxed);
        self.alerts_reconciled_total
            .fetch_add(to_u64(alerts), Ordering::Relaxed);
        self.flush_duration_ms_total.fetch_add(
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Average duration of a completed flush cycle in milliseconds.
    #[allow(clippy::as_conversions, clippy::cast_precision_loss)] // u64 to f64 for reporting
    pub fn average_flush_duration_ms(&self) -> f64 {
        let cycles = self.flush_cycles_total.load(Ordering::Relaxed);
        if cycles == 0 {
            return 0.0;
        }
        self.flush_duration_ms_total.load(Ordering::Relaxed) as f64 / cycles as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: chrono::Utc::now(),
            indicators_submitted: self.indicators_submitted_total.load(Ordering::Relaxed),
            indicators_flushed: self.indicators_flushed_total.load(Ordering::Relaxed),
            flush_cycles: self.flush_cycles_total.load(Ordering::Relaxed),
            flush_skipped: self.flush_skipped_total.load(Ordering::Relaxed),
            flush_failures: self.flush_failures_total.load(Ordering::Relaxed),
            alerts_reconciled: self.alerts_reconciled_total.load(Ordering::Relaxed),
            baselines_created: self.baselines_created_total.load(Ordering::Relaxed),
            enforcement_dispatched: self.enforcement_dispatched_total.load(Ordering::Relaxed),
            enforcement_failures: self.enforcement_failures_total.load(Ordering::Relaxed),
            avg_flush_duration_ms: self.average_flush_duration_ms(),
        }
    }
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub indicators_submitted: u64,
    pub indicators_flushed: u64,
    pub flush_cycles: u64,
    pub flush_skipped: u64,
    pub flush_failures: u64,
    pub alerts_reconciled: u64,
    pub baselines_created: u64,
    pub enforcement_dispatched: u64,
    pub enforcement_failures: u64,
    pub avg_flush_duration_ms: f64,
}

/// Performance timer for measuring operation durations.
pub struct PerformanceTimer {
    start_time: Instant,
    operation_name: &'static str,
}

impl PerformanceTimer {
    /// Start timing an operation.
    pub fn start(operation_name: &'static str) -> Self {
        Self {
            start_time: Instant::now(),
            operation_name,
        }
    }

    /// Finish timing and return the duration.
    pub fn finish(self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn operation_name(&self) -> &'static str {
        self.operation_name
    }
}
