//! Folding a freshly detected alert into the one already on record.

use crate::models::{Alert, LifecycleStage, ProcessIndicator, ProcessViolation};

/// Result of [`merge_alerts`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The new alert adds nothing; keep the old one as is.
    Unchanged,
    /// The alert that replaces the old one.
    Merged(Box<Alert>),
}

/// Merge `new` into `old`, which describe the same (policy, deployment) pair.
///
/// The merged alert keeps the identity of `old` (id, first occurrence, tags).
/// Runtime alerts accumulate processes newer than anything `old` already
/// references, up to `max_processes`; when none qualify the merge is a no-op.
/// Deploy alerts carry the old enforcement forward and keep the old timestamp
/// unless their violations changed.
pub fn merge_alerts(old: &Alert, new: Alert, max_processes: usize) -> MergeOutcome {
    let mut merged = new;

    if old.lifecycle_stage == LifecycleStage::Runtime
        && merged.lifecycle_stage == LifecycleStage::Runtime
    {
        let Some(processes) = merge_processes(old, &merged, max_processes) else {
            return MergeOutcome::Unchanged;
        };
        merged.process_violation = Some(ProcessViolation::from_processes(processes));
    }

    if old.lifecycle_stage == LifecycleStage::Deploy
        && merged.lifecycle_stage == LifecycleStage::Deploy
    {
        merged.enforcement.clone_from(&old.enforcement);
        if merged.violations == old.violations {
            merged.time = old.time;
        }
    }

    merged.id.clone_from(&old.id);
    merged.first_occurred = old.first_occurred;
    merged.tags.clone_from(&old.tags);
    MergeOutcome::Merged(Box::new(merged))
}

/// Old processes followed by the new ones signalled strictly after the latest
/// old signal, or `None` if nothing new fits under the cap.
fn merge_processes(
    old: &Alert,
    new: &Alert,
    max_processes: usize,
) -> Option<Vec<ProcessIndicator>> {
    let latest = old
        .process_violation
        .as_ref()
        .and_then(ProcessViolation::latest_signal_time);

    let mut processes = old.processes().to_vec();
    let before = processes.len();
    for process in new.processes() {
        if processes.len() >= max_processes {
            break;
        }
        if latest.is_none_or(|t| process.signal.time > t) {
            processes.push(process.clone());
        }
    }

    (processes.len() > before).then_some(processes)
}
