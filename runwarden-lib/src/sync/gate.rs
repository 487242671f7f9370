//! Non-blocking global gate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A free/held flag with a non-blocking acquire.
///
/// Used where a busy gate means "someone is already doing this work, skip
/// it" rather than "wait your turn".
#[derive(Debug, Default, Clone)]
pub struct TryGate {
    held: Arc<AtomicBool>,
}

impl TryGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate if it is free. Returns `None` immediately when it is held.
    pub fn try_acquire(&self) -> Option<GateGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard {
                held: Arc::clone(&self.held),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Frees the gate on drop.
#[derive(Debug)]
pub struct GateGuard {
    held: Arc<AtomicBool>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
