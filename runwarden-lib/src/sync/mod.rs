//! Concurrency primitives shared by every writer in the crate.
//!
//! - [`KeyedMutex`]: per-key mutual exclusion for alert ids and baseline ids.
//! - [`TryGate`]: a global gate with a non-blocking acquire, used to keep at
//!   most one indicator flush cycle in flight.
//! - [`fan_out`]: bounded parallel map that joins every task and aggregates
//!   failures instead of aborting on the first one.

pub mod fan_out;
pub mod gate;
pub mod keyed;

pub use fan_out::{FanOutReport, fan_out};
pub use gate::{GateGuard, TryGate};
pub use keyed::{KeyedGuard, KeyedMutex};
