//! runwarden agent
//!
//! Standalone host for the indicator flush pipeline: reads newline-delimited
//! JSON events, feeds indicators to the pipeline and writes reconciled alerts
//! to stdout.

#![forbid(unsafe_code)]

pub mod events;
pub mod local;

pub use events::{AgentEvent, EventError, EventProcessor};
pub use local::{
    LocalDeploymentLookup, LoggingInjector, LoggingResultsCleaner, LoggingRiskReprocessor,
    StdoutNotifier,
};
