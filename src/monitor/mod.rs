//! Best-effort monitoring for the trigger engine.
//!
//! Counters, histograms and alerts are pushed asynchronously and may be
//! dropped under load. Nothing here is part of the correctness contract.

/// Worker thread and reporting handle.
pub mod dispatcher;
/// Event type definitions.
pub mod events;
/// Event destinations.
pub mod sink;

pub use dispatcher::{MonitorHandle, MonitorStats, MonitorSystem, MonitorSystemConfig};
pub use events::{names, MonitorEvent, MonitorKind, Severity};
pub use sink::{JsonLinesSink, MetricsSink, NullSink};
