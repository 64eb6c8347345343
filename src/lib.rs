//! # trigctl - Trigger Aggregation and Interval Merging
//!
//! trigctl runs a set of independent trigger algorithms over one time-ordered
//! stream of detector payloads and releases their trigger requests downstream
//! in strict time order, merging requests whose time windows overlap.
//!
//! ## Core Concepts
//!
//! - **Interval**: closed `[start, end]` span of ticks, with EMPTY and FLUSH sentinels
//! - **Adapter**: per-algorithm candidate buffer with a monotonic time gate
//! - **Negotiator**: fixed-point loop that agrees on the next releasable interval
//! - **Merger**: folds overlapping requests into one merged request
//! - **Coordinator**: releases, merges and emits intervals in order
//!
//! ## Usage
//!
//! ```rust,ignore
//! use trigctl::{EngineConfig, TriggerManager, NullSink};
//!
//! let cfg = EngineConfig::from_path("trigger.json")?;
//! let mut manager = TriggerManager::new(cfg)?;
//! manager.register_from_config()?;
//!
//! let summary = manager.run(source, sink, Box::new(NullSink))?;
//! println!("emitted {} requests", summary.emitted);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod interval;
pub mod payload;
pub mod request;
pub mod uid;

// Algorithms and negotiation
pub mod algorithm;
pub mod merger;
pub mod negotiator;

// Runtime
pub mod config;
pub mod coordinator;
pub mod manager;
pub mod monitor;
pub mod queue;
pub mod throttle;

// Re-export primary types at crate root for convenience
pub use algorithm::{
    AlgorithmAdapter, AlgorithmRegistry, BufferedAdapter, MultiplicityConfig, MultiplicityTrigger, ThroughputTrigger,
    TimeGate, TriggerAlgorithm,
};
pub use config::{AlgorithmConfig, EngineConfig};
pub use coordinator::{
    Acknowledge, ChangeNotifier, CoordinatorProbe, CoordinatorState, CoordinatorStats, OutputSink, OutputStats,
    OutputThread, ReleaseCoordinator, RunStatus,
};
pub use error::{AdapterError, MergeError, NegotiationError, TriggerError, TriggerResult, ValidationError};
pub use interval::{Interval, EMPTY_TIME, FLUSH_TIME};
pub use manager::{PayloadSource, RunSummary, ShutdownHandle, TriggerManager};
pub use merger::{RequestMerger, MERGED_CONFIG_ID};
pub use monitor::{JsonLinesSink, MetricsSink, MonitorEvent, MonitorHandle, MonitorKind, NullSink, Severity};
pub use negotiator::{IntervalNegotiator, Negotiated, NegotiatorLimits};
pub use payload::{DomId, Hit, Payload, SourceId};
pub use queue::{PayloadFanout, Popped, QueueMode, Subscriber, SubscriptionId};
pub use request::{
    AlgorithmId, Partition, ReadoutElement, ReadoutKey, ReadoutType, RequestUid, TriggerRequest, TriggerType,
};
pub use uid::UidGenerator;
