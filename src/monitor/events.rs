//! Monitoring event types.
//!
//! Events are serializable so sinks can stream them out as JSON lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::interval::Interval;

/// Severity of an [`MonitorKind::Alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Fatal,
}

/// What an event reports.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorKind {
    /// Monotonic counter increment.
    Counter { name: String, delta: u64 },
    /// One sample of a distribution.
    Histogram { name: String, value: f64 },
    Alert {
        severity: Severity,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        algorithm: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<Interval>,
    },
}

/// One monitoring record.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub event_id: Uuid,
    /// Identifies the engine run that produced the event.
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: MonitorKind,
}

impl MonitorEvent {
    #[must_use]
    pub fn new(run_id: Uuid, kind: MonitorKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Counter or histogram name; `None` for alerts.
    #[must_use]
    pub fn metric_name(&self) -> Option<&str> {
        match &self.kind {
            MonitorKind::Counter { name, .. } | MonitorKind::Histogram { name, .. } => Some(name),
            MonitorKind::Alert { .. } => None,
        }
    }
}

/// Metric names reported by the engine.
pub mod names {
    pub const PAYLOADS: &str = "payloads";
    pub const CANDIDATES: &str = "candidates";
    pub const INTERVALS: &str = "intervals";
    pub const EMITTED: &str = "requests_emitted";
    pub const MERGED: &str = "requests_merged";
    pub const CLUSTER_SIZE: &str = "cluster_size";
    pub const NEGOTIATION_ITERATIONS: &str = "negotiation_iterations";
    pub const ADAPTER_FAILURES: &str = "adapter_failures";
    pub const MALFORMED: &str = "malformed_candidates";
    pub const UNQUALIFIED: &str = "unqualified_candidates";
}
