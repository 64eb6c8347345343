//! Typed items of the ordered payload stream.
//!
//! Payload bytes are decoded by the upstream splicer; the engine only ever sees
//! these already-typed values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::request::TriggerRequest;

/// Identifier of a DAQ component (string hub, trigger, event builder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u32);

impl SourceId {
    /// In-ice trigger component.
    pub const INICE_TRIGGER: Self = Self(4000);
    /// Ice-top trigger component.
    pub const ICETOP_TRIGGER: Self = Self(5000);
    /// Global trigger component.
    pub const GLOBAL_TRIGGER: Self = Self(6000);
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mainboard id of a digital optical module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomId(pub u64);

impl fmt::Display for DomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

/// A single detector hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    pub utc_time: i64,
    pub source_id: SourceId,
    pub dom_id: DomId,
    pub trigger_mode: u16,
}

impl Hit {
    #[must_use]
    pub const fn new(utc_time: i64, source_id: SourceId, dom_id: DomId) -> Self {
        Self {
            utc_time,
            source_id,
            dom_id,
            trigger_mode: 0,
        }
    }
}

/// One item of the ordered input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A hit from a string hub (lower tier input).
    Hit(Hit),
    /// A request produced by a lower trigger tier (global tier input).
    Request(TriggerRequest),
}

impl Payload {
    /// Time the stream is ordered by.
    #[must_use]
    pub const fn utc_time(&self) -> i64 {
        match self {
            Self::Hit(hit) => hit.utc_time,
            Self::Request(req) => req.first_time,
        }
    }

    #[must_use]
    pub const fn source_id(&self) -> SourceId {
        match self {
            Self::Hit(hit) => hit.source_id,
            Self::Request(req) => req.source_id,
        }
    }
}

impl From<Hit> for Payload {
    fn from(hit: Hit) -> Self {
        Self::Hit(hit)
    }
}

impl From<TriggerRequest> for Payload {
    fn from(req: TriggerRequest) -> Self {
        Self::Request(req)
    }
}
