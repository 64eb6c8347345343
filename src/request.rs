//! Trigger requests and their readout elements.
//!
//! A request claims an envelope `[first_time, last_time]` and lists the raw data
//! to read out. Candidate requests come from algorithms; merged requests are
//! built by the merger out of overlapping candidates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::interval::{Interval, EMPTY_TIME, FLUSH_TIME};
use crate::payload::{DomId, SourceId};

/// Numeric trigger type of the producing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerType(pub i32);

impl TriggerType {
    /// Marks a request built by merging; it may need further merge checks.
    pub const MERGED: Self = Self(-1);

    #[must_use]
    pub const fn is_merged(self) -> bool {
        self.0 == Self::MERGED.0
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_merged() {
            write!(f, "MERGED")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identity of a trigger algorithm: the `(type, config, source)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AlgorithmId {
    pub trigger_type: TriggerType,
    pub config_id: i32,
    pub source_id: SourceId,
}

impl AlgorithmId {
    #[must_use]
    pub const fn new(trigger_type: TriggerType, config_id: i32, source_id: SourceId) -> Self {
        Self {
            trigger_type,
            config_id,
            source_id,
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.trigger_type, self.config_id, self.source_id)
    }
}

/// Request identifier.
///
/// Provider ids are assigned by the producing algorithm, provisional ids by
/// intermediate merges, final ids only when a request is handed to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RequestUid {
    Provider(u64),
    Provisional(u64),
    Final(u64),
}

impl RequestUid {
    #[must_use]
    pub const fn value(self) -> u64 {
        match self {
            Self::Provider(v) | Self::Provisional(v) | Self::Final(v) => v,
        }
    }

    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Final(_))
    }

    #[must_use]
    pub const fn is_provisional(self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

impl fmt::Display for RequestUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider(v) => write!(f, "p{v}"),
            Self::Provisional(v) => write!(f, "tmp{v}"),
            Self::Final(v) => write!(f, "{v}"),
        }
    }
}

/// Detector partition a readout type addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    All,
    InIce,
    IceTop,
}

impl Partition {
    /// True if this partition contains `other`.
    #[must_use]
    pub const fn includes(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::All, _) | (Self::InIce, Self::InIce) | (Self::IceTop, Self::IceTop)
        )
    }
}

/// What a readout element asks the hubs to read out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutType {
    /// Entire detector.
    Global,
    /// Every in-ice hub.
    InIceGlobal,
    /// Every ice-top hub.
    IceTopGlobal,
    /// One in-ice string.
    InIceString,
    /// One in-ice module.
    InIceModule,
    /// One ice-top module.
    IceTopModule,
}

impl ReadoutType {
    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(self, Self::Global | Self::InIceGlobal | Self::IceTopGlobal)
    }

    #[must_use]
    pub const fn partition(self) -> Partition {
        match self {
            Self::Global => Partition::All,
            Self::InIceGlobal | Self::InIceString | Self::InIceModule => Partition::InIce,
            Self::IceTopGlobal | Self::IceTopModule => Partition::IceTop,
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Global => 2,
            Self::InIceGlobal | Self::IceTopGlobal => 1,
            Self::InIceString | Self::InIceModule | Self::IceTopModule => 0,
        }
    }

    /// True if a readout of this type always includes the data of `other`.
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        self.rank() > other.rank() && self.partition().includes(other.partition())
    }
}

/// Grouping key used when reconciling readout elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadoutKey {
    pub readout_type: ReadoutType,
    pub source_id: Option<SourceId>,
    pub dom_id: Option<DomId>,
}

/// A sub-request for raw detector data over a time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadoutElement {
    pub readout_type: ReadoutType,
    pub first_time: i64,
    pub last_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_id: Option<DomId>,
}

impl ReadoutElement {
    #[must_use]
    pub const fn new(readout_type: ReadoutType, first_time: i64, last_time: i64) -> Self {
        Self {
            readout_type,
            first_time,
            last_time,
            source_id: None,
            dom_id: None,
        }
    }

    #[must_use]
    pub const fn with_source(mut self, source_id: SourceId) -> Self {
        self.source_id = Some(source_id);
        self
    }

    #[must_use]
    pub const fn with_dom(mut self, dom_id: DomId) -> Self {
        self.dom_id = Some(dom_id);
        self
    }

    #[must_use]
    pub const fn key(&self) -> ReadoutKey {
        ReadoutKey {
            readout_type: self.readout_type,
            source_id: self.source_id,
            dom_id: self.dom_id,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Option<Interval> {
        Interval::new(self.first_time, self.last_time).ok()
    }

    /// True if `global`'s readout already includes this element's partition.
    ///
    /// Time ranges are not considered here.
    #[must_use]
    pub fn is_covered_by(&self, global: &Self) -> bool {
        if !global.readout_type.covers(self.readout_type) {
            return false;
        }
        match global.source_id {
            None => true,
            Some(src) => self.source_id == Some(src),
        }
    }
}

/// A trigger request: a candidate from an algorithm or a merged output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub uid: RequestUid,
    pub trigger_type: TriggerType,
    pub config_id: i32,
    pub source_id: SourceId,
    pub first_time: i64,
    pub last_time: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<ReadoutElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_requests: Vec<TriggerRequest>,
}

impl TriggerRequest {
    /// Creates a request with no readout elements.
    #[must_use]
    pub const fn new(uid: RequestUid, origin: AlgorithmId, first_time: i64, last_time: i64) -> Self {
        Self {
            uid,
            trigger_type: origin.trigger_type,
            config_id: origin.config_id,
            source_id: origin.source_id,
            first_time,
            last_time,
            elements: Vec::new(),
            sub_requests: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_element(mut self, element: ReadoutElement) -> Self {
        self.elements.push(element);
        self
    }

    #[must_use]
    pub const fn origin(&self) -> AlgorithmId {
        AlgorithmId::new(self.trigger_type, self.config_id, self.source_id)
    }

    #[must_use]
    pub const fn is_merged(&self) -> bool {
        self.trigger_type.is_merged()
    }

    /// The request's envelope, or `None` when it is missing or malformed.
    #[must_use]
    pub fn envelope(&self) -> Option<Interval> {
        let sentinel = |t: i64| t == EMPTY_TIME || t == FLUSH_TIME;
        if sentinel(self.first_time) || sentinel(self.last_time) {
            return None;
        }
        Interval::new(self.first_time, self.last_time).ok()
    }

    /// Two requests overlap unless one ends strictly before the other starts.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self.envelope(), other.envelope()) {
            (Some(a), Some(b)) => a.overlaps(&b),
            _ => false,
        }
    }

    /// Number of leaf candidates this request stands for.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        if self.sub_requests.is_empty() {
            1
        } else {
            self.sub_requests.iter().map(Self::leaf_count).sum()
        }
    }
}

impl fmt::Display for TriggerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request {} ({}) [{}, {}] elements={} subs={}",
            self.uid,
            self.origin(),
            self.first_time,
            self.last_time,
            self.elements.len(),
            self.sub_requests.len()
        )
    }
}
