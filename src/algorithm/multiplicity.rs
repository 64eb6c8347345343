//! Simple-majority trigger: `threshold` hits inside a sliding `time_window`.
//!
//! Qualifying windows that overlap in time are folded into one candidate whose
//! envelope spans the contributing hits. Hits consumed by an emitted candidate
//! are not reused.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, ValidationError};
use crate::interval::{EMPTY_TIME, FLUSH_TIME};
use crate::payload::{DomId, Hit, Payload, SourceId};
use crate::request::{AlgorithmId, ReadoutElement, ReadoutType, RequestUid, TriggerRequest, TriggerType};

use super::TriggerAlgorithm;

/// Parameters of a [`MultiplicityTrigger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplicityConfig {
    pub name: String,
    pub trigger_type: TriggerType,
    pub config_id: i32,
    pub source_id: SourceId,
    /// Hits required inside one window.
    pub threshold: usize,
    /// Window length in ticks.
    pub time_window: i64,
    pub readout_type: ReadoutType,
    /// Ticks read out before the first hit.
    #[serde(default)]
    pub readout_before: i64,
    /// Ticks read out after the last hit.
    #[serde(default)]
    pub readout_after: i64,
}

impl MultiplicityConfig {
    /// # Errors
    ///
    /// Rejects a zero threshold, a non-positive window and negative readout
    /// windows.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |field: &str, reason: &str| ValidationError::InvalidConfig {
            field: format!("{}.{field}", self.name),
            reason: reason.to_string(),
        };
        if self.threshold == 0 {
            return Err(invalid("threshold", "must be at least 1"));
        }
        if self.time_window <= 0 {
            return Err(invalid("time_window", "must be positive"));
        }
        if self.readout_before < 0 || self.readout_after < 0 {
            return Err(invalid("readout", "readout windows cannot be negative"));
        }
        if self.trigger_type.is_merged() {
            return Err(invalid("trigger_type", "reserved for merged requests"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct OpenTrigger {
    first: i64,
    last: i64,
    modules: BTreeSet<(SourceId, DomId)>,
}

/// Simple-majority hit trigger.
#[derive(Debug)]
pub struct MultiplicityTrigger {
    cfg: MultiplicityConfig,
    window: VecDeque<Hit>,
    open: Option<OpenTrigger>,
    last_seen: i64,
    flushed: bool,
    next_uid: u64,
}

impl MultiplicityTrigger {
    #[must_use]
    pub fn new(cfg: MultiplicityConfig) -> Self {
        Self {
            cfg,
            window: VecDeque::new(),
            open: None,
            last_seen: EMPTY_TIME,
            flushed: false,
            next_uid: 0,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MultiplicityConfig {
        &self.cfg
    }

    fn evict_before(&mut self, time: i64) {
        while self.window.front().is_some_and(|h| h.utc_time < time) {
            self.window.pop_front();
        }
    }

    fn open_from_window(&mut self, last: i64) {
        let first = self.window.front().map_or(last, |h| h.utc_time);
        let modules = self.window.iter().map(|h| (h.source_id, h.dom_id)).collect();
        self.open = Some(OpenTrigger { first, last, modules });
    }

    fn close(&mut self, out: &mut Vec<TriggerRequest>) {
        let Some(open) = self.open.take() else { return };
        self.window.retain(|h| h.utc_time > open.last);
        out.push(self.build_request(&open));
    }

    fn build_request(&mut self, open: &OpenTrigger) -> TriggerRequest {
        let uid = RequestUid::Provider(self.next_uid);
        self.next_uid += 1;

        let id = self.id();
        let first = open.first.saturating_sub(self.cfg.readout_before);
        let last = open.last.saturating_add(self.cfg.readout_after);
        let mut req = TriggerRequest::new(uid, id, open.first, open.last);

        match self.cfg.readout_type {
            ReadoutType::Global | ReadoutType::InIceGlobal | ReadoutType::IceTopGlobal => {
                req.elements.push(ReadoutElement::new(self.cfg.readout_type, first, last));
            }
            ReadoutType::InIceString => {
                let sources: BTreeSet<SourceId> = open.modules.iter().map(|(s, _)| *s).collect();
                req.elements.extend(
                    sources
                        .into_iter()
                        .map(|s| ReadoutElement::new(ReadoutType::InIceString, first, last).with_source(s)),
                );
            }
            ReadoutType::InIceModule | ReadoutType::IceTopModule => {
                req.elements.extend(open.modules.iter().map(|(s, d)| {
                    ReadoutElement::new(self.cfg.readout_type, first, last)
                        .with_source(*s)
                        .with_dom(*d)
                }));
            }
        }
        req
    }

    /// Time moved on without a hit; expire what can no longer take part.
    fn on_tick(&mut self, time: i64, out: &mut Vec<TriggerRequest>) {
        let reach = time.saturating_sub(self.cfg.time_window);
        if self.open.as_ref().is_some_and(|open| reach > open.last) {
            self.close(out);
        }
        if self.open.is_none() {
            self.evict_before(reach);
        }
    }

    fn on_hit(&mut self, hit: &Hit, out: &mut Vec<TriggerRequest>) {
        let t = hit.utc_time;
        let reach = t.saturating_sub(self.cfg.time_window);

        self.window.push_back(*hit);
        self.evict_before(reach);

        // No window starting at or after `reach` can overlap the open trigger.
        if self.open.as_ref().is_some_and(|open| reach > open.last) {
            self.close(out);
        }

        let qualifies = self.window.len() >= self.cfg.threshold;
        if !qualifies {
            return;
        }
        match self.open.as_mut() {
            Some(open) => {
                open.last = t;
                open.modules.extend(self.window.iter().map(|h| (h.source_id, h.dom_id)));
            }
            None => self.open_from_window(t),
        }
    }
}

impl TriggerAlgorithm for MultiplicityTrigger {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn id(&self) -> AlgorithmId {
        AlgorithmId::new(self.cfg.trigger_type, self.cfg.config_id, self.cfg.source_id)
    }

    fn process(&mut self, payload: &Payload, out: &mut Vec<TriggerRequest>) -> Result<(), AdapterError> {
        let time = payload.utc_time();
        if time < self.last_seen {
            return Err(AdapterError::AlgorithmFailed {
                algorithm: self.cfg.name.clone(),
                reason: format!("payload at {time} arrived after {}", self.last_seen),
            });
        }
        self.last_seen = time;

        match payload {
            Payload::Hit(hit) => self.on_hit(hit, out),
            Payload::Request(_) => self.on_tick(time, out),
        }
        Ok(())
    }

    fn time_gate(&self) -> i64 {
        if self.flushed {
            return FLUSH_TIME;
        }
        if let Some(open) = &self.open {
            return open.first;
        }
        self.window.front().map_or(self.last_seen, |h| h.utc_time)
    }

    fn flush(&mut self, out: &mut Vec<TriggerRequest>) {
        self.close(out);
        self.window.clear();
        self.flushed = true;
    }
}
