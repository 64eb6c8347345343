//! Global-tier pass-through: every incoming request becomes a candidate.

use crate::error::AdapterError;
use crate::interval::{EMPTY_TIME, FLUSH_TIME};
use crate::payload::Payload;
use crate::request::{AlgorithmId, RequestUid, TriggerRequest};

use super::TriggerAlgorithm;

/// Forwards lower-tier requests as candidates of its own.
///
/// The incoming request is kept as the candidate's only sub-request and its
/// readout elements are copied. Hits are ignored apart from moving the gate.
#[derive(Debug)]
pub struct ThroughputTrigger {
    name: String,
    id: AlgorithmId,
    last_seen: i64,
    flushed: bool,
    next_uid: u64,
}

impl ThroughputTrigger {
    #[must_use]
    pub fn new(name: impl Into<String>, id: AlgorithmId) -> Self {
        Self {
            name: name.into(),
            id,
            last_seen: EMPTY_TIME,
            flushed: false,
            next_uid: 0,
        }
    }
}

impl TriggerAlgorithm for ThroughputTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> AlgorithmId {
        self.id
    }

    fn process(&mut self, payload: &Payload, out: &mut Vec<TriggerRequest>) -> Result<(), AdapterError> {
        let time = payload.utc_time();
        if time < self.last_seen {
            return Err(AdapterError::AlgorithmFailed {
                algorithm: self.name.clone(),
                reason: format!("payload at {time} arrived after {}", self.last_seen),
            });
        }
        self.last_seen = time;

        let Payload::Request(incoming) = payload else {
            return Ok(());
        };

        let uid = RequestUid::Provider(self.next_uid);
        self.next_uid += 1;

        let mut req = TriggerRequest::new(uid, self.id, incoming.first_time, incoming.last_time);
        req.elements = incoming.elements.clone();
        req.sub_requests.push(incoming.clone());
        out.push(req);
        Ok(())
    }

    fn time_gate(&self) -> i64 {
        if self.flushed {
            FLUSH_TIME
        } else {
            self.last_seen
        }
    }

    fn flush(&mut self, _out: &mut Vec<TriggerRequest>) {
        self.flushed = true;
    }
}
