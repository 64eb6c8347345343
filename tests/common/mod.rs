#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use trigctl::{
    Acknowledge, AdapterError, AlgorithmId, DomId, Hit, MetricsSink, MonitorEvent, MonitorKind, OutputSink, Payload,
    PayloadSource, ReadoutElement, ReadoutType, RequestUid, Severity, SourceId, TriggerAlgorithm, TriggerRequest,
    TriggerResult, TriggerType, FLUSH_TIME,
};

/// Algorithm that emits a fixed list of candidates once the stream has moved
/// past each candidate's end.
pub struct Scripted {
    name: String,
    id: AlgorithmId,
    plan: VecDeque<TriggerRequest>,
    last_seen: i64,
    flushed: bool,
}

impl Scripted {
    pub fn new(name: &str, trigger_type: i32, windows: &[(i64, i64)]) -> Self {
        let id = AlgorithmId::new(TriggerType(trigger_type), 1, SourceId::INICE_TRIGGER);
        let mut sorted = windows.to_vec();
        sorted.sort_unstable();
        let plan = sorted
            .iter()
            .enumerate()
            .map(|(uid, (first, last))| candidate(id, uid as u64, *first, *last))
            .collect();
        Self {
            name: name.to_string(),
            id,
            plan,
            last_seen: i64::MIN,
            flushed: false,
        }
    }
}

pub fn candidate(id: AlgorithmId, uid: u64, first: i64, last: i64) -> TriggerRequest {
    TriggerRequest::new(RequestUid::Provider(uid), id, first, last)
        .with_element(ReadoutElement::new(ReadoutType::InIceGlobal, first, last))
}

impl TriggerAlgorithm for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> AlgorithmId {
        self.id
    }

    fn process(&mut self, payload: &Payload, out: &mut Vec<TriggerRequest>) -> Result<(), AdapterError> {
        self.last_seen = payload.utc_time();
        while self.plan.front().is_some_and(|r| r.last_time < self.last_seen) {
            if let Some(r) = self.plan.pop_front() {
                out.push(r);
            }
        }
        Ok(())
    }

    fn time_gate(&self) -> i64 {
        if self.flushed {
            return FLUSH_TIME;
        }
        self.plan
            .front()
            .map_or(self.last_seen, |r| r.first_time.min(self.last_seen))
    }

    fn flush(&mut self, out: &mut Vec<TriggerRequest>) {
        out.extend(self.plan.drain(..));
        self.flushed = true;
    }
}

/// In-memory source handing out payloads in fixed-size batches.
pub struct VecSource {
    batches: VecDeque<Vec<Payload>>,
    ack: Arc<RecordingAck>,
}

impl VecSource {
    pub fn hits(times: impl IntoIterator<Item = i64>, batch: usize) -> Self {
        let payloads: Vec<Payload> = times
            .into_iter()
            .map(|t| Payload::Hit(Hit::new(t, SourceId(12001), DomId(1))))
            .collect();
        Self::payloads(payloads, batch)
    }

    pub fn payloads(payloads: Vec<Payload>, batch: usize) -> Self {
        let batches = payloads.chunks(batch.max(1)).map(<[Payload]>::to_vec).collect();
        Self {
            batches,
            ack: Arc::new(RecordingAck::default()),
        }
    }

    pub fn acks(&self) -> Arc<RecordingAck> {
        Arc::clone(&self.ack)
    }
}

impl PayloadSource for VecSource {
    fn next_batch(&mut self) -> TriggerResult<Option<Vec<Payload>>> {
        Ok(self.batches.pop_front())
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledge> {
        Arc::clone(&self.ack) as Arc<dyn Acknowledge>
    }
}

#[derive(Default)]
pub struct RecordingAck(pub Mutex<Vec<i64>>);

impl Acknowledge for RecordingAck {
    fn acknowledge_consumed_up_to(&self, time: i64) {
        self.0.lock().unwrap().push(time);
    }
}

#[derive(Clone, Default)]
pub struct Collect(pub Arc<Mutex<Vec<TriggerRequest>>>);

impl Collect {
    pub fn take(&self) -> Vec<TriggerRequest> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl OutputSink for Collect {
    fn write(&mut self, request: &TriggerRequest) -> io::Result<()> {
        self.0.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Candidates carried by an emitted request: its sub-requests if merged,
/// else itself. Singletons are renumbered on emission, so candidates are
/// identified by origin and window.
pub fn leaves(request: &TriggerRequest) -> Vec<(AlgorithmId, i64, i64)> {
    if request.is_merged() {
        request
            .sub_requests
            .iter()
            .map(|r| (r.origin(), r.first_time, r.last_time))
            .collect()
    } else {
        vec![(request.origin(), request.first_time, request.last_time)]
    }
}

/// Algorithm that fails on every payload whose index `failing` selects and
/// never produces a candidate.
pub struct Flaky {
    id: AlgorithmId,
    failing: fn(u64) -> bool,
    seen: u64,
    last_seen: i64,
}

impl Flaky {
    pub fn new(trigger_type: i32, failing: fn(u64) -> bool) -> Self {
        Self {
            id: AlgorithmId::new(TriggerType(trigger_type), 1, SourceId::INICE_TRIGGER),
            failing,
            seen: 0,
            last_seen: i64::MIN,
        }
    }
}

impl TriggerAlgorithm for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn id(&self) -> AlgorithmId {
        self.id
    }

    fn process(&mut self, payload: &Payload, _out: &mut Vec<TriggerRequest>) -> Result<(), AdapterError> {
        let n = self.seen;
        self.seen += 1;
        self.last_seen = payload.utc_time();
        if (self.failing)(n) {
            return Err(AdapterError::AlgorithmFailed {
                algorithm: "flaky".to_string(),
                reason: format!("detector offline at payload {n}"),
            });
        }
        Ok(())
    }

    fn time_gate(&self) -> i64 {
        self.last_seen
    }

    fn flush(&mut self, _out: &mut Vec<TriggerRequest>) {}
}

/// Metrics sink keeping every event in memory.
#[derive(Clone, Default)]
pub struct Recorded(pub Arc<Mutex<Vec<MonitorEvent>>>);

impl Recorded {
    /// `(message, algorithm)` of every fatal alert recorded.
    pub fn fatal_alerts(&self) -> Vec<(String, Option<String>)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match &e.kind {
                MonitorKind::Alert {
                    severity: Severity::Fatal,
                    message,
                    algorithm,
                    ..
                } => Some((message.clone(), algorithm.clone())),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for Recorded {
    fn record(&mut self, event: &MonitorEvent) -> io::Result<()> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}
