//! Negotiation adapter around one trigger algorithm.
//!
//! The worker thread publishes candidates and advances the time gate; the
//! release coordinator asks for committable intervals and releases candidates.
//! Both sides go through the adapter's lock, never through the algorithm.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use crate::error::AdapterError;
use crate::interval::{Interval, EMPTY_TIME, FLUSH_TIME};
use crate::request::{AlgorithmId, TriggerRequest};
use crate::throttle::LogThrottle;

/// Capability set the negotiator and coordinator need from an algorithm.
pub trait AlgorithmAdapter: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Identifying triple.
    fn id(&self) -> AlgorithmId;

    /// The adapter's constraint for the negotiator's current `hint`.
    ///
    /// - `Ok(None)`: this adapter cannot commit to anything at `hint` yet.
    /// - `Ok(Some(Interval::EMPTY))`: no proposal, no objection.
    /// - `Ok(Some(Interval::FLUSH))`: done forever, nothing buffered.
    /// - `Ok(Some(i))`: the interval this adapter can commit to.
    ///
    /// Once an adapter has seen a hint its answers for that hint may only
    /// narrow toward earlier work; they never move later.
    ///
    /// # Errors
    ///
    /// Errors are logged by the negotiator and treated as "no constraint".
    fn next_committable_interval(&self, hint: Interval) -> Result<Option<Interval>, AdapterError>;

    /// Moves every buffered candidate ending at or before `interval.end()` into
    /// `out`. A candidate is never returned twice.
    ///
    /// # Errors
    ///
    /// Fails only if the adapter state is unusable.
    fn release(&self, interval: Interval, out: &mut Vec<TriggerRequest>) -> Result<usize, AdapterError>;

    /// End of stream: every buffered candidate becomes releasable.
    fn flush(&self);

    /// Number of buffered candidates.
    fn pending(&self) -> usize;
}

/// Monotonic watermark: no future candidate starts before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGate(i64);

impl TimeGate {
    /// A gate that has not seen any input; blocks everything.
    pub const CLOSED: Self = Self(EMPTY_TIME);

    #[must_use]
    pub const fn time(self) -> i64 {
        self.0
    }

    /// Moves the gate forward; earlier times are ignored.
    pub fn advance(&mut self, time: i64) -> bool {
        if time > self.0 {
            self.0 = time;
            true
        } else {
            false
        }
    }

    /// True if `interval` lies strictly before the gate.
    #[must_use]
    pub const fn admits(self, interval: &Interval) -> bool {
        interval.end() < self.0
    }
}

impl Default for TimeGate {
    fn default() -> Self {
        Self::CLOSED
    }
}

#[derive(Debug, Default)]
struct AdapterState {
    /// Sorted by `(first_time, last_time)`.
    buffer: VecDeque<TriggerRequest>,
    gate: TimeGate,
    released_through: Option<i64>,
    flushed: bool,
}

impl AdapterState {
    fn effective_gate(&self) -> TimeGate {
        if self.flushed {
            TimeGate(FLUSH_TIME)
        } else {
            self.gate
        }
    }

    /// Envelopes of maximal runs of transitively overlapping buffered candidates.
    fn clusters(&self) -> Vec<Interval> {
        let mut out: Vec<Interval> = Vec::new();
        for req in &self.buffer {
            let Some(env) = req.envelope() else { continue };
            match out.last_mut() {
                Some(cur) if env.start() <= cur.end() => *cur = cur.union(&env),
                _ => out.push(env),
            }
        }
        out
    }

    fn insert_sorted(&mut self, req: TriggerRequest) {
        let key = (req.first_time, req.last_time);
        let pos = self.buffer.partition_point(|r| (r.first_time, r.last_time) <= key);
        self.buffer.insert(pos, req);
    }
}

/// Thread-safe candidate buffer for one algorithm.
#[derive(Debug)]
pub struct BufferedAdapter {
    name: String,
    id: AlgorithmId,
    state: Mutex<AdapterState>,
    malformed: AtomicU64,
    unqualified: AtomicU64,
    throttle: LogThrottle,
}

impl BufferedAdapter {
    #[must_use]
    pub fn new(name: impl Into<String>, id: AlgorithmId) -> Self {
        Self {
            name: name.into(),
            id,
            state: Mutex::new(AdapterState::default()),
            malformed: AtomicU64::new(0),
            unqualified: AtomicU64::new(0),
            throttle: LogThrottle::default(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, AdapterState>, AdapterError> {
        self.state.lock().map_err(|_| AdapterError::Poisoned {
            algorithm: self.name.clone(),
        })
    }

    /// Adds newly completed candidates and moves the time gate to `gate`.
    ///
    /// Candidates without a usable envelope are logged and dropped.
    ///
    /// # Errors
    ///
    /// `GateViolation` if a candidate starts before the gate previously
    /// published, `InputAfterFlush` if the adapter has been flushed.
    pub fn publish(&self, candidates: Vec<TriggerRequest>, gate: i64) -> Result<(), AdapterError> {
        let mut st = self.lock()?;
        if st.flushed && !candidates.is_empty() {
            return Err(AdapterError::InputAfterFlush {
                algorithm: self.name.clone(),
            });
        }

        for req in candidates {
            if req.envelope().is_none() {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                if self.throttle.should_log() {
                    warn!(algorithm = %self.name, first = req.first_time, last = req.last_time,
                        "dropping candidate with malformed envelope");
                }
                continue;
            }
            if req.first_time < st.gate.time() {
                return Err(AdapterError::GateViolation {
                    algorithm: self.name.clone(),
                    first_time: req.first_time,
                    gate: st.gate.time(),
                });
            }
            st.insert_sorted(req);
        }

        st.gate.advance(gate);
        Ok(())
    }

    /// Drops every buffered candidate that fails `keep`, in a single pass.
    ///
    /// Returns the number removed.
    ///
    /// # Errors
    ///
    /// Fails only on a poisoned lock.
    pub fn remove_unqualified<F>(&self, mut keep: F) -> Result<usize, AdapterError>
    where
        F: FnMut(&TriggerRequest) -> bool,
    {
        let mut st = self.lock()?;
        let before = st.buffer.len();
        st.buffer.retain(|r| keep(r));
        let removed = before - st.buffer.len();
        self.unqualified.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    /// Current time gate.
    #[must_use]
    pub fn gate(&self) -> TimeGate {
        self.lock().map(|st| st.effective_gate()).unwrap_or(TimeGate::CLOSED)
    }

    /// True once flushed and empty.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.lock().map(|st| st.flushed && st.buffer.is_empty()).unwrap_or(false)
    }

    /// End of the last interval released from this adapter.
    #[must_use]
    pub fn released_through(&self) -> Option<i64> {
        self.lock().ok().and_then(|st| st.released_through)
    }

    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn unqualified_count(&self) -> u64 {
        self.unqualified.load(Ordering::Relaxed)
    }
}

impl AlgorithmAdapter for BufferedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> AlgorithmId {
        self.id
    }

    fn next_committable_interval(&self, hint: Interval) -> Result<Option<Interval>, AdapterError> {
        let st = self.lock()?;
        if st.flushed && st.buffer.is_empty() {
            return Ok(Some(Interval::FLUSH));
        }

        let gate = st.effective_gate();
        let clusters = st.clusters();

        if !hint.is_real() {
            // Propose our earliest cluster if nothing can still grow into it.
            return Ok(match clusters.first() {
                Some(first) if gate.admits(first) => Some(*first),
                _ => Some(Interval::EMPTY),
            });
        }

        if !gate.admits(&hint) {
            return Ok(None);
        }

        // Earlier work goes first.
        if let Some(first) = clusters.first() {
            if first.end() < hint.start() {
                return Ok(if gate.admits(first) { Some(*first) } else { None });
            }
        }

        let mut answer = hint;
        for cluster in &clusters {
            if cluster.start() > answer.end() {
                break;
            }
            if cluster.overlaps(&answer) {
                answer = answer.union(cluster);
            }
        }

        Ok(if gate.admits(&answer) { Some(answer) } else { None })
    }

    fn release(&self, interval: Interval, out: &mut Vec<TriggerRequest>) -> Result<usize, AdapterError> {
        let mut st = self.lock()?;
        if !interval.is_real() {
            return Ok(0);
        }

        let mut kept = VecDeque::with_capacity(st.buffer.len());
        let mut released = 0;
        for req in st.buffer.drain(..) {
            if req.last_time <= interval.end() {
                out.push(req);
                released += 1;
            } else {
                kept.push_back(req);
            }
        }
        st.buffer = kept;

        let through = st.released_through.map_or(interval.end(), |t| t.max(interval.end()));
        st.released_through = Some(through);
        Ok(released)
    }

    fn flush(&self) {
        match self.state.lock() {
            Ok(mut st) => st.flushed = true,
            Err(poisoned) => poisoned.into_inner().flushed = true,
        }
    }

    fn pending(&self) -> usize {
        self.lock().map(|st| st.buffer.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::SourceId;
    use crate::request::{ReadoutElement, ReadoutType, RequestUid, TriggerType};

    fn id() -> AlgorithmId {
        AlgorithmId::new(TriggerType(0), 1, SourceId::INICE_TRIGGER)
    }

    fn req(uid: u64, first: i64, last: i64) -> TriggerRequest {
        TriggerRequest::new(RequestUid::Provider(uid), id(), first, last)
            .with_element(ReadoutElement::new(ReadoutType::InIceGlobal, first, last))
    }

    fn iv(s: i64, e: i64) -> Interval {
        Interval::new(s, e).unwrap()
    }

    #[test]
    fn time_gate_is_monotonic() {
        let mut gate = TimeGate::default();
        assert!(gate.advance(10));
        assert!(!gate.advance(5));
        assert_eq!(gate.time(), 10);
        assert!(gate.admits(&iv(1, 9)));
        assert!(!gate.admits(&iv(1, 10)));
    }

    #[test]
    fn empty_hint_proposes_earliest_committable_cluster() {
        let a = BufferedAdapter::new("a", id());
        a.publish(vec![req(1, 100, 200), req(2, 150, 250), req(3, 400, 450)], 300).unwrap();

        assert_eq!(a.next_committable_interval(Interval::EMPTY).unwrap(), Some(iv(100, 250)));
    }

    #[test]
    fn empty_hint_abstains_when_first_cluster_not_committable() {
        let a = BufferedAdapter::new("a", id());
        a.publish(vec![req(1, 100, 200)], 150).unwrap();
        assert_eq!(a.next_committable_interval(Interval::EMPTY).unwrap(), Some(Interval::EMPTY));
    }

    #[test]
    fn hint_past_gate_is_vetoed() {
        let a = BufferedAdapter::new("a", id());
        a.publish(Vec::new(), 100).unwrap();
        assert_eq!(a.next_committable_interval(iv(50, 99)).unwrap(), Some(iv(50, 99)));
        assert_eq!(a.next_committable_interval(iv(50, 100)).unwrap(), None);
    }

    #[test]
    fn hint_is_widened_by_overlapping_candidates() {
        let a = BufferedAdapter::new("a", id());
        a.publish(vec![req(1, 150, 250)], 1000).unwrap();
        assert_eq!(a.next_committable_interval(iv(100, 200)).unwrap(), Some(iv(100, 250)));
    }

    #[test]
    fn earlier_candidate_wins_over_hint() {
        let a = BufferedAdapter::new("a", id());
        a.publish(vec![req(1, 10, 20)], 1000).unwrap();
        assert_eq!(a.next_committable_interval(iv(100, 200)).unwrap(), Some(iv(10, 20)));
    }

    #[test]
    fn release_is_idempotent() {
        let a = BufferedAdapter::new("a", id());
        a.publish(vec![req(1, 10, 20), req(2, 30, 40), req(3, 50, 60)], 1000).unwrap();

        let mut out = Vec::new();
        assert_eq!(a.release(iv(10, 40), &mut out).unwrap(), 2);
        assert_eq!(a.release(iv(10, 40), &mut out).unwrap(), 0);
        assert_eq!(out.len(), 2);
        assert_eq!(a.pending(), 1);
        assert_eq!(a.released_through(), Some(40));
    }

    #[test]
    fn gate_violation_is_rejected() {
        let a = BufferedAdapter::new("a", id());
        a.publish(Vec::new(), 100).unwrap();
        let err = a.publish(vec![req(1, 90, 120)], 200).unwrap_err();
        assert!(matches!(err, AdapterError::GateViolation { first_time: 90, gate: 100, .. }));
    }

    #[test]
    fn malformed_candidate_is_dropped_not_fatal() {
        let a = BufferedAdapter::new("a", id());
        a.publish(vec![req(1, 50, 10), req(2, 60, 70)], 100).unwrap();
        assert_eq!(a.pending(), 1);
        assert_eq!(a.malformed_count(), 1);
    }

    #[test]
    fn flush_releases_everything_then_reports_flush() {
        let a = BufferedAdapter::new("a", id());
        a.publish(vec![req(1, 100, 200)], 150).unwrap();
        assert_eq!(a.next_committable_interval(Interval::EMPTY).unwrap(), Some(Interval::EMPTY));

        a.flush();
        assert_eq!(a.next_committable_interval(Interval::EMPTY).unwrap(), Some(iv(100, 200)));

        let mut out = Vec::new();
        a.release(iv(100, 200), &mut out).unwrap();
        assert!(a.is_drained());
        assert_eq!(a.next_committable_interval(Interval::EMPTY).unwrap(), Some(Interval::FLUSH));

        let err = a.publish(vec![req(2, 300, 400)], 500).unwrap_err();
        assert!(matches!(err, AdapterError::InputAfterFlush { .. }));
    }

    // Index-based removal skips the entry after each hit; adjacent unqualified
    // candidates must all go.
    #[test]
    fn remove_unqualified_removes_adjacent_entries() {
        let a = BufferedAdapter::new("a", id());
        let bare = |uid, first, last| TriggerRequest::new(RequestUid::Provider(uid), id(), first, last);
        a.publish(
            vec![bare(1, 10, 20), bare(2, 30, 40), req(3, 50, 60), bare(4, 70, 80), bare(5, 90, 95)],
            1000,
        )
        .unwrap();

        let removed = a.remove_unqualified(|r| !r.elements.is_empty()).unwrap();
        assert_eq!(removed, 4);
        assert_eq!(a.pending(), 1);
        assert_eq!(a.unqualified_count(), 4);
    }
}
