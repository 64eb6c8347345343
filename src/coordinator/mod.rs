//! Release coordination.
//!
//! A single thread owns the negotiator, the merger and the uid generator. It
//! sleeps on a [`ChangeNotifier`] until some adapter publishes, drains every
//! releasable interval, merges what it released and hands the results to the
//! output thread in order.

/// Output thread, sink and acknowledgement seams.
pub mod output;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use crate::error::{NegotiationError, TriggerError, TriggerResult};
use crate::interval::Interval;
use crate::merger::RequestMerger;
use crate::monitor::{names, MonitorHandle, Severity};
use crate::negotiator::{IntervalNegotiator, Negotiated};
use crate::request::TriggerRequest;
use crate::uid::UidGenerator;

pub use output::{Acknowledge, OutputSink, OutputStats, OutputThread};

use output::OutputMsg;

/// Edge-triggered, coalescing wake-up signal.
///
/// Any number of [`ChangeNotifier::notify`] calls before the waiter wakes
/// collapse into a single wake.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl ChangeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *pending = true;
        self.cv.notify_one();
    }

    /// Waits for a notification or until `timeout` passes.
    ///
    /// Returns true if a notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (mut pending, _) = match self.cv.wait_timeout_while(guard, timeout, |p| !*p) {
            Ok(res) => res,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *pending, false)
    }
}

/// First fatal error of a run, shared by every thread.
///
/// The first failure latched also raises a fatal alert on the attached monitor.
#[derive(Debug)]
pub struct RunStatus {
    failed: AtomicBool,
    first: Mutex<Option<TriggerError>>,
    notifier: Arc<ChangeNotifier>,
    monitor: MonitorHandle,
}

impl RunStatus {
    #[must_use]
    pub fn new(notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            failed: AtomicBool::new(false),
            first: Mutex::new(None),
            notifier,
            monitor: MonitorHandle::disabled(),
        }
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorHandle) -> Self {
        self.monitor = monitor;
        self
    }

    /// Latches `err` if it is the first failure; later failures are logged only.
    pub fn fail(&self, err: TriggerError) {
        self.fail_at(err, None);
    }

    /// As [`RunStatus::fail`], naming the interval being worked on.
    pub fn fail_at(&self, err: TriggerError, interval: Option<Interval>) {
        let mut first = match self.first.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if first.is_none() {
            error!(error = %err, algorithm = err.algorithm().unwrap_or("-"), "fatal error; stopping run");
            self.monitor
                .alert(Severity::Fatal, err.to_string(), err.algorithm(), interval);
            *first = Some(err);
            self.failed.store(true, Ordering::Release);
        } else {
            debug!(error = %err, "follow-on failure after fatal error");
        }
        drop(first);
        self.notifier.notify();
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Takes the latched error, if any.
    pub fn take_error(&self) -> Option<TriggerError> {
        match self.first.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoordinatorState {
    Idle = 0,
    Negotiating = 1,
    Merging = 2,
    Emitting = 3,
    Stopped = 4,
}

impl CoordinatorState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Negotiating,
            2 => Self::Merging,
            3 => Self::Emitting,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Merging => "merging",
            Self::Emitting => "emitting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct ProbeInner {
    state: AtomicU8,
    flushing: AtomicBool,
}

/// Read-only view of a running coordinator.
///
/// `Flushing` is orthogonal to the cycle state: it is entered once upstream
/// reports end of stream and lasts until the coordinator stops.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorProbe(Arc<ProbeInner>);

impl CoordinatorProbe {
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.0.flushing.load(Ordering::Acquire)
    }

    /// Upstream reached end of stream.
    pub fn begin_flush(&self) {
        if !self.0.flushing.swap(true, Ordering::AcqRel) {
            info!("end of stream observed; draining");
        }
    }

    fn set(&self, state: CoordinatorState) {
        self.0.state.store(state as u8, Ordering::Release);
    }
}

/// Totals kept by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Intervals agreed by the negotiator.
    pub intervals: u64,
    /// Candidates released from adapters.
    pub released: u64,
    /// Requests handed to the output thread.
    pub emitted: u64,
    /// Emitted requests that merged two or more candidates.
    pub merged: u64,
}

enum Drained {
    Idle,
    Flushed,
}

/// Owns negotiation, merging and id assignment for one run.
pub struct ReleaseCoordinator {
    negotiator: IntervalNegotiator,
    merger: RequestMerger,
    uids: UidGenerator,
    notifier: Arc<ChangeNotifier>,
    status: Arc<RunStatus>,
    output: Sender<OutputMsg>,
    monitor: MonitorHandle,
    probe: CoordinatorProbe,
    idle_poll: Duration,
    last_interval: Option<Interval>,
    last_request_end: Option<i64>,
    stats: CoordinatorStats,
}

impl ReleaseCoordinator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        negotiator: IntervalNegotiator,
        merger: RequestMerger,
        uids: UidGenerator,
        notifier: Arc<ChangeNotifier>,
        status: Arc<RunStatus>,
        output: &OutputThread,
        monitor: MonitorHandle,
        idle_poll: Duration,
    ) -> Self {
        Self {
            negotiator,
            merger,
            uids,
            notifier,
            status,
            output: output.sender(),
            monitor,
            probe: CoordinatorProbe::default(),
            idle_poll,
            last_interval: None,
            last_request_end: None,
            stats: CoordinatorStats::default(),
        }
    }

    #[must_use]
    pub fn probe(&self) -> CoordinatorProbe {
        self.probe.clone()
    }

    /// Reports through `probe` instead of a private one.
    #[must_use]
    pub fn with_probe(mut self, probe: CoordinatorProbe) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub const fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    /// Coordinator thread body. Returns once every adapter has flushed and
    /// been drained, or once the run has failed.
    ///
    /// The output thread is always told to stop before this returns.
    pub fn run(mut self) -> CoordinatorStats {
        loop {
            if self.status.is_failed() {
                break;
            }
            match self.drain() {
                Ok(Drained::Flushed) => {
                    info!(intervals = self.stats.intervals, emitted = self.stats.emitted, "all algorithms drained");
                    break;
                }
                Ok(Drained::Idle) => {}
                Err(err) => {
                    self.status.fail_at(err, self.last_interval);
                    break;
                }
            }
            self.probe.set(CoordinatorState::Idle);
            // Wakes are coalesced, never lost; the timeout is a backstop only.
            self.notifier.wait_timeout(self.idle_poll);
        }

        let _ = self.output.send(OutputMsg::Stop);
        self.probe.set(CoordinatorState::Stopped);
        self.stats
    }

    /// Releases intervals until the negotiator has nothing more to give.
    fn drain(&mut self) -> TriggerResult<Drained> {
        loop {
            self.probe.set(CoordinatorState::Negotiating);
            let outcome = self.negotiator.negotiate();
            self.monitor
                .histogram(names::NEGOTIATION_ITERATIONS, self.negotiator.last_iterations() as u64);
            match outcome? {
                Negotiated::Nothing => return Ok(Drained::Idle),
                Negotiated::Flush => return Ok(Drained::Flushed),
                Negotiated::Interval(interval) => self.release_interval(interval)?,
            }
            if self.status.is_failed() {
                return Ok(Drained::Idle);
            }
        }
    }

    /// Merges and emits everything `interval` makes releasable.
    ///
    /// # Errors
    ///
    /// `OutOfOrder` if `interval` does not start after the previous one ended.
    pub fn release_interval(&mut self, interval: Interval) -> TriggerResult<()> {
        if let Some(prev) = self.last_interval {
            if interval.start() <= prev.end() {
                return Err(NegotiationError::OutOfOrder { previous: prev, next: interval }.into());
            }
        }

        self.probe.set(CoordinatorState::Merging);
        let mut released = Vec::new();
        for adapter in self.negotiator.adapters() {
            adapter.release(interval, &mut released)?;
        }
        self.stats.intervals += 1;
        self.stats.released += released.len() as u64;
        self.monitor.counter(names::INTERVALS, 1);
        debug!(interval = %interval, released = released.len(), "interval agreed");

        let malformed_before = self.merger.malformed_count();
        let merged = self.merger.merge(interval, released, &mut self.uids)?;
        self.monitor
            .counter(names::MALFORMED, self.merger.malformed_count() - malformed_before);

        self.probe.set(CoordinatorState::Emitting);
        for mut request in merged {
            self.emit(&interval, &mut request)?;
            self.output
                .send(OutputMsg::Request(request))
                .map_err(|_| TriggerError::disconnected("output_queue"))?;
        }

        self.last_interval = Some(interval);
        Ok(())
    }

    fn emit(&mut self, interval: &Interval, request: &mut TriggerRequest) -> TriggerResult<()> {
        if let Some(prev_end) = self.last_request_end {
            if request.first_time <= prev_end {
                let previous = Interval::at(prev_end);
                let next = request.envelope().unwrap_or(*interval);
                return Err(NegotiationError::OutOfOrder { previous, next }.into());
            }
        }
        self.last_request_end = Some(request.last_time);

        self.uids.assign_final(request);
        self.stats.emitted += 1;
        self.monitor.counter(names::EMITTED, 1);
        if request.is_merged() {
            self.stats.merged += 1;
            self.monitor.counter(names::MERGED, 1);
            self.monitor
                .histogram(names::CLUSTER_SIZE, request.sub_requests.len() as u64);
        }
        debug!(uid = request.uid.value(), request = %request, "emitting request");
        Ok(())
    }
}

impl fmt::Debug for ReleaseCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseCoordinator")
            .field("negotiator", &self.negotiator)
            .field("state", &self.probe.state())
            .field("last_interval", &self.last_interval)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{AlgorithmAdapter, BufferedAdapter};
    use crate::negotiator::NegotiatorLimits;
    use crate::payload::SourceId;
    use crate::request::{AlgorithmId, ReadoutElement, ReadoutType, RequestUid, TriggerType};
    use std::io;
    use std::sync::atomic::AtomicI64;
    use std::thread;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<TriggerRequest>>>);

    impl OutputSink for Collect {
        fn write(&mut self, request: &TriggerRequest) -> io::Result<()> {
            self.0.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct LastAck(AtomicI64);

    impl Acknowledge for LastAck {
        fn acknowledge_consumed_up_to(&self, time: i64) {
            self.0.store(time, Ordering::SeqCst);
        }
    }

    fn id(t: i32) -> AlgorithmId {
        AlgorithmId::new(TriggerType(t), 1, SourceId::INICE_TRIGGER)
    }

    fn req(alg: i32, uid: u64, first: i64, last: i64) -> TriggerRequest {
        TriggerRequest::new(RequestUid::Provider(uid), id(alg), first, last)
            .with_element(ReadoutElement::new(ReadoutType::InIceGlobal, first, last))
    }

    struct Rig {
        adapters: Vec<Arc<BufferedAdapter>>,
        coordinator: ReleaseCoordinator,
        output: OutputThread,
        sink: Collect,
        ack: Arc<LastAck>,
        status: Arc<RunStatus>,
    }

    fn rig(n: i32) -> Rig {
        rig_with(n, Duration::from_millis(5))
    }

    fn rig_with(n: i32, idle_poll: Duration) -> Rig {
        let adapters: Vec<Arc<BufferedAdapter>> =
            (0..n).map(|i| Arc::new(BufferedAdapter::new(format!("alg{i}"), id(i)))).collect();
        let dyns = adapters
            .iter()
            .map(|a| Arc::clone(a) as Arc<dyn AlgorithmAdapter>)
            .collect();
        let notifier = Arc::new(ChangeNotifier::new());
        let status = Arc::new(RunStatus::new(Arc::clone(&notifier)));
        let sink = Collect::default();
        let ack = Arc::new(LastAck::default());
        let output = OutputThread::spawn(
            8,
            Box::new(sink.clone()),
            Arc::clone(&ack) as Arc<dyn Acknowledge>,
            Arc::clone(&status),
        );
        let coordinator = ReleaseCoordinator::new(
            IntervalNegotiator::new(dyns, NegotiatorLimits::default()),
            RequestMerger::new(SourceId::GLOBAL_TRIGGER),
            UidGenerator::new(100),
            notifier,
            Arc::clone(&status),
            &output,
            MonitorHandle::disabled(),
            idle_poll,
        );
        Rig {
            adapters,
            coordinator,
            output,
            sink,
            ack,
            status,
        }
    }

    #[test]
    fn notifications_coalesce() {
        let n = ChangeNotifier::new();
        n.notify();
        n.notify();
        n.notify();
        assert!(n.wait_timeout(Duration::from_millis(1)));
        assert!(!n.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn notify_wakes_waiter_on_other_thread() {
        let n = Arc::new(ChangeNotifier::new());
        let waiter = {
            let n = Arc::clone(&n);
            thread::spawn(move || n.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        n.notify();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn run_status_keeps_first_error() {
        let status = RunStatus::new(Arc::new(ChangeNotifier::new()));
        assert!(!status.is_failed());
        status.fail(TriggerError::internal("first"));
        status.fail(TriggerError::internal("second"));
        assert!(status.is_failed());
        let err = status.take_error().unwrap();
        assert!(err.to_string().contains("first"));
        assert!(status.take_error().is_none());
    }

    #[test]
    fn overlapping_candidates_across_algorithms_merge_and_get_final_ids() {
        let rig = rig(2);
        rig.adapters[0].publish(vec![req(0, 1, 100, 200)], 1000).unwrap();
        rig.adapters[1].publish(vec![req(1, 1, 150, 250), req(1, 2, 400, 450)], 1000).unwrap();
        for a in &rig.adapters {
            a.flush();
        }

        let stats = rig.coordinator.run();
        rig.output.join();

        assert_eq!(stats.intervals, 2);
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.merged, 1);

        let out = rig.sink.0.lock().unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_merged());
        assert_eq!((out[0].first_time, out[0].last_time), (100, 250));
        assert_eq!(out[0].uid, RequestUid::Final(100));
        assert_eq!(out[1].uid, RequestUid::Final(101));
        assert_eq!(rig.ack.0.load(Ordering::SeqCst), 400);
        assert!(rig.status.take_error().is_none());
    }

    #[test]
    fn out_of_order_interval_is_fatal() {
        let mut rig = rig(1);
        rig.adapters[0].publish(vec![req(0, 1, 100, 200)], 1000).unwrap();
        rig.coordinator.release_interval(Interval::new(100, 200).unwrap()).unwrap();

        let err = rig
            .coordinator
            .release_interval(Interval::new(150, 300).unwrap())
            .unwrap_err();
        assert!(matches!(err, TriggerError::Negotiation(NegotiationError::OutOfOrder { .. })));
        assert!(err.is_fatal());
    }

    #[test]
    fn failed_run_stops_coordinator_and_output() {
        let rig = rig(1);
        rig.status.fail(TriggerError::internal("upstream"));
        let probe = rig.coordinator.probe();
        let stats = rig.coordinator.run();
        rig.output.join();
        assert_eq!(stats.emitted, 0);
        assert_eq!(probe.state(), CoordinatorState::Stopped);
    }

    #[test]
    fn notifications_drive_progress_without_the_idle_timeout() {
        let rig = rig_with(1, Duration::from_secs(60));
        let probe = rig.coordinator.probe();
        let adapter = Arc::clone(&rig.adapters[0]);
        let notifier = Arc::clone(&rig.coordinator.notifier);
        let coordinator = thread::spawn(move || rig.coordinator.run());

        adapter.publish(vec![req(0, 1, 100, 200)], 1000).unwrap();
        notifier.notify();
        adapter.flush();
        notifier.notify();

        let started = std::time::Instant::now();
        let stats = coordinator.join().unwrap();
        rig.output.join();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(stats.emitted, 1);
        assert_eq!(probe.state(), CoordinatorState::Stopped);
    }

    #[test]
    fn shared_probe_reports_flushing_until_stopped() {
        let shared = CoordinatorProbe::default();
        let rig = rig(1);
        let coordinator = rig.coordinator.with_probe(shared.clone());
        assert!(!shared.is_flushing());
        assert_eq!(shared.state(), CoordinatorState::Idle);

        shared.begin_flush();
        rig.adapters[0].flush();
        coordinator.run();
        rig.output.join();
        assert!(shared.is_flushing());
        assert_eq!(shared.state(), CoordinatorState::Stopped);
    }
}
