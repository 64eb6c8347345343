//! Run controller.
//!
//! [`TriggerManager::run`] wires one run together:
//!
//! - a stream reader thread pulling batches from the [`PayloadSource`] and
//!   fanning them out to every algorithm,
//! - one worker thread per algorithm feeding its [`BufferedAdapter`],
//! - the [`ReleaseCoordinator`] thread,
//! - the [`OutputThread`].
//!
//! Shutdown runs front to back: the reader stops and pushes the stop sentinel
//! to every queue, each worker drains its queue, flushes its algorithm and
//! exits, the coordinator drains every adapter and finally stops the output
//! thread once its queue is empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};
use uuid::Uuid;

use crate::algorithm::{AlgorithmAdapter, AlgorithmRegistry, BufferedAdapter, TriggerAlgorithm};
use crate::config::EngineConfig;
use crate::coordinator::{
    Acknowledge, ChangeNotifier, CoordinatorProbe, CoordinatorStats, OutputSink, OutputThread, ReleaseCoordinator,
    RunStatus,
};
use crate::error::{NegotiationError, TriggerError, TriggerResult, ValidationError};
use crate::merger::RequestMerger;
use crate::monitor::{names, MetricsSink, MonitorHandle, MonitorSystem};
use crate::negotiator::IntervalNegotiator;
use crate::payload::Payload;
use crate::queue::{PayloadFanout, Subscriber};
use crate::request::TriggerRequest;
use crate::throttle::LogThrottle;
use crate::uid::UidGenerator;

/// Ordered input of a run.
pub trait PayloadSource: Send {
    /// Next batch in time order; `Ok(None)` at end of stream.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the run.
    fn next_batch(&mut self) -> TriggerResult<Option<Vec<Payload>>>;

    /// Callback the output thread uses to let the source reclaim consumed data.
    fn acknowledger(&self) -> Arc<dyn Acknowledge>;
}

/// Stops a running [`TriggerManager::run`] early.
///
/// The reader stops pulling input and the run then flushes as if the stream
/// had ended.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a completed run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Payloads read from the source.
    pub payloads: u64,
    /// Candidates produced by all algorithms.
    pub candidates: u64,
    /// Intervals agreed by the negotiator.
    pub intervals: u64,
    /// Requests handed to the sink.
    pub emitted: u64,
    /// Emitted requests that merged several candidates.
    pub merged: u64,
    /// Requests the sink accepted.
    pub written: u64,
    /// Monitoring events lost to overflow.
    pub dropped_monitor_events: u64,
}

/// Owns the algorithm registry and runs the engine.
#[derive(Debug)]
pub struct TriggerManager {
    cfg: EngineConfig,
    registry: AlgorithmRegistry,
    shutdown: ShutdownHandle,
    probe: CoordinatorProbe,
}

impl TriggerManager {
    /// # Errors
    ///
    /// Returns the first configuration problem found.
    pub fn new(cfg: EngineConfig) -> Result<Self, ValidationError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            registry: AlgorithmRegistry::new(),
            shutdown: ShutdownHandle::default(),
            probe: CoordinatorProbe::default(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Registers an algorithm for the next run.
    ///
    /// # Errors
    ///
    /// `DuplicateAlgorithm` if its type/config/source triple is taken.
    pub fn register(&mut self, algorithm: Box<dyn TriggerAlgorithm>) -> Result<(), ValidationError> {
        info!(algorithm = algorithm.name(), id = %algorithm.id(), "registering algorithm");
        self.registry.register(algorithm)
    }

    /// Registers every algorithm listed in the configuration.
    ///
    /// # Errors
    ///
    /// Invalid parameters or a duplicate triple.
    pub fn register_from_config(&mut self) -> Result<(), ValidationError> {
        let algorithms = self
            .cfg
            .algorithms
            .iter()
            .map(crate::config::AlgorithmConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        for alg in algorithms {
            self.register(alg)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn algorithm_count(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// State of the release coordinator of the next (or current) run.
    #[must_use]
    pub fn probe(&self) -> CoordinatorProbe {
        self.probe.clone()
    }

    /// Runs until the source is exhausted (or a stop is requested) and every
    /// candidate has been released.
    ///
    /// # Errors
    ///
    /// The first fatal error any thread hit. Output written before the failure
    /// stays written.
    pub fn run(
        self,
        mut source: Box<dyn PayloadSource>,
        sink: Box<dyn OutputSink>,
        metrics: Box<dyn MetricsSink>,
    ) -> TriggerResult<RunSummary> {
        let Self {
            cfg,
            registry,
            shutdown,
            probe,
        } = self;
        let run_id = Uuid::new_v4();
        info!(%run_id, algorithms = registry.len(), "starting trigger run");

        let monitor = MonitorSystem::new(&cfg.monitor_config(), run_id, metrics);
        let notifier = Arc::new(ChangeNotifier::new());
        let status = Arc::new(RunStatus::new(Arc::clone(&notifier)).with_monitor(monitor.handle()));
        let max_failures = cfg.negotiator_limits().max_consecutive_failures;
        let fanout = Arc::new(PayloadFanout::new(cfg.queue));

        let mut adapters: Vec<Arc<dyn AlgorithmAdapter>> = Vec::with_capacity(registry.len());
        let mut workers = Vec::with_capacity(registry.len());
        for (idx, algorithm) in registry.into_algorithms().into_iter().enumerate() {
            let adapter = Arc::new(BufferedAdapter::new(algorithm.name(), algorithm.id()));
            let worker = Worker {
                subscriber: fanout.subscribe(algorithm.name()),
                algorithm,
                adapter: Arc::clone(&adapter),
                notifier: Arc::clone(&notifier),
                status: Arc::clone(&status),
                monitor: monitor.handle(),
                max_failures,
            };
            let handle = thread::Builder::new()
                .name(format!("trigctl-alg-{idx}"))
                .spawn(move || worker.run())
                .expect("failed to spawn trigctl algorithm worker");
            workers.push(handle);
            adapters.push(adapter);
        }

        let output = OutputThread::spawn(
            cfg.output_queue_capacity,
            sink,
            source.acknowledger(),
            Arc::clone(&status),
        );
        let coordinator = ReleaseCoordinator::new(
            IntervalNegotiator::new(adapters, cfg.negotiator_limits()),
            RequestMerger::new(cfg.source_id),
            UidGenerator::new(cfg.first_uid),
            Arc::clone(&notifier),
            Arc::clone(&status),
            &output,
            monitor.handle(),
            cfg.idle_poll(),
        )
        .with_probe(probe.clone());
        let coordinator = thread::Builder::new()
            .name("trigctl-coordinator".to_string())
            .spawn(move || coordinator.run())
            .expect("failed to spawn trigctl coordinator");

        let reader = {
            let fanout = Arc::clone(&fanout);
            let status = Arc::clone(&status);
            let monitor = monitor.handle();
            thread::Builder::new()
                .name("trigctl-reader".to_string())
                .spawn(move || read_stream(source.as_mut(), &fanout, &status, &shutdown, &monitor))
                .expect("failed to spawn trigctl stream reader")
        };

        let payloads = join_or_fail(reader, "stream reader", &status).unwrap_or(0);
        probe.begin_flush();

        let mut candidates = 0;
        for handle in workers {
            candidates += join_or_fail(handle, "algorithm worker", &status).unwrap_or(0);
        }
        notifier.notify();

        let coord: CoordinatorStats = join_or_fail(coordinator, "coordinator", &status).unwrap_or_default();
        let written = output.join();
        let monitor_stats = monitor.shutdown();
        if monitor_stats.dropped > 0 {
            warn!(dropped = monitor_stats.dropped, "monitoring events were dropped");
        }

        if let Some(err) = status.take_error() {
            return Err(err);
        }

        let summary = RunSummary {
            run_id,
            payloads,
            candidates,
            intervals: coord.intervals,
            emitted: coord.emitted,
            merged: coord.merged,
            written: written.written,
            dropped_monitor_events: monitor_stats.dropped,
        };
        info!(%run_id, payloads, emitted = summary.emitted, merged = summary.merged, "trigger run stopped");
        Ok(summary)
    }
}

fn join_or_fail<T>(handle: JoinHandle<T>, what: &str, status: &RunStatus) -> Option<T> {
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            status.fail(TriggerError::internal(format!("{what} thread panicked")));
            None
        }
    }
}

/// Stream reader thread body. Returns the number of payloads read.
fn read_stream(
    source: &mut dyn PayloadSource,
    fanout: &PayloadFanout,
    status: &RunStatus,
    shutdown: &ShutdownHandle,
    monitor: &MonitorHandle,
) -> u64 {
    let mut read = 0;
    while !status.is_failed() {
        if shutdown.is_stop_requested() {
            info!("stop requested; ending input early");
            break;
        }
        match source.next_batch() {
            Ok(Some(batch)) => {
                let n = batch.len() as u64;
                for payload in batch {
                    if let Err(err) = fanout.push(payload) {
                        status.fail(err);
                        break;
                    }
                }
                read += n;
                monitor.counter(names::PAYLOADS, n);
            }
            Ok(None) => {
                info!(payloads = read, "end of stream");
                break;
            }
            Err(err) => {
                status.fail(err);
                break;
            }
        }
    }
    fanout.stop_all();
    read
}

/// Everything one algorithm worker thread owns.
struct Worker {
    algorithm: Box<dyn TriggerAlgorithm>,
    subscriber: Subscriber,
    adapter: Arc<BufferedAdapter>,
    notifier: Arc<ChangeNotifier>,
    status: Arc<RunStatus>,
    monitor: MonitorHandle,
    /// Consecutive `process` failures tolerated before the run is aborted.
    max_failures: u32,
}

impl Worker {
    /// Returns the number of candidates produced.
    fn run(mut self) -> u64 {
        let failures = LogThrottle::default();
        let mut out = Vec::new();
        let mut candidates = 0;
        let mut consecutive = 0;

        while let Some(payload) = self.subscriber.pop() {
            if self.status.is_failed() {
                return candidates;
            }
            match self.algorithm.process(&payload, &mut out) {
                Ok(()) => consecutive = 0,
                Err(err) => {
                    consecutive += 1;
                    self.monitor.counter(names::ADAPTER_FAILURES, 1);
                    if failures.should_log() {
                        warn!(algorithm = self.algorithm.name(), error = %err, consecutive, "algorithm failed on payload");
                    }
                    if consecutive >= self.max_failures {
                        self.status.fail(
                            NegotiationError::RepeatedAdapterFailure {
                                algorithm: self.algorithm.name().to_string(),
                                failures: consecutive,
                                last_error: err.to_string(),
                            }
                            .into(),
                        );
                        return candidates;
                    }
                }
            }
            candidates += out.len() as u64;
            if !self.publish(&mut out) {
                return candidates;
            }
        }

        // Stop sentinel: everything queued before it has been processed.
        self.algorithm.flush(&mut out);
        candidates += out.len() as u64;
        if self.publish(&mut out) {
            self.adapter.flush();
            info!(algorithm = self.algorithm.name(), candidates, "algorithm flushed");
        }
        self.notifier.notify();
        candidates
    }

    /// Hands candidates and the new gate to the adapter. False on a fatal error.
    fn publish(&self, out: &mut Vec<TriggerRequest>) -> bool {
        let produced = out.len() as u64;
        let malformed_before = self.adapter.malformed_count();
        if let Err(err) = self.adapter.publish(std::mem::take(out), self.algorithm.time_gate()) {
            self.status.fail(err.into());
            return false;
        }
        self.monitor
            .counter(names::MALFORMED, self.adapter.malformed_count() - malformed_before);

        if produced > 0 {
            self.monitor.counter(names::CANDIDATES, produced);
            match self.adapter.remove_unqualified(|r| self.algorithm.qualifies(r)) {
                Ok(removed) => self.monitor.counter(names::UNQUALIFIED, removed as u64),
                Err(err) => {
                    self.status.fail(err.into());
                    return false;
                }
            }
        }
        self.notifier.notify();
        true
    }
}
