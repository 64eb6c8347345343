//! Monitor dispatcher worker.
//!
//! Engine threads report through a cloneable [`MonitorHandle`] that never
//! blocks: events go into a bounded channel and, when it is full, the oldest
//! queued event is discarded to make room. A dedicated worker thread hands
//! events to the configured [`MetricsSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::interval::Interval;
use crate::throttle::LogThrottle;

use super::events::{MonitorEvent, MonitorKind, Severity};
use super::sink::MetricsSink;

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct MonitorSystemConfig {
    /// Max queued events before the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for MonitorSystemConfig {
    fn default() -> Self {
        Self { queue_capacity: 4096 }
    }
}

#[derive(Debug)]
enum ControlMsg {
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    recorded: AtomicU64,
    sink_failures: AtomicU64,
}

/// Cheap, cloneable reporting endpoint.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    run_id: Uuid,
    tx: Sender<MonitorEvent>,
    /// Producer-side receiver clone used to evict the oldest event.
    evict: Receiver<MonitorEvent>,
    counters: Arc<Counters>,
}

impl MonitorHandle {
    /// A handle whose events go nowhere. Reporting through it is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        let (tx, evict) = bounded(1);
        Self {
            run_id: Uuid::nil(),
            tx,
            evict,
            counters: Arc::new(Counters::default()),
        }
    }

    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Enqueues `kind` without blocking.
    pub fn publish(&self, kind: MonitorKind) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let mut event = MonitorEvent::new(self.run_id, kind);
        // A racing producer can refill the slot we freed; give up after a few rounds.
        for _ in 0..4 {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.evict.try_recv().is_ok() {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    event = back;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str, delta: u64) {
        if delta == 0 {
            return;
        }
        self.publish(MonitorKind::Counter {
            name: name.to_string(),
            delta,
        });
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn histogram(&self, name: &str, value: u64) {
        self.publish(MonitorKind::Histogram {
            name: name.to_string(),
            value: value as f64,
        });
    }

    pub fn alert(&self, severity: Severity, message: impl Into<String>, algorithm: Option<&str>, interval: Option<Interval>) {
        self.publish(MonitorKind::Alert {
            severity,
            message: message.into(),
            algorithm: algorithm.map(str::to_string),
            interval,
        });
    }

    /// Events discarded so far, whether evicted or refused.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

/// Totals reported when the monitor shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub published: u64,
    pub recorded: u64,
    pub dropped: u64,
    pub sink_failures: u64,
}

/// Monitor system: owns the worker thread that drains events into a sink.
#[derive(Debug)]
pub struct MonitorSystem {
    handle: MonitorHandle,
    control_tx: Sender<ControlMsg>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorSystem {
    pub fn new(cfg: &MonitorSystemConfig, run_id: Uuid, sink: Box<dyn MetricsSink>) -> Self {
        let (tx, rx) = bounded::<MonitorEvent>(cfg.queue_capacity.max(1));
        let (control_tx, control_rx) = bounded::<ControlMsg>(1);
        let counters = Arc::new(Counters::default());

        let thread_counters = Arc::clone(&counters);
        let thread_rx = rx.clone();
        let join = thread::Builder::new()
            .name("trigctl-monitor".to_string())
            .spawn(move || worker_loop(sink, &thread_counters, &control_rx, &thread_rx))
            .expect("failed to spawn trigctl monitor worker");

        Self {
            handle: MonitorHandle {
                run_id,
                tx,
                evict: rx,
                counters,
            },
            control_tx,
            join: Mutex::new(Some(join)),
        }
    }

    #[must_use]
    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Stops the worker after it has recorded everything still queued.
    pub fn shutdown(&self) -> MonitorStats {
        let _ = self.control_tx.try_send(ControlMsg::Shutdown);
        let handle = match self.join.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("monitor worker panicked");
            }
        }
        self.stats()
    }

    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        let c = &self.handle.counters;
        MonitorStats {
            published: c.published.load(Ordering::Relaxed),
            recorded: c.recorded.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            sink_failures: c.sink_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MonitorSystem {
    fn drop(&mut self) {
        // Handles keep the event channel open, so the worker is told to stop
        // explicitly and is detached rather than joined.
        let _ = self.control_tx.try_send(ControlMsg::Shutdown);
        if let Ok(mut guard) = self.join.lock() {
            drop(guard.take());
        }
    }
}

fn record(sink: &mut dyn MetricsSink, event: &MonitorEvent, counters: &Counters, throttle: &LogThrottle) {
    match sink.record(event) {
        Ok(()) => {
            counters.recorded.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.sink_failures.fetch_add(1, Ordering::Relaxed);
            if throttle.should_log() {
                warn!(error = %e, "metrics sink failed to record event");
            }
        }
    }
}

fn worker_loop(
    mut sink: Box<dyn MetricsSink>,
    counters: &Counters,
    control_rx: &Receiver<ControlMsg>,
    events_rx: &Receiver<MonitorEvent>,
) {
    let throttle = LogThrottle::default();
    let mut reported_drops = 0;

    loop {
        select! {
            recv(control_rx) -> msg => {
                // Shutdown, or the system went away: drain what is queued and stop.
                let _ = msg;
                while let Ok(event) = events_rx.try_recv() {
                    record(sink.as_mut(), &event, counters, &throttle);
                }
                break;
            }
            recv(events_rx) -> msg => {
                match msg {
                    Ok(event) => record(sink.as_mut(), &event, counters, &throttle),
                    Err(_) => break,
                }
            }
            default(Duration::from_millis(250)) => {
                let dropped = counters.dropped.load(Ordering::Relaxed);
                if dropped > reported_drops {
                    warn!(dropped = dropped - reported_drops, "monitor queue overflowed; oldest events dropped");
                    reported_drops = dropped;
                }
            }
        }
    }

    if let Err(e) = sink.flush() {
        warn!(error = %e, "metrics sink failed to flush");
    }
    debug!("monitor worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<MonitorEvent>>>);

    impl MetricsSink for Collect {
        fn record(&mut self, event: &MonitorEvent) -> io::Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Broken;

    impl MetricsSink for Broken {
        fn record(&mut self, _event: &MonitorEvent) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn events_reach_the_sink_before_shutdown_returns() {
        let sink = Collect::default();
        let run = Uuid::new_v4();
        let sys = MonitorSystem::new(&MonitorSystemConfig::default(), run, Box::new(sink.clone()));
        let h = sys.handle();
        h.counter("emitted", 2);
        h.histogram("cluster_size", 3);
        h.alert(Severity::Warning, "slow", Some("smt"), None);

        let stats = sys.shutdown();
        assert_eq!(stats.recorded, 3);
        assert_eq!(stats.dropped, 0);

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.run_id == run));
    }

    #[test]
    fn zero_counter_is_not_published() {
        let sys = MonitorSystem::new(&MonitorSystemConfig::default(), Uuid::nil(), Box::new(Collect::default()));
        sys.handle().counter("noop", 0);
        assert_eq!(sys.shutdown().published, 0);
    }

    #[test]
    fn full_queue_drops_oldest_event() {
        // No worker: exercise the producer side alone.
        let (tx, rx) = bounded(2);
        let h = MonitorHandle {
            run_id: Uuid::nil(),
            tx,
            evict: rx.clone(),
            counters: Arc::new(Counters::default()),
        };
        for delta in 1..=5 {
            h.counter("c", delta);
        }
        assert_eq!(h.dropped(), 3);

        let kept: Vec<u64> = rx
            .try_iter()
            .map(|e| match e.kind {
                MonitorKind::Counter { delta, .. } => delta,
                _ => 0,
            })
            .collect();
        assert_eq!(kept, vec![4, 5]);
    }

    #[test]
    fn sink_failures_are_counted_not_propagated() {
        let sys = MonitorSystem::new(&MonitorSystemConfig::default(), Uuid::nil(), Box::new(Broken));
        sys.handle().counter("c", 1);
        let stats = sys.shutdown();
        assert_eq!(stats.sink_failures, 1);
        assert_eq!(stats.recorded, 0);
    }

    #[test]
    fn disabled_handle_never_blocks() {
        let h = MonitorHandle::disabled();
        for _ in 0..10 {
            h.counter("c", 1);
        }
        assert!(h.dropped() >= 9);
    }
}
