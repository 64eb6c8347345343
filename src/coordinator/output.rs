//! Output thread.
//!
//! Writes emitted requests to the external sink in emission order and tells
//! the upstream source how far it may reclaim. This thread is the only caller
//! of [`Acknowledge::acknowledge_consumed_up_to`].

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::TriggerError;
use crate::request::TriggerRequest;

use super::RunStatus;

/// External destination of emitted requests.
pub trait OutputSink: Send {
    /// Writes one request.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the run; the request is not retried.
    fn write(&mut self, request: &TriggerRequest) -> io::Result<()>;

    /// Called once after the last request.
    ///
    /// # Errors
    ///
    /// Same as [`OutputSink::write`].
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Upstream truncation callback.
pub trait Acknowledge: Send + Sync {
    /// Everything before `time` has been consumed and may be discarded.
    fn acknowledge_consumed_up_to(&self, time: i64);
}

#[derive(Debug)]
pub(crate) enum OutputMsg {
    Request(TriggerRequest),
    Stop,
}

/// Totals kept by the output thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub written: u64,
    pub acknowledged_through: Option<i64>,
}

/// Handle to the running output thread.
#[derive(Debug)]
pub struct OutputThread {
    tx: Sender<OutputMsg>,
    join: Option<JoinHandle<OutputStats>>,
}

impl OutputThread {
    /// Starts the thread with an emit queue of `capacity` requests.
    ///
    /// Sink failures are latched in `status`.
    pub fn spawn(
        capacity: usize,
        sink: Box<dyn OutputSink>,
        ack: Arc<dyn Acknowledge>,
        status: Arc<RunStatus>,
    ) -> Self {
        let (tx, rx) = bounded::<OutputMsg>(capacity.max(1));
        let join = thread::Builder::new()
            .name("trigctl-output".to_string())
            .spawn(move || {
                let mut stats = OutputStats::default();
                if let Err(err) = output_loop(&rx, sink, ack.as_ref(), &mut stats) {
                    status.fail(err);
                }
                stats
            })
            .expect("failed to spawn trigctl output thread");

        Self { tx, join: Some(join) }
    }

    pub(crate) fn sender(&self) -> Sender<OutputMsg> {
        self.tx.clone()
    }

    /// Waits for the thread to finish. Call only after `Stop` has been queued.
    pub fn join(mut self) -> OutputStats {
        let Some(handle) = self.join.take() else {
            return OutputStats::default();
        };
        handle.join().unwrap_or_else(|_| {
            warn!("output thread panicked");
            OutputStats::default()
        })
    }
}

fn output_loop(
    rx: &Receiver<OutputMsg>,
    mut sink: Box<dyn OutputSink>,
    ack: &dyn Acknowledge,
    stats: &mut OutputStats,
) -> Result<(), TriggerError> {
    while let Ok(OutputMsg::Request(request)) = rx.recv() {
        sink.write(&request).map_err(TriggerError::Sink)?;
        stats.written += 1;

        // Reclaim never moves backwards.
        if stats.acknowledged_through.map_or(true, |t| request.first_time > t) {
            ack.acknowledge_consumed_up_to(request.first_time);
            stats.acknowledged_through = Some(request.first_time);
        }
    }

    sink.finish().map_err(TriggerError::Sink)?;
    debug!(written = stats.written, "output thread finished");
    Ok(())
}
