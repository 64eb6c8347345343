//! Destinations for monitoring events.

use std::io::{self, Write};

use super::events::MonitorEvent;

/// Receives events on the monitor worker thread.
pub trait MetricsSink: Send {
    /// Records one event.
    ///
    /// # Errors
    ///
    /// I/O failures are counted by the worker and never reach the engine.
    fn record(&mut self, event: &MonitorEvent) -> io::Result<()>;

    /// Called once when the worker exits.
    ///
    /// # Errors
    ///
    /// Same as [`MetricsSink::record`].
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&mut self, _event: &MonitorEvent) -> io::Result<()> {
        Ok(())
    }
}

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
    written: u64,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> MetricsSink for JsonLinesSink<W> {
    fn record(&mut self, event: &MonitorEvent) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
