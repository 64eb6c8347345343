//! Fan-out of the ordered payload stream to per-algorithm queues.
//!
//! Every subscriber owns a private single-consumer queue. Payloads are shared
//! read-only behind an `Arc`. A bounded queue applies backpressure to the
//! source (the push blocks, nothing is dropped); an unbounded queue never
//! blocks and trades memory for it. The end of input is an explicit stop
//! sentinel, not a special payload.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TriggerError, TriggerResult};
use crate::payload::Payload;

/// Capacity policy of every subscriber queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QueueMode {
    /// Push blocks once `capacity` items are queued for a subscriber.
    Bounded { capacity: usize },
    /// Push never blocks.
    Unbounded,
}

impl Default for QueueMode {
    fn default() -> Self {
        Self::Bounded { capacity: 65_536 }
    }
}

/// Identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(usize);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug)]
enum QueueItem {
    Payload(Arc<Payload>),
    Stop,
}

/// Result of a timed pop.
#[derive(Debug)]
pub enum Popped {
    Payload(Arc<Payload>),
    /// The stop sentinel was reached; nothing more will arrive.
    Stopped,
    /// Nothing arrived within the timeout.
    Empty,
}

/// Consumer end of one subscription.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriptionId,
    name: String,
    rx: Receiver<QueueItem>,
    stopped: bool,
    received: u64,
}

impl Subscriber {
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until a payload is available.
    ///
    /// Returns `None` once the stop sentinel is reached; every payload queued
    /// before the sentinel is delivered first.
    pub fn pop(&mut self) -> Option<Arc<Payload>> {
        if self.stopped {
            return None;
        }
        match self.rx.recv() {
            Ok(QueueItem::Payload(p)) => {
                self.received += 1;
                Some(p)
            }
            Ok(QueueItem::Stop) | Err(_) => {
                self.stopped = true;
                None
            }
        }
    }

    /// Like [`Subscriber::pop`] but gives up after `timeout`.
    pub fn pop_timeout(&mut self, timeout: Duration) -> Popped {
        if self.stopped {
            return Popped::Stopped;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(QueueItem::Payload(p)) => {
                self.received += 1;
                Popped::Payload(p)
            }
            Ok(QueueItem::Stop) | Err(RecvTimeoutError::Disconnected) => {
                self.stopped = true;
                Popped::Stopped
            }
            Err(RecvTimeoutError::Timeout) => Popped::Empty,
        }
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Items currently queued for this subscriber.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }
}

#[derive(Debug, Clone)]
struct Producer {
    id: SubscriptionId,
    name: String,
    tx: Sender<QueueItem>,
}

/// Producer side: copies every pushed payload to each subscriber.
#[derive(Debug)]
pub struct PayloadFanout {
    mode: QueueMode,
    /// Copy-on-write list so pushes never hold the lock while blocked.
    producers: Mutex<Arc<Vec<Producer>>>,
    next_id: AtomicUsize,
    pushed: AtomicU64,
    stopped: AtomicBool,
}

impl PayloadFanout {
    #[must_use]
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            producers: Mutex::new(Arc::new(Vec::new())),
            next_id: AtomicUsize::new(0),
            pushed: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Producer>> {
        match self.producers.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut Vec<Producer>) -> R) -> R {
        let mut guard = match self.producers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut list = (**guard).clone();
        let out = f(&mut list);
        *guard = Arc::new(list);
        out
    }

    /// Registers a new subscriber.
    ///
    /// Subscribing after [`PayloadFanout::stop_all`] yields an already stopped
    /// subscriber.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscriber {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        let (tx, rx) = match self.mode {
            QueueMode::Bounded { capacity } => bounded(capacity.max(1)),
            QueueMode::Unbounded => unbounded(),
        };

        let producer = Producer {
            id,
            name: name.clone(),
            tx,
        };
        // Checked under the list lock so a concurrent stop_all cannot miss us.
        let refused = self.update(|list| {
            if self.stopped.load(Ordering::Acquire) {
                Some(producer)
            } else {
                list.push(producer);
                None
            }
        });
        if let Some(producer) = refused {
            let _ = producer.tx.send(QueueItem::Stop);
        }

        Subscriber {
            id,
            name,
            rx,
            stopped: false,
            received: 0,
        }
    }

    /// Delivers `payload` to every current subscriber.
    ///
    /// Blocks while a bounded queue is full. A subscriber whose consumer has gone
    /// away is skipped.
    ///
    /// # Errors
    ///
    /// `Disconnected` if the fan-out has been stopped.
    pub fn push(&self, payload: Payload) -> TriggerResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TriggerError::disconnected("payload_fanout"));
        }

        let payload = Arc::new(payload);
        let producers = self.snapshot();
        let mut gone = Vec::new();
        for p in producers.iter() {
            if p.tx.send(QueueItem::Payload(Arc::clone(&payload))).is_err() {
                gone.push(p.id);
            }
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);

        if !gone.is_empty() {
            self.update(|list| {
                list.retain(|p| {
                    let keep = !gone.contains(&p.id);
                    if !keep {
                        warn!(subscriber = %p.name, "subscriber went away; dropping it from fan-out");
                    }
                    keep
                });
            });
        }
        Ok(())
    }

    /// Two-phase unsubscribe: no further pushes reach `id`, then the stop
    /// sentinel lets the consumer drain what is already queued.
    ///
    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.update(|list| {
            let pos = list.iter().position(|p| p.id == id)?;
            Some(list.remove(pos))
        });
        let Some(producer) = removed else {
            return false;
        };
        debug!(subscriber = %producer.name, "unsubscribed");
        let _ = producer.tx.send(QueueItem::Stop);
        true
    }

    /// Ends the stream for every subscriber. Idempotent.
    pub fn stop_all(&self) {
        let producers = self.update(|list| {
            if self.stopped.swap(true, Ordering::AcqRel) {
                Vec::new()
            } else {
                std::mem::take(list)
            }
        });
        for p in producers {
            let _ = p.tx.send(QueueItem::Stop);
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Payloads pushed so far.
    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
