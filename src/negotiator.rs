//! Fixed-point negotiation of the next releasable interval.
//!
//! Every active adapter is polled with the current hint until a full pass leaves
//! the hint unchanged. Answers that overlap the hint widen it; an answer that lies
//! entirely before the hint replaces it, so earlier work is always released first.
//!
//! Termination: within one negotiation the hint's start never moves later and, for
//! a fixed start, its end never moves earlier. Both only take values from the
//! finite set of candidate boundaries in play, so a monotone adapter set converges
//! in at most one pass per distinct boundary plus a final confirming pass. The
//! configured iteration bound turns a broken adapter into a fatal error instead of
//! a spin.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::algorithm::AlgorithmAdapter;
use crate::error::NegotiationError;
use crate::interval::Interval;
use crate::throttle::LogThrottle;

/// Outcome of one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiated {
    /// Every active adapter agrees this interval is safe to release.
    Interval(Interval),
    /// Nothing is releasable yet.
    Nothing,
    /// Every adapter is flushed and drained.
    Flush,
}

/// Bounds applied to negotiation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatorLimits {
    /// Maximum polling passes per negotiation.
    pub max_iterations: usize,
    /// Consecutive failures of one adapter before the run is aborted.
    pub max_consecutive_failures: u32,
}

impl Default for NegotiatorLimits {
    fn default() -> Self {
        Self {
            max_iterations: 1024,
            max_consecutive_failures: 16,
        }
    }
}

struct Slot {
    adapter: Arc<dyn AlgorithmAdapter>,
    active: bool,
    failures: u32,
}

/// Polls adapters until they agree on one interval.
pub struct IntervalNegotiator {
    slots: Vec<Slot>,
    limits: NegotiatorLimits,
    last_iterations: usize,
    failure_log: LogThrottle,
}

impl IntervalNegotiator {
    #[must_use]
    pub fn new(adapters: Vec<Arc<dyn AlgorithmAdapter>>, limits: NegotiatorLimits) -> Self {
        let slots = adapters
            .into_iter()
            .map(|adapter| Slot {
                adapter,
                active: true,
                failures: 0,
            })
            .collect();
        Self {
            slots,
            limits: NegotiatorLimits {
                max_iterations: limits.max_iterations.max(1),
                max_consecutive_failures: limits.max_consecutive_failures.max(1),
            },
            last_iterations: 0,
            failure_log: LogThrottle::default(),
        }
    }

    /// Adapters that have not yet reported flush.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }

    /// Passes used by the most recent negotiation.
    #[must_use]
    pub const fn last_iterations(&self) -> usize {
        self.last_iterations
    }

    /// All adapters, flushed or not.
    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn AlgorithmAdapter>> {
        self.slots.iter().map(|s| &s.adapter)
    }

    /// Runs the fixed-point loop once.
    ///
    /// # Errors
    ///
    /// `NonConvergence` when the iteration bound is exceeded and
    /// `RepeatedAdapterFailure` when one adapter keeps failing.
    pub fn negotiate(&mut self) -> Result<Negotiated, NegotiationError> {
        self.last_iterations = 0;
        if self.active_count() == 0 {
            return Ok(Negotiated::Flush);
        }

        let mut hint = Interval::EMPTY;
        for iteration in 1..=self.limits.max_iterations {
            self.last_iterations = iteration;
            let mut changed = false;

            for slot in self.slots.iter_mut().filter(|s| s.active) {
                let answer = match slot.adapter.next_committable_interval(hint) {
                    Ok(answer) => {
                        slot.failures = 0;
                        answer
                    }
                    Err(err) => {
                        slot.failures += 1;
                        if slot.failures >= self.limits.max_consecutive_failures {
                            return Err(NegotiationError::RepeatedAdapterFailure {
                                algorithm: slot.adapter.name().to_string(),
                                failures: slot.failures,
                                last_error: err.to_string(),
                            });
                        }
                        if self.failure_log.should_log() {
                            warn!(algorithm = slot.adapter.name(), failures = slot.failures, error = %err,
                                "adapter failed to report an interval; treating as unconstrained");
                        }
                        continue;
                    }
                };

                let Some(answer) = answer else {
                    debug!(algorithm = slot.adapter.name(), hint = %hint, "adapter cannot commit yet");
                    return Ok(Negotiated::Nothing);
                };

                if answer.is_flush() {
                    info!(algorithm = slot.adapter.name(), "adapter flushed");
                    slot.active = false;
                    continue;
                }
                if answer.is_empty() {
                    continue;
                }

                let next = if hint.is_real() {
                    match answer.negotiation_cmp(&hint) {
                        Ordering::Equal => hint.union(&answer),
                        Ordering::Less => answer,
                        Ordering::Greater => hint,
                    }
                } else {
                    answer
                };

                if next != hint {
                    hint = next;
                    changed = true;
                }
            }

            if self.slots.iter().all(|s| !s.active) {
                return Ok(Negotiated::Flush);
            }
            if !changed {
                return Ok(if hint.is_real() {
                    Negotiated::Interval(hint)
                } else {
                    Negotiated::Nothing
                });
            }
        }

        Err(NegotiationError::NonConvergence {
            iterations: self.limits.max_iterations,
            last_hint: hint,
        })
    }
}

impl std::fmt::Debug for IntervalNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalNegotiator")
            .field("adapters", &self.slots.len())
            .field("active", &self.active_count())
            .field("limits", &self.limits)
            .finish()
    }
}
