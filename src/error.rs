//! Error types for trigctl.
//!
//! All errors are strongly typed using thiserror so that the run controller can
//! tell recoverable conditions (a malformed candidate, a single adapter hiccup)
//! apart from the ones that must terminate the run.

use thiserror::Error;

use crate::interval::Interval;

/// Validation errors raised while building intervals, requests or configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid interval: start ({start}) is after end ({end})")]
    InvalidInterval {
        start: i64,
        end: i64,
    },

    #[error("Algorithm {name} is already registered as {key}")]
    DuplicateAlgorithm {
        name: String,
        key: String,
    },

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
    },
}

/// Errors raised by the interval negotiation loop.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Negotiation did not converge after {iterations} iterations (last hint {last_hint})")]
    NonConvergence {
        iterations: usize,
        last_hint: Interval,
    },

    #[error("Algorithm {algorithm} failed {failures} consecutive rounds: {last_error}")]
    RepeatedAdapterFailure {
        algorithm: String,
        failures: u32,
        last_error: String,
    },

    #[error("Out-of-order release: interval {next} does not follow {previous}")]
    OutOfOrder {
        previous: Interval,
        next: Interval,
    },
}

/// Errors raised by an individual trigger algorithm or its adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Algorithm {algorithm} failed: {reason}")]
    AlgorithmFailed {
        algorithm: String,
        reason: String,
    },

    #[error("Algorithm {algorithm} published a candidate starting at {first_time}, behind its time gate {gate}")]
    GateViolation {
        algorithm: String,
        first_time: i64,
        gate: i64,
    },

    #[error("Algorithm {algorithm} received input after flush")]
    InputAfterFlush {
        algorithm: String,
    },

    #[error("Poisoned lock in adapter for {algorithm}")]
    Poisoned {
        algorithm: String,
    },
}

/// Merge-stage failures. These are internal assertions.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Empty request cluster in interval {interval}")]
    EmptyCluster {
        interval: Interval,
    },
}

/// Top-level error type for trigctl.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Output sink error: {0}")]
    Sink(#[source] std::io::Error),

    #[error("Payload source error: {message}")]
    Source {
        message: String,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl TriggerError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a disconnected-channel error for the named path.
    #[must_use]
    pub fn disconnected(path: impl Into<String>) -> Self {
        Self::Disconnected { path: path.into() }
    }

    /// Creates a payload source error.
    #[must_use]
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the error must terminate the run.
    ///
    /// A single algorithm failure is absorbed by the negotiator; everything else
    /// that reaches the run controller stops it.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Adapter(e) => !matches!(e, AdapterError::AlgorithmFailed { .. }),
            _ => true,
        }
    }

    /// Name of the algorithm implicated in the failure, if any.
    #[must_use]
    pub fn algorithm(&self) -> Option<&str> {
        match self {
            Self::Negotiation(NegotiationError::RepeatedAdapterFailure { algorithm, .. })
            | Self::Adapter(
                AdapterError::AlgorithmFailed { algorithm, .. }
                | AdapterError::GateViolation { algorithm, .. }
                | AdapterError::InputAfterFlush { algorithm }
                | AdapterError::Poisoned { algorithm },
            ) => Some(algorithm),
            _ => None,
        }
    }
}

/// Result type alias for trigctl operations.
pub type TriggerResult<T> = Result<T, TriggerError>;
