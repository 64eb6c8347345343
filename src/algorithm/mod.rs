//! Trigger algorithms and their negotiation adapters.
//!
//! A [`TriggerAlgorithm`] is a pattern detector owned by its worker thread. Its
//! candidates are published into a [`BufferedAdapter`], which is what the
//! negotiator and the release coordinator talk to.

use std::collections::HashSet;

use crate::error::{AdapterError, ValidationError};
use crate::payload::Payload;
use crate::request::{AlgorithmId, TriggerRequest};

/// Negotiation contract and the buffered adapter implementation.
pub mod adapter;
/// Simple-majority hit trigger.
pub mod multiplicity;
/// Request pass-through trigger for the global tier.
pub mod throughput;

pub use adapter::{AlgorithmAdapter, BufferedAdapter, TimeGate};
pub use multiplicity::{MultiplicityConfig, MultiplicityTrigger};
pub use throughput::ThroughputTrigger;

/// A pluggable pattern detector.
///
/// Implementations see every payload of the ordered stream exactly once, in
/// order, on a dedicated thread.
pub trait TriggerAlgorithm: Send {
    /// Human readable name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// The `(type, config, source)` triple identifying this algorithm.
    fn id(&self) -> AlgorithmId;

    /// Feeds one payload; completed candidates are appended to `out`.
    ///
    /// # Errors
    ///
    /// A returned error is logged and the payload is skipped.
    fn process(&mut self, payload: &Payload, out: &mut Vec<TriggerRequest>) -> Result<(), AdapterError>;

    /// Earliest time at which any candidate not yet emitted could start.
    ///
    /// Must never decrease.
    fn time_gate(&self) -> i64;

    /// End of stream: emit whatever is still open.
    fn flush(&mut self, out: &mut Vec<TriggerRequest>);

    /// Whether a buffered candidate is still worth releasing.
    ///
    /// A candidate with nothing to read out is dropped by default.
    fn qualifies(&self, request: &TriggerRequest) -> bool {
        !request.elements.is_empty()
    }
}

/// Algorithms registered for one run.
///
/// Registration is rejected when the identifying triple is already taken.
#[derive(Default)]
pub struct AlgorithmRegistry {
    algorithms: Vec<Box<dyn TriggerAlgorithm>>,
    ids: HashSet<AlgorithmId>,
}

impl AlgorithmRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an algorithm.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::DuplicateAlgorithm` if another algorithm already
    /// uses the same type/config/source triple.
    pub fn register(&mut self, algorithm: Box<dyn TriggerAlgorithm>) -> Result<(), ValidationError> {
        let id = algorithm.id();
        if !self.ids.insert(id) {
            return Err(ValidationError::DuplicateAlgorithm {
                name: algorithm.name().to_string(),
                key: id.to_string(),
            });
        }
        self.algorithms.push(algorithm);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.algorithms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: AlgorithmId) -> bool {
        self.ids.contains(&id)
    }

    pub(crate) fn into_algorithms(self) -> Vec<Box<dyn TriggerAlgorithm>> {
        self.algorithms
    }
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("algorithms", &self.algorithms.iter().map(|a| a.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::SourceId;
    use crate::request::{ReadoutType, TriggerType};

    fn mult(name: &str, config_id: i32) -> Box<dyn TriggerAlgorithm> {
        Box::new(MultiplicityTrigger::new(MultiplicityConfig {
            name: name.to_string(),
            trigger_type: TriggerType(0),
            config_id,
            source_id: SourceId::INICE_TRIGGER,
            threshold: 2,
            time_window: 100,
            readout_type: ReadoutType::InIceGlobal,
            readout_before: 0,
            readout_after: 0,
        }))
    }

    #[test]
    fn registry_rejects_duplicate_triple() {
        let mut reg = AlgorithmRegistry::new();
        reg.register(mult("a", 1)).unwrap();
        reg.register(mult("b", 2)).unwrap();

        let err = reg.register(mult("c", 1)).unwrap_err();
        let ValidationError::DuplicateAlgorithm { name, key } = err else {
            panic!("expected duplicate error, got {err:?}");
        };
        assert_eq!(name, "c");
        assert_eq!(key, "0/1/4000");
        assert_eq!(reg.len(), 2);
    }
}
