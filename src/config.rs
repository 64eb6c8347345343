//! Engine configuration.
//!
//! Every field has a default, so a JSON document only needs to name what it
//! changes. Algorithms are described by [`AlgorithmConfig`] entries and built
//! with [`AlgorithmConfig::build`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::algorithm::{MultiplicityConfig, MultiplicityTrigger, ThroughputTrigger, TriggerAlgorithm};
use crate::error::ValidationError;
use crate::monitor::MonitorSystemConfig;
use crate::negotiator::NegotiatorLimits;
use crate::payload::SourceId;
use crate::queue::QueueMode;
use crate::request::{AlgorithmId, TriggerType};

/// Settings for one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Source id stamped on merged requests.
    pub source_id: SourceId,
    /// First permanent output id.
    pub first_uid: u64,
    /// Per-algorithm input queues.
    pub queue: QueueMode,
    pub output_queue_capacity: usize,
    pub monitor_queue_capacity: usize,
    pub max_negotiation_iterations: usize,
    pub max_consecutive_adapter_failures: u32,
    /// Upper bound on how long the coordinator sleeps without a notification.
    ///
    /// Progress is driven by notifications; this timeout is only a liveness
    /// backstop and does not need to be short.
    pub idle_poll_ms: u64,
    pub algorithms: Vec<AlgorithmConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let limits = NegotiatorLimits::default();
        Self {
            source_id: SourceId::GLOBAL_TRIGGER,
            first_uid: 0,
            queue: QueueMode::default(),
            output_queue_capacity: 1024,
            monitor_queue_capacity: MonitorSystemConfig::default().queue_capacity,
            max_negotiation_iterations: limits.max_iterations,
            max_consecutive_adapter_failures: limits.max_consecutive_failures,
            idle_poll_ms: 1000,
            algorithms: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// `ConfigParse` for malformed JSON, otherwise whatever
    /// [`EngineConfig::validate`] rejects.
    pub fn from_json_str(s: &str) -> Result<Self, ValidationError> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| ValidationError::ConfigParse {
            message: format!("deserialize config: {e}"),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// `ConfigParse` if the file cannot be read, otherwise as
    /// [`EngineConfig::from_json_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ValidationError::ConfigParse {
            message: format!("read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// # Errors
    ///
    /// Rejects zero capacities and bounds, and invalid algorithm parameters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = |field: &str, value: u64| {
            if value == 0 {
                Err(ValidationError::InvalidConfig {
                    field: field.to_string(),
                    reason: "must be at least 1".to_string(),
                })
            } else {
                Ok(())
            }
        };

        if let QueueMode::Bounded { capacity } = self.queue {
            positive("queue.capacity", capacity as u64)?;
        }
        positive("output_queue_capacity", self.output_queue_capacity as u64)?;
        positive("monitor_queue_capacity", self.monitor_queue_capacity as u64)?;
        positive("max_negotiation_iterations", self.max_negotiation_iterations as u64)?;
        positive(
            "max_consecutive_adapter_failures",
            u64::from(self.max_consecutive_adapter_failures),
        )?;
        positive("idle_poll_ms", self.idle_poll_ms)?;

        for alg in &self.algorithms {
            alg.validate()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn negotiator_limits(&self) -> NegotiatorLimits {
        NegotiatorLimits {
            max_iterations: self.max_negotiation_iterations.max(1),
            max_consecutive_failures: self.max_consecutive_adapter_failures.max(1),
        }
    }

    #[must_use]
    pub fn monitor_config(&self) -> MonitorSystemConfig {
        MonitorSystemConfig {
            queue_capacity: self.monitor_queue_capacity.max(1),
        }
    }

    #[must_use]
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

/// One configured algorithm.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    Multiplicity(MultiplicityConfig),
    Throughput {
        name: String,
        trigger_type: TriggerType,
        config_id: i32,
        source_id: SourceId,
    },
}

impl AlgorithmConfig {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Multiplicity(cfg) => &cfg.name,
            Self::Throughput { name, .. } => name,
        }
    }

    /// # Errors
    ///
    /// Rejects parameters the algorithm could not run with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Multiplicity(cfg) => cfg.validate(),
            Self::Throughput { name, trigger_type, .. } => {
                if trigger_type.is_merged() {
                    return Err(ValidationError::InvalidConfig {
                        field: format!("{name}.trigger_type"),
                        reason: "reserved for merged requests".to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Instantiates the algorithm.
    ///
    /// # Errors
    ///
    /// Same as [`AlgorithmConfig::validate`].
    pub fn build(&self) -> Result<Box<dyn TriggerAlgorithm>, ValidationError> {
        self.validate()?;
        Ok(match self {
            Self::Multiplicity(cfg) => Box::new(MultiplicityTrigger::new(cfg.clone())),
            Self::Throughput {
                name,
                trigger_type,
                config_id,
                source_id,
            } => Box::new(ThroughputTrigger::new(
                name.clone(),
                AlgorithmId::new(*trigger_type, *config_id, *source_id),
            )),
        })
    }
}
