//! The enumerated configuration surface: training, runtime, and optimizer
//! settings, loadable from TOML or built programmatically with `Default`-seeded values,
//! using the same `serde` + `toml` combination as the rest of this workspace.

use serde::{Deserialize, Serialize};

use crate::error::{CllmError, Result};
use crate::optimizer::OptimizerConfig;

/// `{batch_size, sequence_length, num_epochs, learning_rate, weight_decay, gradient_clip,
/// save_every}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub sequence_length: usize,
    pub num_epochs: u64,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub gradient_clip: f32,
    pub save_every: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self { batch_size: 32, sequence_length: 128, num_epochs: 1, learning_rate: 1e-3, weight_decay: 0.0, gradient_clip: 1.0, save_every: 1 }
    }
}

/// `{num_worker_threads (0 = auto), prefetch_capacity, work_queue_capacity,
/// symmetry_order K, seed}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub num_worker_threads: usize,
    pub prefetch_capacity: usize,
    pub work_queue_capacity: usize,
    pub symmetry_order: u32,
    /// Seed for deterministic parameter initialization (`ModelDims::init_params`).
    pub seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_worker_threads: 0,
            prefetch_capacity: cllm_queues::DEFAULT_PREFETCH_CAPACITY,
            work_queue_capacity: cllm_queues::DEFAULT_WORK_QUEUE_CAPACITY,
            symmetry_order: crate::hierarchy::DEFAULT_SYMMETRY_ORDER,
            seed: 1_618_033,
        }
    }
}

impl RuntimeConfig {
    /// Resolves `num_worker_threads == 0` to `cores - 1` (minimum 1)
    pub fn resolved_worker_count(&self) -> usize {
        if self.num_worker_threads > 0 {
            return self.num_worker_threads;
        }
        std::thread::available_parallelism().map(|n| n.get().saturating_sub(1).max(1)).unwrap_or(1)
    }
}

/// The full configuration surface this crate accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub training: TrainingConfig,
    pub runtime: RuntimeConfig,
    pub optimizer: OptimizerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self { training: TrainingConfig::default(), runtime: RuntimeConfig::default(), optimizer: OptimizerConfig::default() }
    }
}

impl Config {
    /// Parses a TOML document into a full configuration, falling back to
    /// `Default`-seeded values for any table or field left unspecified.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CllmError::MalformedInput(format!("invalid configuration: {e}")))
    }

    /// Reads and parses a TOML configuration file.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CllmError::MalformedInput(format!("cannot read config file {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let cfg = Config::default();
        assert_eq!(cfg.training.batch_size, 32);
        assert_eq!(cfg.runtime.symmetry_order, 12);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml_str("[training]\nbatch_size = 4\n").unwrap();
        assert_eq!(cfg.training.batch_size, 4);
        assert_eq!(cfg.training.num_epochs, 1); // default, unspecified
        assert_eq!(cfg.runtime.symmetry_order, 12); // whole table unspecified
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let err = Config::from_toml_str("not valid toml [[[").unwrap_err();
        assert!(matches!(err, CllmError::MalformedInput(_)));
    }
}
