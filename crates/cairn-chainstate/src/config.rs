//! Builder, pipeline and replayer configuration.

use std::thread;

use serde::{Deserialize, Serialize};

use cairn_core::constants::default_duplicate_coinbases;
use cairn_core::types::Hash256;

/// Default bounded-queue capacity between pipeline stages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of previous-output loader threads.
pub const DEFAULT_LOADER_THREADS: usize = 4;

fn available_threads() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Validation pipeline settings.
///
/// `bypass_validation` skips the whole pipeline; `ignore_scripts` skips only
/// the script stage. Neither is ever inferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub bypass_validation: bool,
    pub ignore_scripts: bool,
    /// Log script failures at `warn` instead of failing the block.
    pub ignore_script_errors: bool,
    pub loader_threads: usize,
    pub tx_validator_threads: usize,
    pub script_validator_threads: usize,
    pub queue_capacity: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        let cpus = available_threads();
        Self {
            bypass_validation: false,
            ignore_scripts: false,
            ignore_script_errors: false,
            loader_threads: DEFAULT_LOADER_THREADS,
            tx_validator_threads: cpus,
            script_validator_threads: cpus * 2,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ValidationConfig {
    /// Configuration with every stage disabled.
    pub fn bypass() -> Self {
        Self {
            bypass_validation: true,
            ..Self::default()
        }
    }

    /// Small fixed pools. Used in tests and by the CLI on constrained hosts.
    pub fn minimal() -> Self {
        Self {
            loader_threads: 1,
            tx_validator_threads: 1,
            script_validator_threads: 1,
            queue_capacity: 16,
            ..Self::default()
        }
    }
}

/// [`ChainStateBuilder`](crate::builder::ChainStateBuilder) settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    pub validation: ValidationConfig,
    /// `(height, txid)` coinbases that are neither minted nor unminted.
    pub duplicate_coinbases: Vec<(u64, Hash256)>,
    /// Log statistics every this many blocks. Zero disables.
    pub stats_log_interval: u64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            duplicate_coinbases: default_duplicate_coinbases(),
            stats_log_interval: 1000,
            event_capacity: 256,
        }
    }
}

/// [`BlockReplayer`](crate::replayer::BlockReplayer) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub loader_threads: usize,
    pub extractor_threads: usize,
    pub queue_capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            loader_threads: DEFAULT_LOADER_THREADS,
            extractor_threads: available_threads(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scale_script_pool() {
        let cfg = ValidationConfig::default();
        assert_eq!(cfg.loader_threads, 4);
        assert_eq!(cfg.script_validator_threads, cfg.tx_validator_threads * 2);
        assert!(!cfg.bypass_validation);
    }

    #[test]
    fn builder_default_carries_allowlist() {
        let cfg = BuilderConfig::default();
        assert_eq!(cfg.duplicate_coinbases.len(), 2);
        assert_eq!(cfg.duplicate_coinbases[0].0, 91_842);
    }
}
