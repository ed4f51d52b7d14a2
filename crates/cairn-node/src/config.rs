//! Node configuration.
//!
//! [`NodeConfig`] has defaults for every field and is loaded from an
//! optional TOML file layered under `CAIRN_*` environment variables
//! (nested fields use `__`, e.g. `CAIRN_VALIDATION__IGNORE_SCRIPTS=true`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cairn_chainstate::{BuilderConfig, ReplayConfig, ValidationConfig};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Configuration for a cairn data directory and the engine running over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "debug", "cairn_chainstate=trace").
    pub log_level: String,
    pub log_format: LogFormat,
    pub validation: ValidationConfig,
    pub replay: ReplayConfig,
    /// Log builder statistics every this many blocks.
    pub stats_log_interval: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cairn");

        Self {
            data_dir,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            validation: ValidationConfig::default(),
            replay: ReplayConfig::default(),
            stats_log_interval: 1000,
        }
    }
}

impl NodeConfig {
    /// Load defaults, then `file` if it exists, then `CAIRN_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, NodeError> {
        let defaults = config::Config::try_from(&NodeConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix("CAIRN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
            .map_err(NodeError::from)
    }

    /// Path to the RocksDB chain-state directory.
    pub fn chainstate_path(&self) -> PathBuf {
        self.data_dir.join("chainstate")
    }

    /// Path to the RocksDB block directory.
    pub fn blocks_path(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            validation: self.validation.clone(),
            stats_log_interval: self.stats_log_interval,
            ..BuilderConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_log_level_is_info() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn default_data_dir_ends_with_cairn() {
        let cfg = NodeConfig::default();
        assert!(
            cfg.data_dir.ends_with("cairn"),
            "data_dir should end with 'cairn': {:?}",
            cfg.data_dir
        );
    }

    #[test]
    fn paths_append_to_data_dir() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/cairn-test"),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.chainstate_path(), PathBuf::from("/tmp/cairn-test/chainstate"));
        assert_eq!(cfg.blocks_path(), PathBuf::from("/tmp/cairn-test/blocks"));
    }

    #[test]
    fn builder_config_carries_validation_flags() {
        let cfg = NodeConfig {
            validation: ValidationConfig::bypass(),
            stats_log_interval: 10,
            ..NodeConfig::default()
        };
        let builder = cfg.builder_config();
        assert!(builder.validation.bypass_validation);
        assert_eq!(builder.stats_log_interval, 10);
        assert_eq!(builder.duplicate_coinbases.len(), 2);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        let toml = r#"
data_dir = "/srv/cairn"
log_format = "json"

[validation]
ignore_scripts = true
loader_threads = 2
"#;
        writeln!(file, "{toml}").unwrap();

        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/cairn"));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(cfg.validation.ignore_scripts);
        assert_eq!(cfg.validation.loader_threads, 2);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg.stats_log_interval, 1000);
    }
}
