//! Engine configuration.
//!
//! The engine exposes no CLI of its own; the host application constructs an
//! [`EngineConfig`] directly or deserializes one from its own config file.
//! Every field has a default, so an empty YAML document is a valid config.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables supplied by the host application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Idle seconds after the last mutation before a persistence save runs.
    #[serde(default = "default_quiet_interval_secs")]
    pub quiet_interval_secs: u64,

    /// Maximum document size accepted for ingestion, in bytes.
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,

    /// Capacity of the replica update bus. Subscribers that fall further
    /// behind than this see a lag warning and a conservative re-dirty.
    #[serde(default = "default_update_bus_capacity")]
    pub update_bus_capacity: usize,
}

fn default_quiet_interval_secs() -> u64 {
    5
}

fn default_max_document_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_update_bus_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quiet_interval_secs: default_quiet_interval_secs(),
            max_document_bytes: default_max_document_bytes(),
            update_bus_capacity: default_update_bus_capacity(),
        }
    }
}

impl EngineConfig {
    /// The quiet interval as a [`Duration`].
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_secs(self.quiet_interval_secs)
    }

    /// Parses a config from a YAML document. Missing fields take defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Loads a config from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.quiet_interval(), Duration::from_secs(5));
        assert_eq!(config.max_document_bytes, 2 * 1024 * 1024);
        assert_eq!(config.update_bus_capacity, 256);
    }

    #[test]
    fn test_empty_yaml_is_all_defaults() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config.quiet_interval_secs, 5);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let config = EngineConfig::from_yaml_str("quiet_interval_secs: 1\n").unwrap();
        assert_eq!(config.quiet_interval(), Duration::from_secs(1));
        assert_eq!(config.max_document_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "max_document_bytes: 1024\n").unwrap();
        let config = EngineConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.max_document_bytes, 1024);
        assert_eq!(config.quiet_interval_secs, 5);
    }
}
