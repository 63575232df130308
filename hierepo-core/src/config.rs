//! Workspace configuration
//!
//! Stored as JSON; a missing file yields the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Settings for a [`WorkspaceManager`](crate::WorkspaceManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Register for changes made by other sessions when the backend supports
    /// observation.
    #[serde(default = "default_true")]
    pub observe_external_changes: bool,
    /// Ask the backend to leave out events caused by this session; those are
    /// already delivered through the local path.
    #[serde(default = "default_true")]
    pub exclude_local_events: bool,
    /// Maximum number of item states kept in the cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Log every executed operation at info level.
    #[serde(default = "default_true")]
    pub log_operations: bool,
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    10_000
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            observe_external_changes: true,
            exclude_local_events: true,
            cache_capacity: default_cache_capacity(),
            log_operations: true,
        }
    }
}

impl WorkspaceConfig {
    /// Load the config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read workspace config from {:?}", path))?;
        let config: WorkspaceConfig = serde_json::from_str(&data)
            .with_context(|| "Failed to parse workspace config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Save the config to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            anyhow::bail!("cache_capacity must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = WorkspaceConfig::load(&tmp.path().join("workspace.json")).unwrap();
        assert_eq!(config, WorkspaceConfig::default());
        assert!(config.observe_external_changes);
        assert_eq!(config.cache_capacity, 10_000);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("workspace.json");
        let config = WorkspaceConfig {
            observe_external_changes: false,
            cache_capacity: 16,
            ..WorkspaceConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(WorkspaceConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_and_validation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("workspace.json");

        fs::write(&path, r#"{ "log_operations": false }"#).unwrap();
        let config = WorkspaceConfig::load(&path).unwrap();
        assert!(!config.log_operations);
        assert!(config.exclude_local_events);

        fs::write(&path, r#"{ "cache_capacity": 0 }"#).unwrap();
        assert!(WorkspaceConfig::load(&path).is_err());
    }
}
