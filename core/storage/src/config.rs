//! Storage engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use graphagent_common::{Error, Result};

/// Tunables shared by every storage the engine creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Transfer budget in megabits per second; 0 disables limiting.
    pub rate_limit_mbps: u64,
    /// Number of sessions whose storage clients are kept alive.
    pub session_cache_capacity: usize,
    /// Files the tree walker may queue ahead of a recursive upload.
    pub walk_queue_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            rate_limit_mbps: 0,
            session_cache_capacity: 32,
            walk_queue_depth: 64,
        }
    }
}

impl StorageConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_cache_capacity == 0 {
            return Err(Error::Config(
                "session_cache_capacity must be positive".to_string(),
            ));
        }
        if self.walk_queue_depth == 0 {
            return Err(Error::Config("walk_queue_depth must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.rate_limit_mbps, 0);
        assert_eq!(config.session_cache_capacity, 32);
        assert_eq!(config.walk_queue_depth, 64);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agent.json");
        std::fs::write(&path, r#"{"rate_limit_mbps": 100}"#).unwrap();

        let config = StorageConfig::load(&path).await.unwrap();
        assert_eq!(config.rate_limit_mbps, 100);
        assert_eq!(config.session_cache_capacity, 32);
    }

    #[tokio::test]
    async fn test_load_rejects_bad_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agent.json");

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            StorageConfig::load(&path).await,
            Err(Error::Config(_))
        ));

        std::fs::write(&path, r#"{"walk_queue_depth": 0}"#).unwrap();
        assert!(matches!(
            StorageConfig::load(&path).await,
            Err(Error::Config(_))
        ));

        assert!(matches!(
            StorageConfig::load(&temp.path().join("absent.json")).await,
            Err(Error::Config(_))
        ));
    }
}
