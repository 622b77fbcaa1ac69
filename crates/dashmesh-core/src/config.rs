//! Node configuration, loaded from TOML.
//!
//! ```toml
//! heartbeat_interval_secs = 30
//! claim_policy = "same_owner"
//!
//! [executor]
//! default_memory_limit = "1g"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::claim::ClaimPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub heartbeat_interval_secs: u64,
    /// Presences older than this are not counted as active.
    pub liveness_window_secs: u64,
    /// Window for the "active users" network stat.
    pub stats_active_window_secs: u64,
    pub transaction_retry_budget: u32,
    pub claim_policy: ClaimPolicy,
    pub max_concurrent_tasks: usize,
    pub executor: ExecutorConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            liveness_window_secs: 60,
            stats_active_window_secs: 300,
            transaction_retry_budget: 16,
            claim_policy: ClaimPolicy::Any,
            max_concurrent_tasks: 1,
            executor: ExecutorConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_secs must be > 0".into()));
        }
        if self.liveness_window_secs == 0 || self.stats_active_window_secs == 0 {
            return Err(ConfigError::Invalid("windows must be > 0".into()));
        }
        if self.transaction_retry_budget == 0 {
            return Err(ConfigError::Invalid("transaction_retry_budget must be > 0".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid("max_concurrent_tasks must be > 0".into()));
        }
        if self.executor.max_code_bytes == 0 {
            return Err(ConfigError::Invalid("executor.max_code_bytes must be > 0".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn stats_active_window(&self) -> Duration {
        Duration::from_secs(self.stats_active_window_secs)
    }
}

/// Settings for the docker-backed executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub docker_bin: String,
    pub python_image: String,
    pub default_memory_limit: String,
    pub default_cpu_limit: String,
    pub max_code_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            python_image: "python:3.9-slim".into(),
            default_memory_limit: "512m".into(),
            default_cpu_limit: "1".into(),
            max_code_bytes: 10_000,
        }
    }
}
