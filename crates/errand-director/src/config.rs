//! director.toml configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrandError, ErrandResult};
use crate::manifest::ParseOptions;

/// Director-wide settings, constructed once and handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectorConfig {
    /// How long a run waits for the deployment lock.
    pub lock_timeout_secs: u64,
    pub runner: RunnerConfig,
    /// Options passed through to the manifest parser.
    pub manifest: ParseOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// How often a running errand evaluates its checkpoint.
    pub poll_interval_ms: u64,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 10,
            runner: RunnerConfig::default(),
            manifest: ParseOptions::new(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

impl DirectorConfig {
    pub fn from_file(path: &Path) -> ErrandResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ErrandError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ErrandResult<Self> {
        toml::from_str(content).map_err(|e| ErrandError::Config(e.to_string()))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
