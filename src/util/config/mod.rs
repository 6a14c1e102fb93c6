//! Harness configuration
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! max_steps = 200
//! iterations = 500
//! scheduler = "random"
//! schedule_dir = ".tangle"
//! seed = 42
//! ```
//!
//! # Usage
//!
//! ```rust
//! use tangle::util::config::{parse_config, RuntimeConfig};
//!
//! let config = parse_config("iterations = 10").unwrap();
//! assert_eq!(config.iterations, 10);
//! assert_eq!(config.max_steps, RuntimeConfig::default().max_steps);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::runtime::scheduler::SchedulerKind;

/// Settings for one [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Scheduling steps allowed per iteration
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Iterations per run
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Interleaving policy
    #[serde(default)]
    pub scheduler: SchedulerKind,
    /// Where schedules are written; empty disables persistence
    #[serde(default = "default_schedule_dir")]
    pub schedule_dir: PathBuf,
    /// Fixed seed for the per-iteration seed generator
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_steps() -> usize {
    100
}

fn default_iterations() -> usize {
    100
}

fn default_schedule_dir() -> PathBuf {
    PathBuf::from(".tangle")
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            iterations: default_iterations(),
            scheduler: SchedulerKind::default(),
            schedule_dir: default_schedule_dir(),
            seed: None,
        }
    }
}

impl RuntimeConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the step budget.
    pub fn with_max_steps(
        mut self,
        max_steps: usize,
    ) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set the iteration count.
    pub fn with_iterations(
        mut self,
        iterations: usize,
    ) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the interleaving policy.
    pub fn with_scheduler(
        mut self,
        scheduler: SchedulerKind,
    ) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the schedule directory.
    pub fn with_schedule_dir(
        mut self,
        dir: impl Into<PathBuf>,
    ) -> Self {
        self.schedule_dir = dir.into();
        self
    }

    /// Do not write schedules.
    pub fn without_persistence(mut self) -> Self {
        self.schedule_dir = PathBuf::new();
        self
    }

    /// Fix the seed generator.
    pub fn with_seed(
        mut self,
        seed: u64,
    ) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check if schedules are written to disk.
    #[inline]
    pub fn persistence_enabled(&self) -> bool {
        !self.schedule_dir.as_os_str().is_empty()
    }

    /// Reject settings no run could make progress with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid("max_steps must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parse a configuration from TOML text and validate it.
pub fn parse_config(content: &str) -> Result<RuntimeConfig, ConfigError> {
    let config: RuntimeConfig = toml::from_str(content).map_err(ConfigError::ParseError)?;
    config.validate()?;
    Ok(config)
}

/// Load a configuration file.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
    parse_config(&content)
}

/// Write a configuration file.
pub fn save_config(
    path: &Path,
    config: &RuntimeConfig,
) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config).map_err(ConfigError::SerializeError)?;
    fs::write(path, content).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    ParseError(toml::de::Error),
    SerializeError(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Config parse error: {}", e),
            ConfigError::SerializeError(e) => write!(f, "Config serialize error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
