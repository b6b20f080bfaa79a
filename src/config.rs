//! Core Configuration
//!
//! YAML configuration of the repository core. Every field has a default, so
//! an empty document is a valid configuration.

use crate::error::{Error, Result};
use crate::numberpool::DEFAULT_MINOR_RANGE;
use crate::objects::MinorNumber;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Role of the process hosting the repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Authoritative, persists every commit
    #[default]
    Controller,
    /// Holds controller-pushed state in memory only
    Satellite,
}

/// Inclusive range of automatically allocated minor numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinorRange {
    pub start: u32,
    pub end: u32,
}

impl Default for MinorRange {
    fn default() -> Self {
        Self {
            start: *DEFAULT_MINOR_RANGE.start(),
            end: *DEFAULT_MINOR_RANGE.end(),
        }
    }
}

/// Configuration for the repository core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Controller or satellite behaviour
    pub mode: Mode,
    /// Minor number pool range
    pub minor_range: MinorRange,
    /// Database file. `None` keeps the controller database in memory.
    pub database_path: Option<PathBuf>,
    /// Requests executed concurrently by the request executor
    pub max_concurrent_requests: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Controller,
            minor_range: MinorRange::default(),
            database_path: None,
            max_concurrent_requests: 16,
        }
    }
}

impl CoreConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let MinorRange { start, end } = self.minor_range;
        if start > end {
            return Err(Error::Configuration(format!(
                "minor range start {} is above end {}",
                start, end
            )));
        }
        if i64::from(end) > MinorNumber::MAX {
            return Err(Error::Configuration(format!(
                "minor range end {} exceeds the maximum minor number {}",
                end,
                MinorNumber::MAX
            )));
        }
        if self.max_concurrent_requests == 0 {
            return Err(Error::Configuration(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.mode == Mode::Satellite && self.database_path.is_some() {
            return Err(Error::Configuration(
                "a satellite does not use a database file".to_string(),
            ));
        }
        Ok(())
    }
}
