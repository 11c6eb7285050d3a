//! Store configuration.
//!
//! Loaded from a JSON file; every field has a default so a missing file or a
//! partial file still yields a usable configuration.

use crate::error::FailurePolicy;
use crate::model::entity::is_valid_identifier;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    InvalidStoreName(String),
    InvalidBusyTimeout,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            Self::Json(err) => write!(f, "failed to parse config: {err}"),
            Self::InvalidStoreName(name) => write!(
                f,
                "store name `{name}` must match [A-Za-z_][A-Za-z0-9_]*"
            ),
            Self::InvalidBusyTimeout => write!(f, "busy_timeout_ms must be greater than zero"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::InvalidStoreName(_) | Self::InvalidBusyTimeout => None,
        }
    }
}

/// Where durable stores live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreLocation {
    /// One `<name>.sqlite` file per store inside this directory.
    Directory(PathBuf),
    /// Private in-memory database, gone when the store is dropped.
    InMemory,
}

// -----------------------------------------------------------------------------
// StoreConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_store_name")]
    pub name: String,
    #[serde(default = "default_location")]
    pub location: StoreLocation,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_store_name(),
            location: default_location(),
            failure_policy: FailurePolicy::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: StoreLocation::InMemory,
            ..Self::default()
        }
    }

    pub fn at_directory(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            location: StoreLocation::Directory(directory.into()),
            ..Self::default()
        }
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Reads and validates a JSON config file; a missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path.as_ref()) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(ConfigError::Io(err)),
        };
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents).map_err(ConfigError::Json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_identifier(&self.name) {
            return Err(ConfigError::InvalidStoreName(self.name.clone()));
        }
        if self.busy_timeout_ms == 0 {
            return Err(ConfigError::InvalidBusyTimeout);
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_store_name() -> String {
    "objstore".to_string()
}

fn default_location() -> StoreLocation {
    StoreLocation::Directory(PathBuf::from(".objstore"))
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}
