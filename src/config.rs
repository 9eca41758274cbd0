//! Tracker configuration
//!
//! Loaded from a JSON file; every field has a default so a partial (or empty)
//! object is valid. The gait threshold and step interval are constants in
//! [`crate::accumulator`] and are not configurable here.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrackerError;
use crate::types::{FilterMode, SensorCapabilities};

/// Default location of the JSON document store
pub const DEFAULT_STORE_PATH: &str = "stepflux-store.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Accumulation variant
    pub filter: FilterMode,
    /// Sensors assumed present when the host does not report them
    pub sensors: SensorCapabilities,
    /// JSON document store used by the CLI and FFI hosts
    pub store_path: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            filter: FilterMode::Auto,
            sensors: SensorCapabilities::default(),
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
        }
    }
}

impl TrackerConfig {
    pub fn from_json(json: &str) -> Result<Self, TrackerError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, TrackerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a config file
    pub fn load(path: &Path) -> Result<Self, TrackerError> {
        let content = fs::read_to_string(path).map_err(|e| {
            TrackerError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }
}
