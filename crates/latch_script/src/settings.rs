//! Bridge settings

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine limits and logging switches applied when a bridge is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Heap limit in bytes; `None` leaves the engine default
    pub memory_limit: Option<usize>,
    /// Native stack budget for script execution, in bytes
    pub max_stack_size: Option<usize>,
    /// Allocation volume that triggers a collection cycle
    pub gc_threshold: Option<usize>,
    /// Log every evaluated source snippet at debug level
    pub log_evaluations: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            memory_limit: None,
            max_stack_size: Some(1024 * 1024),
            gc_threshold: None,
            log_evaluations: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),
}

impl BridgeSettings {
    pub fn from_json(source: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }
}
