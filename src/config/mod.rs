use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::scanner::DEFAULT_NAME_PATTERNS;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::serial::link::{
    DEFAULT_MAX_READ_INCREMENTS, DEFAULT_READ_CHUNK_SIZE, DEFAULT_RESPONSE_TIMEOUT,
};
use crate::serial::LinkConfig;

pub const DEFAULT_BAUD_RATE: u32 = 57600;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Bridge settings supplied by the bootstrap shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub baud_rate: u32,
    pub history_capacity: usize,
    pub response_timeout_ms: u64,
    pub read_chunk_size: usize,
    pub max_read_increments: usize,
    pub scan_interval_ms: u64,
    pub dev_dir: PathBuf,
    pub name_patterns: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_read_increments: DEFAULT_MAX_READ_INCREMENTS,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            dev_dir: PathBuf::from("/dev"),
            name_patterns: DEFAULT_NAME_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON document; absent keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn nonzero(field: &'static str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        nonzero("baud_rate", self.baud_rate as u64)?;
        nonzero("response_timeout_ms", self.response_timeout_ms)?;
        nonzero("read_chunk_size", self.read_chunk_size as u64)?;
        nonzero("max_read_increments", self.max_read_increments as u64)?;
        nonzero("scan_interval_ms", self.scan_interval_ms)?;

        if self.name_patterns.is_empty() || self.name_patterns.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "name_patterns",
                reason: "patterns must be present and non-empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            read_chunk_size: self.read_chunk_size,
            max_read_increments: self.max_read_increments,
        }
    }
}
