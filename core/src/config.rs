//! Bearer configuration
//!
//! Stored as JSON when persisted. Every field has a default so partial files
//! load cleanly.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bearer::framer::{DEFAULT_MAX_PDU_LEN, MIN_FRAME_SIZE};

/// Default capacity of the per-session listener channel
pub const DEFAULT_LISTENER_CAPACITY: usize = 32;

/// Errors for configuration validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid maximum PDU length: {0}")]
    InvalidMaxPduLen(u16),
    #[error("Invalid frame size override: {0}")]
    InvalidFrameSize(usize),
    #[error("Invalid listener capacity: {0}")]
    InvalidListenerCapacity(usize),
}

/// Configuration shared by bearers and bearer sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BearerConfig {
    /// Largest PDU accepted for segmentation or reassembly
    pub max_pdu_len: u16,
    /// Optional cap applied on top of the link's negotiated frame size
    pub frame_size_override: Option<usize>,
    /// Bounded capacity of the session event channel
    pub listener_capacity: usize,
}

impl Default for BearerConfig {
    fn default() -> Self {
        Self {
            max_pdu_len: DEFAULT_MAX_PDU_LEN,
            frame_size_override: None,
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
        }
    }
}

impl BearerConfig {
    /// Set the maximum PDU length
    pub fn with_max_pdu_len(mut self, max_pdu_len: u16) -> Self {
        self.max_pdu_len = max_pdu_len;
        self
    }

    /// Cap the frame size below what the link negotiates
    pub fn with_frame_size_override(mut self, frame_size: usize) -> Self {
        self.frame_size_override = Some(frame_size);
        self
    }

    /// Set the listener channel capacity
    pub fn with_listener_capacity(mut self, capacity: usize) -> Self {
        self.listener_capacity = capacity;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pdu_len == 0 {
            return Err(ConfigError::InvalidMaxPduLen(self.max_pdu_len));
        }
        if let Some(frame_size) = self.frame_size_override {
            if frame_size < MIN_FRAME_SIZE {
                return Err(ConfigError::InvalidFrameSize(frame_size));
            }
        }
        if self.listener_capacity == 0 {
            return Err(ConfigError::InvalidListenerCapacity(self.listener_capacity));
        }
        Ok(())
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: BearerConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}
