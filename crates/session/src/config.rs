//! Session configuration.
//!
//! Loaded from JSON; every field has a default so a partial file (or `{}`)
//! is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Default attempts per chunk before it is marked terminally failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default capacity of the session event buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Tunables of one transfer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Target chunk size in bytes.
    pub chunk_size: usize,
    /// Send attempts per chunk, including the first.
    pub max_attempts: u32,
    /// Upper bound for one send attempt; `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_ms: Option<u64>,
    /// How long a stalled session waits for a channel to return.
    pub channel_grace_ms: u64,
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
    /// Compute a whole-file digest for the transfer metadata.
    pub file_checksum: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: multichannel_transfer::DEFAULT_CHUNK_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout_ms: None,
            channel_grace_ms: 0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            file_checksum: false,
        }
    }
}

impl SessionConfig {
    /// Reads a JSON config file.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.chunk_size == 0 {
            return Err(SessionError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(SessionError::InvalidConfig("max_attempts must be >= 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(SessionError::InvalidConfig("event_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn channel_grace(&self) -> Duration {
        Duration::from_millis(self.channel_grace_ms)
    }
}
