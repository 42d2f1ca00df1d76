//! Simulator configuration.
//!
//! Stored as JSON. Without a file the simulator runs a Wi-Fi channel and a
//! slower USB channel side by side.

use std::path::Path;

use multichannel_session::{ChannelKind, SessionConfig};
use serde::{Deserialize, Serialize};

/// Simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Session tunables (chunk size, retries, timeouts).
    #[serde(default)]
    pub session: SessionConfig,

    /// Simulated channels, in registration order.
    #[serde(default = "default_channels")]
    pub channels: Vec<SimChannel>,
}

/// One simulated transport channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimChannel {
    pub id: String,

    #[serde(default = "default_kind")]
    pub kind: ChannelKind,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_chunks: usize,

    /// Simulated link throughput.
    #[serde(default = "default_bytes_per_sec")]
    pub bytes_per_sec: u64,

    /// Fail every n-th send attempt (0 = never).
    #[serde(default)]
    pub fail_every: u32,

    /// Report the channel lost after this many delivered chunks.
    #[serde(default)]
    pub drop_after: Option<u32>,
}

fn default_kind() -> ChannelKind {
    ChannelKind::wifi()
}

fn default_max_concurrent() -> usize {
    2
}

fn default_bytes_per_sec() -> u64 {
    4 * 1024 * 1024
}

fn default_channels() -> Vec<SimChannel> {
    vec![
        SimChannel {
            id: "wlan0".into(),
            kind: ChannelKind::wifi(),
            max_concurrent_chunks: 3,
            bytes_per_sec: 8 * 1024 * 1024,
            fail_every: 0,
            drop_after: None,
        },
        SimChannel {
            id: "usb0".into(),
            kind: ChannelKind::usb(),
            max_concurrent_chunks: 1,
            bytes_per_sec: default_bytes_per_sec(),
            fail_every: 0,
            drop_after: None,
        },
    ]
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            channels: default_channels(),
        }
    }
}

impl SimConfig {
    /// Loads the config from `path`, or the built-in default when `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config: SimConfig = serde_json::from_str(&content)?;
                tracing::debug!(path = %path.display(), "configuration loaded");
                config
            }
            None => SimConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.session.validate()?;
        if self.channels.is_empty() {
            anyhow::bail!("at least one channel is required");
        }
        if let Some(c) = self.channels.iter().find(|c| c.bytes_per_sec == 0) {
            anyhow::bail!("channel {} needs a non-zero bytes_per_sec", c.id);
        }
        Ok(())
    }
}
