//! Channel registry.
//!
//! Holds the declared transport channels in registration order together
//! with their adapters. Availability flips and new registrations are
//! broadcast so running sessions can react without polling.

use std::sync::{Arc, RwLock};

use multichannel_protocol::ChannelKind;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::SessionError;
use crate::transport::TransportAdapter;

/// Capacity of the registry event buffer per subscriber.
const EVENT_CAPACITY: usize = 64;

/// Declared properties of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    /// Unique id within the registry (`wlan0`, `usb-tether`, ...).
    pub id: String,
    pub kind: ChannelKind,
    /// Chunks this channel may carry at once (>= 1).
    pub max_concurrent_chunks: usize,
    pub available: bool,
}

impl ChannelInfo {
    /// Creates an available channel.
    pub fn new(id: impl Into<String>, kind: ChannelKind, max_concurrent_chunks: usize) -> Self {
        Self {
            id: id.into(),
            kind,
            max_concurrent_chunks,
            available: true,
        }
    }
}

/// A channel together with the adapter that drives it.
#[derive(Clone)]
pub struct RegisteredChannel {
    pub info: ChannelInfo,
    pub adapter: Arc<dyn TransportAdapter>,
}

/// Change notifications emitted by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A channel was registered.
    Added(String),
    /// A channel became usable or unusable.
    AvailabilityChanged { id: String, available: bool },
}

/// Set of transport channels shared by transfer sessions (thread-safe).
pub struct ChannelRegistry {
    channels: RwLock<Vec<RegisteredChannel>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            channels: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Registers a channel; its position fixes its tie-break priority.
    pub fn register(
        &self,
        info: ChannelInfo,
        adapter: Arc<dyn TransportAdapter>,
    ) -> Result<(), SessionError> {
        if info.max_concurrent_chunks == 0 {
            return Err(SessionError::InvalidConfig(format!(
                "channel {} must allow at least one chunk in flight",
                info.id
            )));
        }

        let id = info.id.clone();
        {
            let mut channels = self.channels.write().unwrap();
            if channels.iter().any(|c| c.info.id == id) {
                return Err(SessionError::DuplicateChannel(id));
            }
            info!(
                channel = %id,
                kind = %info.kind,
                max_concurrent = info.max_concurrent_chunks,
                "channel registered"
            );
            channels.push(RegisteredChannel { info, adapter });
        }

        let _ = self.events.send(ChannelEvent::Added(id));
        Ok(())
    }

    /// Marks a channel usable or unusable.
    ///
    /// Returns `true` if the flag changed; an unchanged flag emits nothing.
    pub fn set_available(&self, id: &str, available: bool) -> Result<bool, SessionError> {
        {
            let mut channels = self.channels.write().unwrap();
            let channel = channels
                .iter_mut()
                .find(|c| c.info.id == id)
                .ok_or_else(|| SessionError::UnknownChannel(id.to_string()))?;
            if channel.info.available == available {
                return Ok(false);
            }
            channel.info.available = available;
        }

        info!(channel = %id, available, "channel availability changed");
        let _ = self.events.send(ChannelEvent::AvailabilityChanged {
            id: id.to_string(),
            available,
        });
        Ok(true)
    }

    /// Returns a channel by id.
    pub fn get(&self, id: &str) -> Option<RegisteredChannel> {
        let channels = self.channels.read().unwrap();
        channels.iter().find(|c| c.info.id == id).cloned()
    }

    /// Returns all channels in registration order.
    pub fn snapshot(&self) -> Vec<RegisteredChannel> {
        let channels = self.channels.read().unwrap();
        channels.clone()
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        let channels = self.channels.read().unwrap();
        channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to registry changes made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
