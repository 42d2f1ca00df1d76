//! Multi-channel transfer sessions.
//!
//! A [`TransferSession`] chunks one file and moves the chunks concurrently
//! over every usable channel in a [`ChannelRegistry`]. Channels are
//! reached through the [`TransportAdapter`] trait; the app provides the
//! concrete implementations (Wi-Fi socket, USB tether, ...).
//!
//! # Pipeline
//!
//! 1. **Chunk**: split the source into checksummed chunks (blocking pool)
//! 2. **Schedule**: hand pending chunks to the channel with the most free
//!    capacity, bounded by each channel's `max_concurrent_chunks`
//! 3. **Track**: fold progress into a never-decreasing aggregate
//! 4. **Recover**: retry failed chunks, redistribute chunks of lost channels
//! 5. **Finish**: settle in-flight attempts, publish one terminal outcome

pub mod channel;
pub mod config;
pub mod error;
mod scheduler;
pub mod session;
mod state;
pub mod transport;
pub mod types;

pub use channel::{ChannelEvent, ChannelInfo, ChannelRegistry, RegisteredChannel};
pub use config::SessionConfig;
pub use error::SessionError;
pub use session::TransferSession;
pub use transport::{ProgressSink, SendFuture, TransportAdapter, TransportError};
pub use types::{SessionEvent, TransferOutcome};

pub use multichannel_protocol::{
    ChannelKind, ChannelSnapshot, ChunkSnapshot, ChunkStatus, SessionStatus, TransferMetadata,
    TransferProgress,
};
pub use multichannel_transfer::{Chunk, DEFAULT_CHUNK_SIZE};
