//! Shared types for multi-channel file transfer.
//!
//! Everything here is plain data: status enums, the caller-visible progress
//! snapshot and the metadata a transport announces to the peer before the
//! first chunk. Serialization uses `snake_case` enum tags and `camelCase`
//! field names so snapshots can be handed to a UI layer as JSON unchanged.

pub mod messages;
pub mod types;

pub use messages::TransferMetadata;
pub use types::{
    ChannelKind, ChannelSnapshot, ChunkSnapshot, ChunkStatus, SessionStatus, TransferProgress,
};
