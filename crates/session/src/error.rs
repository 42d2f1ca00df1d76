//! Session error types.

use multichannel_transfer::TransferError;

/// Errors produced by transfer sessions and the channel registry.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chunking failed; `SourceUnreadable` lands here.
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("duplicate channel: {0}")]
    DuplicateChannel(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// A chunk used up its attempts.
    #[error("chunk {chunk_id} failed: {reason}")]
    ChunkTransfer { chunk_id: String, reason: String },

    /// No channel could make further progress.
    #[error("session failed with {} unresolved chunk(s)", unresolved.len())]
    SessionFailed { unresolved: Vec<String> },

    #[error("cancelled")]
    Cancelled,
}
