//! Chunking, checksums and progress aggregation for multi-channel transfer.
//!
//! A source stream is split by [`ChunkReader`] into ordered, immutable
//! [`Chunk`]s, each carrying a SHA-256 digest of its bytes. The
//! [`ProgressAggregator`] folds per-chunk progress into a size-weighted
//! percentage that never decreases.

mod chunked;
mod progress;
mod types;
mod validation;

pub use chunked::{ChunkReader, ChunkingProgress, calculate_file_checksum, checksum_bytes};
pub use progress::{ProgressAggregator, SpeedCalculator};
pub use types::{Chunk, chunk_id};
pub use validation::validate_file_name;

/// Default chunk size: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("source unreadable: {0}")]
    SourceUnreadable(#[from] std::io::Error),

    #[error("checksum mismatch for chunk {0}")]
    ChecksumMismatch(String),

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),
}
