use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport kind of a channel.
///
/// An open set: `wifi` and `usb` are provided as constants, any other
/// label (`ethernet`, `bt`, ...) is equally valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKind(String);

impl ChannelKind {
    pub const WIFI: &'static str = "wifi";
    pub const USB: &'static str = "usb";

    /// Creates a kind from any label.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// Shorthand for the `wifi` kind.
    pub fn wifi() -> Self {
        Self::new(Self::WIFI)
    }

    /// Shorthand for the `usb` kind.
    pub fn usb() -> Self {
        Self::new(Self::USB)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle state of a single chunk.
///
/// `Pending -> Assigned -> Transferring -> {Completed | Failed}`, with
/// `Failed -> Pending` when the chunk is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Assigned,
    Transferring,
    Completed,
    Failed,
}

/// Lifecycle state of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Chunking the source.
    Preparing,
    /// Chunks are being moved over the channels.
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time view of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSnapshot {
    pub id: String,
    pub index: u64,
    pub size: u64,
    pub status: ChunkStatus,
    /// 0-100, only meaningful while `Transferring`.
    pub progress: u8,
    /// Failed send attempts so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Point-in-time view of one channel as seen by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub id: String,
    pub kind: ChannelKind,
    pub available: bool,
    pub in_flight: usize,
    pub max_concurrent_chunks: usize,
    pub completed_chunks: u64,
    pub bytes_sent: u64,
    pub bytes_per_second: f64,
}

/// Caller-visible progress of a transfer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub session_id: String,
    pub file_name: String,
    pub status: SessionStatus,
    pub total_bytes: u64,
    /// Size-weighted aggregate, never decreases over a session.
    pub percent: f64,
    pub chunks: Vec<ChunkSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelSnapshot>,
}

impl TransferProgress {
    /// Number of chunks in `Completed` state.
    pub fn completed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count()
    }

    /// Ids of chunks that are not `Completed`, in index order.
    pub fn unresolved_chunk_ids(&self) -> Vec<String> {
        self.chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .map(|c| c.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u64, status: ChunkStatus) -> ChunkSnapshot {
        ChunkSnapshot {
            id: format!("movie.mkv_chunk_{index}"),
            index,
            size: 10,
            status,
            progress: 0,
            attempts: 0,
            channel: None,
            last_error: None,
        }
    }

    #[test]
    fn chunk_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ChunkStatus::Transferring).unwrap(),
            "\"transferring\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn channel_kind_is_a_plain_string() {
        let kind = ChannelKind::new("ethernet");
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"ethernet\"");
        let parsed: ChannelKind = serde_json::from_str("\"usb\"").unwrap();
        assert_eq!(parsed, ChannelKind::usb());
        assert_eq!(parsed.to_string(), "usb");
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Preparing.is_terminal());
        assert!(!SessionStatus::Transferring.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn chunk_snapshot_omits_empty_fields() {
        let json = serde_json::to_string(&chunk(0, ChunkStatus::Pending)).unwrap();
        assert!(!json.contains("channel"));
        assert!(!json.contains("lastError"));
        assert!(json.contains("\"index\":0"));
    }

    #[test]
    fn progress_unresolved_ids() {
        let progress = TransferProgress {
            session_id: "s1".into(),
            file_name: "movie.mkv".into(),
            status: SessionStatus::Failed,
            total_bytes: 30,
            percent: 33.3,
            chunks: vec![
                chunk(0, ChunkStatus::Completed),
                chunk(1, ChunkStatus::Failed),
                chunk(2, ChunkStatus::Pending),
            ],
            channels: vec![],
        };
        assert_eq!(progress.completed_chunks(), 1);
        assert_eq!(
            progress.unresolved_chunk_ids(),
            vec!["movie.mkv_chunk_1", "movie.mkv_chunk_2"]
        );
    }
}
