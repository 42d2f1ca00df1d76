use serde::{Deserialize, Serialize};

/// Announces a transfer to the receiving peer before any chunk is sent.
///
/// Every channel sends this once when it opens, so the receiver can size
/// its reassembly buffer and verify the result independently of which
/// channel delivered which chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u64,
    pub chunk_size: u64,
    /// SHA-256 hex digest of the whole file, empty when not computed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_checksum: String,
}
