use crate::TransferError;
use crate::chunked::checksum_bytes;

/// Builds the stable id of chunk `index` of `file_name`.
pub fn chunk_id(file_name: &str, index: u64) -> String {
    format!("{file_name}_chunk_{index}")
}

/// An immutable slice of the source, ready to be sent on any channel.
///
/// Fields are private so the checksum can never drift from the payload
/// once the chunk has been produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    id: String,
    index: u64,
    offset: u64,
    data: Vec<u8>,
    checksum: String,
}

impl Chunk {
    /// Creates a chunk and computes its checksum.
    pub fn new(file_name: &str, index: u64, offset: u64, data: Vec<u8>) -> Self {
        let checksum = checksum_bytes(&data);
        Self {
            id: chunk_id(file_name, index),
            index,
            offset,
            data,
            checksum,
        }
    }

    /// Unique id within the transfer (`{file_name}_chunk_{index}`).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 0-based position in the source.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Byte offset of the first payload byte within the source.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of payload bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The chunk bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Lowercase hex SHA-256 of the payload, computed at creation.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Recomputes the digest of the payload and compares it with the
    /// recorded one.
    pub fn verify(&self) -> Result<(), TransferError> {
        if checksum_bytes(&self.data) == self.checksum {
            Ok(())
        } else {
            Err(TransferError::ChecksumMismatch(self.id.clone()))
        }
    }
}
