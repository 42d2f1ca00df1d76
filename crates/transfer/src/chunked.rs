use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::types::Chunk;
use crate::{TransferError, validate_file_name};

/// Callback invoked with the chunking percentage after each chunk.
pub type ChunkingProgress = Box<dyn FnMut(u8) + Send>;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Splits a sequential byte source into fixed-size checksummed chunks.
///
/// Chunks come out in index order with no gaps; every chunk but the last
/// holds exactly `chunk_size` bytes. An empty source yields one empty
/// chunk so the receiver still learns the file exists. A read error is
/// returned once and ends the sequence.
pub struct ChunkReader<R> {
    source: R,
    file_name: String,
    chunk_size: usize,
    next_index: u64,
    offset: u64,
    total_size: Option<u64>,
    finished: bool,
    on_progress: Option<ChunkingProgress>,
}

impl ChunkReader<File> {
    /// Opens `path` for chunked reading.
    ///
    /// Chunk ids are derived from the file's name and the total size is
    /// taken from its metadata.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidFileName(path.display().to_string()))?;
        let file = File::open(path)?;
        let total_size = file.metadata()?.len();
        Self::new(file, &file_name, chunk_size, Some(total_size))
    }
}

impl<R: Read> ChunkReader<R> {
    /// Wraps `source`.
    ///
    /// `total_size` enables progress reporting; pass `None` when the length
    /// is not known up front.
    pub fn new(
        source: R,
        file_name: &str,
        chunk_size: usize,
        total_size: Option<u64>,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        validate_file_name(file_name)?;
        Ok(Self {
            source,
            file_name: file_name.to_string(),
            chunk_size,
            next_index: 0,
            offset: 0,
            total_size,
            finished: false,
            on_progress: None,
        })
    }

    /// Registers a chunking progress callback.
    ///
    /// Only fires when the total size is known.
    pub fn with_progress(mut self, callback: ChunkingProgress) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Reads the next chunk. Returns `None` once the source is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let n = match read_full(&mut self.source, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.finished = true;
                debug!(file = %self.file_name, index = self.next_index, error = %e, "chunking aborted");
                return Err(e.into());
            }
        };

        // Only an empty source produces a zero-size chunk.
        if n == 0 && self.next_index > 0 {
            self.finished = true;
            return Ok(None);
        }
        if n < self.chunk_size {
            self.finished = true;
        }
        buf.truncate(n);

        let chunk = Chunk::new(&self.file_name, self.next_index, self.offset, buf);
        trace!(chunk = %chunk.id(), size = n, "chunk produced");
        self.next_index += 1;
        self.offset += n as u64;

        if let Some(percent) = self.percent_processed()
            && let Some(cb) = self.on_progress.as_mut()
        {
            cb(percent);
        }

        Ok(Some(chunk))
    }

    /// Percentage of the source consumed so far, `None` if the size is unknown.
    pub fn percent_processed(&self) -> Option<u8> {
        let total = self.total_size?;
        if total == 0 {
            return Some(if self.next_index > 0 { 100 } else { 0 });
        }
        Some((self.offset.saturating_mul(100) / total).min(100) as u8)
    }

    /// Number of bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total source size, if known.
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Index of the next chunk to be produced.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl<R: Read + Seek> ChunkReader<R> {
    /// Restarts production at chunk `index`.
    pub fn seek_to_index(&mut self, index: u64) -> Result<(), TransferError> {
        let offset = index
            .checked_mul(self.chunk_size as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "chunk index out of range"))?;
        self.source.seek(SeekFrom::Start(offset))?;
        self.next_index = index;
        self.offset = offset;
        self.finished = false;
        Ok(())
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Fills `buf` from `source`, stopping early only at end of stream.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    /// Returns at most 3 bytes per read, then fails after `fail_after` bytes.
    struct FlakySource {
        data: Vec<u8>,
        pos: usize,
        fail_after: Option<usize>,
    }

    impl Read for FlakySource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(limit) = self.fail_after
                && self.pos >= limit
            {
                return Err(io::Error::other("device removed"));
            }
            let n = buf.len().min(3).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
        assert!(c1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn checksum_bytes_different_data() {
        assert_ne!(checksum_bytes(b"hello"), checksum_bytes(b"world"));
    }

    #[test]
    fn calculate_file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let data = b"test content for checksum";
        let path = create_test_file(dir.path(), "test.bin", data);
        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(data));
    }

    #[test]
    fn one_mebibyte_splits_into_two_chunks() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test_file.txt", &pattern(1024 * 1024));

        let chunks: Vec<Chunk> = ChunkReader::open(&path, crate::DEFAULT_CHUNK_SIZE)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert!(chunk.size() <= crate::DEFAULT_CHUNK_SIZE);
            assert!(!chunk.checksum().is_empty());
        }
        assert_eq!(chunks[0].id(), "test_file.txt_chunk_0");
        assert_eq!(chunks[1].offset(), 512 * 1024);
    }

    #[test]
    fn small_source_is_one_chunk() {
        let reader = ChunkReader::new(Cursor::new(pattern(100)), "small.txt", 512 * 1024, None)
            .unwrap();
        let chunks: Vec<Chunk> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size(), 100);
    }

    #[test]
    fn empty_source_yields_one_empty_chunk() {
        let mut reader = ChunkReader::new(Cursor::new(Vec::new()), "empty", 4, Some(0)).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.index(), 0);
        assert_eq!(chunk.size(), 0);
        assert!(!chunk.checksum().is_empty());
        assert!(reader.next_chunk().unwrap().is_none());
        assert_eq!(reader.percent_processed(), Some(100));
    }

    #[test]
    fn chunk_count_and_sizes_cover_source() {
        for size in [1usize, 3, 4, 5, 8, 9, 17, 64] {
            for chunk_size in [1usize, 2, 4, 7] {
                let data = pattern(size);
                let chunks: Vec<Chunk> =
                    ChunkReader::new(Cursor::new(data.clone()), "f", chunk_size, None)
                        .unwrap()
                        .collect::<Result<_, _>>()
                        .unwrap();

                assert_eq!(chunks.len(), size.div_ceil(chunk_size), "S={size} C={chunk_size}");
                assert_eq!(chunks.iter().map(Chunk::size).sum::<usize>(), size);
                for (i, chunk) in chunks.iter().enumerate() {
                    assert_eq!(chunk.index(), i as u64);
                    assert!(chunk.verify().is_ok());
                }
                let joined: Vec<u8> = chunks.iter().flat_map(|c| c.payload().to_vec()).collect();
                assert_eq!(joined, data);
            }
        }
    }

    #[test]
    fn short_reads_still_fill_chunks() {
        let source = FlakySource {
            data: pattern(10),
            pos: 0,
            fail_after: None,
        };
        let chunks: Vec<Chunk> = ChunkReader::new(source, "f", 4, Some(10))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Chunk::size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn read_error_halts_without_partial_chunk() {
        let source = FlakySource {
            data: pattern(20),
            pos: 0,
            fail_after: Some(6),
        };
        let mut reader = ChunkReader::new(source, "f", 4, Some(20)).unwrap();

        let first = reader.next_chunk().unwrap().unwrap();
        assert_eq!(first.size(), 4);
        assert!(matches!(
            reader.next_chunk(),
            Err(TransferError::SourceUnreadable(_))
        ));
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let result = ChunkReader::open(&dir.path().join("nope.bin"), 4);
        assert!(matches!(result, Err(TransferError::SourceUnreadable(_))));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let result = ChunkReader::new(Cursor::new(vec![1u8]), "f", 0, None);
        assert!(matches!(result, Err(TransferError::InvalidChunkSize(0))));
    }

    #[test]
    fn progress_reported_when_size_known() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let reader = ChunkReader::new(Cursor::new(pattern(10)), "f", 4, Some(10))
            .unwrap()
            .with_progress(Box::new(move |p| s.lock().unwrap().push(p)));
        let _ = reader.collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![40, 80, 100]);
    }

    #[test]
    fn progress_omitted_when_size_unknown() {
        let seen = Arc::new(Mutex::new(Vec::<u8>::new()));
        let s = Arc::clone(&seen);
        let mut reader = ChunkReader::new(Cursor::new(pattern(10)), "f", 4, None)
            .unwrap()
            .with_progress(Box::new(move |p| s.lock().unwrap().push(p)));
        while reader.next_chunk().unwrap().is_some() {}
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(reader.percent_processed(), None);
    }

    #[test]
    fn seek_to_index_restarts_sequence() {
        let data = b"0123456789".to_vec();
        let mut reader = ChunkReader::new(Cursor::new(data), "f", 4, Some(10)).unwrap();
        while reader.next_chunk().unwrap().is_some() {}

        reader.seek_to_index(1).unwrap();
        assert_eq!(reader.offset(), 4);
        let c = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c.index(), 1);
        assert_eq!(c.offset(), 4);
        assert_eq!(c.payload(), b"4567");
        assert_eq!(c.id(), "f_chunk_1");
    }

    #[test]
    fn seek_past_addressable_range_is_an_error() {
        let mut reader = ChunkReader::new(Cursor::new(pattern(10)), "f", 4, Some(10)).unwrap();
        assert!(matches!(
            reader.seek_to_index(u64::MAX),
            Err(TransferError::SourceUnreadable(_))
        ));
        // Position is untouched.
        assert_eq!(reader.offset(), 0);
        assert_eq!(reader.next_chunk().unwrap().unwrap().index(), 0);
    }
}
