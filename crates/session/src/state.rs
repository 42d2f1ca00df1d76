//! Shared per-session state.
//!
//! Written only by the scheduler task; callers take read locks to build
//! snapshots.

use std::sync::Arc;

use multichannel_protocol::{
    ChannelSnapshot, ChunkSnapshot, ChunkStatus, SessionStatus, TransferProgress,
};
use multichannel_transfer::{Chunk, SpeedCalculator};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelInfo, RegisteredChannel};
use crate::transport::TransportAdapter;

/// Scheduler view of one chunk.
pub(crate) struct ChunkEntry {
    pub(crate) chunk: Arc<Chunk>,
    pub(crate) status: ChunkStatus,
    pub(crate) progress: u8,
    /// Failed attempts charged to this chunk.
    pub(crate) failures: u32,
    /// Slot index of the channel carrying the live attempt.
    pub(crate) channel: Option<usize>,
    pub(crate) last_error: Option<String>,
    /// Sequence number of the live attempt; stale reports carry older ones.
    pub(crate) live_attempt: Option<u64>,
    pub(crate) attempt_seq: u64,
    pub(crate) abort: Option<CancellationToken>,
}

impl ChunkEntry {
    pub(crate) fn new(chunk: Chunk) -> Self {
        Self {
            chunk: Arc::new(chunk),
            status: ChunkStatus::Pending,
            progress: 0,
            failures: 0,
            channel: None,
            last_error: None,
            live_attempt: None,
            attempt_seq: 0,
            abort: None,
        }
    }
}

/// Scheduler view of one channel.
pub(crate) struct ChannelSlot {
    pub(crate) info: ChannelInfo,
    pub(crate) adapter: Arc<dyn TransportAdapter>,
    pub(crate) in_flight: usize,
    pub(crate) completed: u64,
    pub(crate) speed: SpeedCalculator,
}

impl ChannelSlot {
    pub(crate) fn new(channel: RegisteredChannel) -> Self {
        Self {
            info: channel.info,
            adapter: channel.adapter,
            in_flight: 0,
            completed: 0,
            speed: SpeedCalculator::default(),
        }
    }

    fn free(&self) -> usize {
        self.info.max_concurrent_chunks.saturating_sub(self.in_flight)
    }
}

pub(crate) struct SessionState {
    pub(crate) status: SessionStatus,
    pub(crate) chunks: Vec<ChunkEntry>,
    pub(crate) channels: Vec<ChannelSlot>,
}

impl SessionState {
    pub(crate) fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            status: SessionStatus::Preparing,
            chunks: chunks.into_iter().map(ChunkEntry::new).collect(),
            channels: Vec::new(),
        }
    }

    pub(crate) fn slot_by_id(&self, id: &str) -> Option<usize> {
        self.channels.iter().position(|s| s.info.id == id)
    }

    /// Picks the usable channel with the largest free share of its capacity.
    ///
    /// Ties go to the earliest registered channel.
    pub(crate) fn select_channel(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, slot) in self.channels.iter().enumerate() {
            if !slot.info.available || slot.free() == 0 {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let cur = &self.channels[b];
                    // free_i / max_i > free_b / max_b, without floats.
                    let lhs = slot.free() * cur.info.max_concurrent_chunks;
                    let rhs = cur.free() * slot.info.max_concurrent_chunks;
                    if lhs > rhs { Some(i) } else { Some(b) }
                }
            };
        }
        best
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.channels.iter().map(|s| s.in_flight).sum()
    }

    pub(crate) fn unresolved(&self) -> Vec<String> {
        self.chunks
            .iter()
            .filter(|e| e.status != ChunkStatus::Completed)
            .map(|e| e.chunk.id().to_string())
            .collect()
    }

    pub(crate) fn errors(&self) -> Vec<(String, String)> {
        self.chunks
            .iter()
            .filter(|e| e.status != ChunkStatus::Completed)
            .filter_map(|e| {
                e.last_error
                    .as_ref()
                    .map(|err| (e.chunk.id().to_string(), err.clone()))
            })
            .collect()
    }

    pub(crate) fn snapshot(
        &self,
        session_id: &str,
        file_name: &str,
        total_bytes: u64,
        percent: f64,
    ) -> TransferProgress {
        let chunks = self
            .chunks
            .iter()
            .map(|e| ChunkSnapshot {
                id: e.chunk.id().to_string(),
                index: e.chunk.index(),
                size: e.chunk.size() as u64,
                status: e.status,
                progress: e.progress,
                attempts: e.failures,
                channel: e.channel.map(|c| self.channels[c].info.id.clone()),
                last_error: e.last_error.clone(),
            })
            .collect();

        let channels = self
            .channels
            .iter()
            .map(|s| ChannelSnapshot {
                id: s.info.id.clone(),
                kind: s.info.kind.clone(),
                available: s.info.available,
                in_flight: s.in_flight,
                max_concurrent_chunks: s.info.max_concurrent_chunks,
                completed_chunks: s.completed,
                bytes_sent: s.speed.total_bytes(),
                bytes_per_second: s.speed.bytes_per_second(),
            })
            .collect();

        TransferProgress {
            session_id: session_id.to_string(),
            file_name: file_name.to_string(),
            status: self.status,
            total_bytes,
            percent,
            chunks,
            channels,
        }
    }
}
