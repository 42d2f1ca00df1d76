//! Simulated transport channel.
//!
//! Pushes each chunk through a throttled link in 8 KiB blocks, verifying
//! the checksum on "arrival". Failures and channel loss can be injected to
//! watch the scheduler retry and redistribute work.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use multichannel_session::{Chunk, ProgressSink, SendFuture, TransportAdapter, TransportError};
use tracing::debug;

use crate::config::SimChannel;

/// Size of one simulated write.
const BLOCK_SIZE: usize = 8 * 1024;

pub struct SimulatedTransport {
    id: String,
    bytes_per_sec: u64,
    fail_every: u32,
    drop_after: Option<u32>,
    attempts: AtomicU32,
    delivered: AtomicU32,
    aborted: AtomicU32,
}

impl SimulatedTransport {
    pub fn new(channel: &SimChannel) -> Self {
        Self {
            id: channel.id.clone(),
            bytes_per_sec: channel.bytes_per_sec.max(1),
            fail_every: channel.fail_every,
            drop_after: channel.drop_after,
            attempts: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
            aborted: AtomicU32::new(0),
        }
    }

    /// Chunks delivered so far.
    pub fn delivered(&self) -> u32 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Attempts abandoned at the scheduler's request.
    pub fn aborted(&self) -> u32 {
        self.aborted.load(Ordering::Relaxed)
    }

    fn block_delay(&self, bytes: usize) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec as f64)
    }
}

impl TransportAdapter for SimulatedTransport {
    fn send<'a>(&'a self, chunk: &'a Chunk, mut progress: ProgressSink) -> SendFuture<'a> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(limit) = self.drop_after
                && self.delivered() >= limit
            {
                return Err(TransportError::ChannelLost(format!(
                    "{} dropped after {limit} chunks",
                    self.id
                )));
            }
            let inject_failure = self.fail_every > 0 && attempt % self.fail_every == 0;

            let total = chunk.size();
            let mut sent = 0;
            progress.report(0);
            while sent < total {
                let n = BLOCK_SIZE.min(total - sent);
                tokio::time::sleep(self.block_delay(n)).await;
                sent += n;
                if inject_failure && sent * 2 >= total {
                    return Err(TransportError::Failed(format!(
                        "simulated link error on {}",
                        self.id
                    )));
                }
                progress.report_bytes(sent, total);
            }
            if total == 0 {
                if inject_failure {
                    return Err(TransportError::Failed(format!(
                        "simulated link error on {}",
                        self.id
                    )));
                }
                progress.report(100);
            }

            chunk
                .verify()
                .map_err(|e| TransportError::Failed(e.to_string()))?;
            self.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %self.id, chunk = %chunk.id(), bytes = total, "chunk delivered");
            Ok(())
        })
    }

    fn abort(&self, chunk_id: &str) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(channel = %self.id, chunk = %chunk_id, "send aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multichannel_session::ChannelKind;
    use std::sync::{Arc, Mutex};

    fn channel(bytes_per_sec: u64) -> SimChannel {
        SimChannel {
            id: "sim0".into(),
            kind: ChannelKind::wifi(),
            max_concurrent_chunks: 1,
            bytes_per_sec,
            fail_every: 0,
            drop_after: None,
        }
    }

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        (ProgressSink::new(move |p| s.lock().unwrap().push(p)), seen)
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_and_reports_block_progress() {
        let transport = SimulatedTransport::new(&channel(16 * 1024));
        let chunk = Chunk::new("a.bin", 0, 0, vec![7u8; 16 * 1024]);
        let (sink, seen) = recording_sink();

        let started = tokio::time::Instant::now();
        transport.send(&chunk, sink).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(*seen.lock().unwrap(), vec![0, 50, 100]);
        assert_eq!(transport.delivered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn injects_failure_every_nth_attempt() {
        let mut config = channel(1024 * 1024);
        config.fail_every = 2;
        let transport = SimulatedTransport::new(&config);
        let chunk = Chunk::new("a.bin", 0, 0, vec![1u8; 4096]);

        assert!(transport.send(&chunk, ProgressSink::noop()).await.is_ok());
        assert!(matches!(
            transport.send(&chunk, ProgressSink::noop()).await,
            Err(TransportError::Failed(_))
        ));
        assert!(transport.send(&chunk, ProgressSink::noop()).await.is_ok());
        assert_eq!(transport.delivered(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_channel_after_limit() {
        let mut config = channel(1024 * 1024);
        config.drop_after = Some(1);
        let transport = SimulatedTransport::new(&config);
        let chunk = Chunk::new("a.bin", 0, 0, vec![1u8; 10]);

        assert!(transport.send(&chunk, ProgressSink::noop()).await.is_ok());
        assert!(matches!(
            transport.send(&chunk, ProgressSink::noop()).await,
            Err(TransportError::ChannelLost(_))
        ));
    }

    #[tokio::test]
    async fn empty_chunk_completes_immediately() {
        let transport = SimulatedTransport::new(&channel(1));
        let chunk = Chunk::new("a.bin", 0, 0, Vec::new());
        let (sink, seen) = recording_sink();

        transport.send(&chunk, sink).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 100]);
    }

    #[test]
    fn abort_is_counted() {
        let transport = SimulatedTransport::new(&channel(1));
        transport.abort("a.bin_chunk_3");
        assert_eq!(transport.aborted(), 1);
    }
}
