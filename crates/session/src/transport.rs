//! Transport adapter contract.
//!
//! `TransportAdapter` is implemented by the app for every concrete channel
//! (a Wi-Fi socket, a USB tether, ...).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use multichannel_transfer::Chunk;

/// Future returned by [`TransportAdapter::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Failure of a single send attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("send failed: {0}")]
    Failed(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("attempt aborted")]
    Aborted,

    /// The channel itself went away; the chunk is not at fault.
    #[error("channel lost: {0}")]
    ChannelLost(String),
}

/// Per-channel send primitive.
pub trait TransportAdapter: Send + Sync {
    /// Sends one chunk to the peer.
    ///
    /// The chunk is borrowed for the duration of the attempt. Progress is
    /// reported through `progress`; the returned future resolves exactly
    /// once with the outcome of the attempt. The scheduler may drop the
    /// future before completion when the attempt is aborted.
    fn send<'a>(&'a self, chunk: &'a Chunk, progress: ProgressSink) -> SendFuture<'a>;

    /// Asks the transport to abandon the in-progress attempt for `chunk_id`.
    ///
    /// Called before the scheduler drops an aborted or timed-out attempt, so
    /// transports holding out-of-band state (an open stream, a DMA buffer)
    /// can release it.
    fn abort(&self, chunk_id: &str);
}

/// Progress reporter handed to each send attempt.
///
/// Values are clamped to 100 and only strictly increasing values are
/// forwarded, whatever the transport reports.
pub struct ProgressSink {
    report: Box<dyn FnMut(u8) + Send>,
    last: Option<u8>,
}

impl ProgressSink {
    /// Creates a sink forwarding accepted values to `report`.
    pub fn new(report: impl FnMut(u8) + Send + 'static) -> Self {
        Self {
            report: Box::new(report),
            last: None,
        }
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Reports attempt progress (0-100).
    pub fn report(&mut self, percent: u8) {
        let percent = percent.min(100);
        if self.last.is_some_and(|last| percent <= last) {
            return;
        }
        self.last = Some(percent);
        (self.report)(percent);
    }

    /// Reports `sent` out of `total` bytes.
    pub fn report_bytes(&mut self, sent: usize, total: usize) {
        let percent = if total == 0 {
            100
        } else {
            (sent.min(total) * 100 / total) as u8
        };
        self.report(percent);
    }

    /// Last value forwarded, if any.
    pub fn last_reported(&self) -> Option<u8> {
        self.last
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
