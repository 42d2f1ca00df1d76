//! Transfer session lifecycle.
//!
//! A session chunks its source once, then hands the chunks to a scheduler
//! task that runs until every chunk settles. The handle is cheap to clone;
//! all clones observe and control the same transfer.

use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use multichannel_protocol::{SessionStatus, TransferMetadata, TransferProgress};
use multichannel_transfer::{
    Chunk, ChunkReader, ChunkingProgress, ProgressAggregator, TransferError,
    calculate_file_checksum,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel::ChannelRegistry;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::scheduler::{Scheduler, SchedulerParts};
use crate::state::{ChannelSlot, SessionState};
use crate::types::{SessionEvent, TransferOutcome};

/// Handle to one running file transfer.
#[derive(Clone)]
pub struct TransferSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    metadata: TransferMetadata,
    state: Arc<RwLock<SessionState>>,
    aggregator: Arc<ProgressAggregator>,
    events: broadcast::Sender<SessionEvent>,
    first_events: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<TransferOutcome>>,
}

impl TransferSession {
    /// Chunks `source` and starts moving it over the registry's channels.
    ///
    /// `total_size` only feeds chunking progress logs; pass `None` if
    /// unknown. Fails with [`TransferError::SourceUnreadable`] (wrapped in
    /// [`SessionError::Transfer`]) if the source cannot be read; no chunk is
    /// sent in that case.
    pub async fn start<R>(
        source: R,
        file_name: &str,
        total_size: Option<u64>,
        registry: Arc<ChannelRegistry>,
        config: SessionConfig,
    ) -> Result<Self, SessionError>
    where
        R: Read + Send + 'static,
    {
        config.validate()?;

        let chunks = tokio::task::spawn_blocking({
            let name = file_name.to_string();
            let chunk_size = config.chunk_size;
            move || -> Result<Vec<Chunk>, TransferError> {
                let reader = ChunkReader::new(source, &name, chunk_size, total_size)?
                    .with_progress(chunking_log(&name));
                reader.collect()
            }
        })
        .await??;

        Ok(Self::launch(
            chunks,
            file_name.to_string(),
            String::new(),
            registry,
            config,
        ))
    }

    /// Like [`start`](Self::start) for a file on disk.
    ///
    /// Chunk ids derive from the file's name. With `config.file_checksum`
    /// set, the whole-file digest is included in the metadata.
    pub async fn start_file(
        path: &Path,
        registry: Arc<ChannelRegistry>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let (chunks, file_name, checksum) = tokio::task::spawn_blocking({
            let path = path.to_path_buf();
            let chunk_size = config.chunk_size;
            let with_checksum = config.file_checksum;
            move || -> Result<_, TransferError> {
                let reader = ChunkReader::open(&path, chunk_size)?;
                let file_name = reader.file_name().to_string();
                let reader = reader.with_progress(chunking_log(&file_name));
                let chunks: Vec<Chunk> = reader.collect::<Result<_, _>>()?;
                let checksum = if with_checksum {
                    calculate_file_checksum(&path)?
                } else {
                    String::new()
                };
                Ok((chunks, file_name, checksum))
            }
        })
        .await??;

        Ok(Self::launch(chunks, file_name, checksum, registry, config))
    }

    fn launch(
        chunks: Vec<Chunk>,
        file_name: String,
        file_checksum: String,
        registry: Arc<ChannelRegistry>,
        config: SessionConfig,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let file_size: u64 = chunks.iter().map(|c| c.size() as u64).sum();
        let metadata = TransferMetadata {
            transfer_id: id.clone(),
            file_name,
            file_size,
            total_chunks: chunks.len() as u64,
            chunk_size: config.chunk_size as u64,
            file_checksum,
        };

        let aggregator = Arc::new(ProgressAggregator::new(
            chunks.iter().map(|c| c.size() as u64),
        ));

        // Subscribe before the snapshot so no registry change falls between.
        let registry_rx = registry.subscribe();
        let mut state = SessionState::new(chunks);
        state.channels = registry
            .snapshot()
            .into_iter()
            .map(ChannelSlot::new)
            .collect();
        let state = Arc::new(RwLock::new(state));

        let (events, first_events) = broadcast::channel(config.event_capacity);
        let (outcome_tx, outcome) = watch::channel(None);
        let cancel = CancellationToken::new();

        info!(
            session = %id,
            file = %metadata.file_name,
            size = file_size,
            chunks = metadata.total_chunks,
            channels = registry.len(),
            "session created"
        );

        let scheduler = Scheduler::new(SchedulerParts {
            session_id: id.clone(),
            state: Arc::clone(&state),
            aggregator: Arc::clone(&aggregator),
            registry,
            registry_rx,
            config,
            events: events.clone(),
            cancel: cancel.clone(),
            outcome: outcome_tx,
        });
        tokio::spawn(scheduler.run());

        Self {
            inner: Arc::new(SessionInner {
                id,
                metadata,
                state,
                aggregator,
                events,
                first_events: Mutex::new(Some(first_events)),
                cancel,
                outcome,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Announcement data for the receiving peer.
    pub fn metadata(&self) -> &TransferMetadata {
        &self.inner.metadata
    }

    /// Requests cancellation. Repeated calls have no further effect.
    ///
    /// The session turns `Cancelled` once every in-flight attempt has been
    /// aborted or has settled; use [`wait`](Self::wait) to observe that.
    pub fn cancel(&self) {
        if self.inner.cancel.is_cancelled() {
            debug!(session = %self.inner.id, "cancel already requested");
            return;
        }
        self.inner.cancel.cancel();
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.read().unwrap().status
    }

    /// Aggregate percentage plus per-chunk and per-channel state.
    pub fn progress(&self) -> TransferProgress {
        let state = self.inner.state.read().unwrap();
        state.snapshot(
            &self.inner.id,
            &self.inner.metadata.file_name,
            self.inner.aggregator.total_bytes(),
            self.inner.aggregator.percent(),
        )
    }

    /// Subscribes to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Takes the receiver created with the session, which has seen every
    /// event since start. Can only be called once.
    pub fn take_events(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.inner.first_events.lock().unwrap().take()
    }

    /// Terminal outcome, if the session has finished.
    pub fn outcome(&self) -> Option<TransferOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Waits for the session to reach a terminal state.
    pub async fn wait(&self) -> TransferOutcome {
        let mut rx = self.inner.outcome.clone();
        if let Ok(outcome) = rx.wait_for(Option::is_some).await
            && let Some(outcome) = outcome.as_ref()
        {
            return outcome.clone();
        }

        // The scheduler task ended without publishing an outcome.
        error!(session = %self.inner.id, "scheduler stopped unexpectedly");
        let state = self.inner.state.read().unwrap();
        TransferOutcome {
            session_id: self.inner.id.clone(),
            status: SessionStatus::Failed,
            unresolved: state.unresolved(),
            errors: state.errors(),
        }
    }
}

/// Logs chunking progress in 25% steps.
fn chunking_log(file_name: &str) -> ChunkingProgress {
    let file = file_name.to_string();
    let mut next = 25;
    Box::new(move |percent| {
        if percent >= next {
            debug!(file = %file, percent, "chunking");
            next = (percent / 25 + 1) * 25;
        }
    })
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.inner.id)
            .field("file", &self.inner.metadata.file_name)
            .finish_non_exhaustive()
    }
}
