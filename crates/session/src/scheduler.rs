//! Chunk scheduler.
//!
//! One scheduler task per session owns every mutation of the chunk table
//! and the channel slots. Send attempts run as separate tasks and report
//! back over an unbounded channel, so scheduling never waits on transport
//! I/O. Each report carries the attempt's sequence number; reports of an
//! attempt that was detached (channel lost, cancelled) are ignored.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use multichannel_protocol::{ChunkStatus, SessionStatus};
use multichannel_transfer::{Chunk, ProgressAggregator};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelEvent, ChannelRegistry, RegisteredChannel};
use crate::config::SessionConfig;
use crate::state::{ChannelSlot, SessionState};
use crate::transport::{ProgressSink, TransportAdapter, TransportError};
use crate::types::{SessionEvent, TransferOutcome};

/// Report from a send attempt task.
pub(crate) enum WorkerMessage {
    Started {
        index: usize,
        attempt: u64,
    },
    Progress {
        index: usize,
        attempt: u64,
        percent: u8,
    },
    Finished {
        index: usize,
        attempt: u64,
        result: Result<(), TransportError>,
    },
}

/// Everything the scheduler task needs, handed over by the session.
pub(crate) struct SchedulerParts {
    pub(crate) session_id: String,
    pub(crate) state: Arc<RwLock<SessionState>>,
    pub(crate) aggregator: Arc<ProgressAggregator>,
    pub(crate) registry: Arc<ChannelRegistry>,
    pub(crate) registry_rx: broadcast::Receiver<ChannelEvent>,
    pub(crate) config: SessionConfig,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) outcome: watch::Sender<Option<TransferOutcome>>,
}

pub(crate) struct Scheduler {
    session_id: String,
    state: Arc<RwLock<SessionState>>,
    aggregator: Arc<ProgressAggregator>,
    registry: Arc<ChannelRegistry>,
    registry_rx: broadcast::Receiver<ChannelEvent>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<TransferOutcome>>,
    pending: BTreeSet<usize>,
    exhausted: BTreeSet<usize>,
    workers: JoinSet<()>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    last_percent: f64,
}

impl Scheduler {
    pub(crate) fn new(parts: SchedulerParts) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = {
            let state = parts.state.read().unwrap();
            (0..state.chunks.len()).collect()
        };
        Self {
            session_id: parts.session_id,
            state: parts.state,
            aggregator: parts.aggregator,
            registry: parts.registry,
            registry_rx: parts.registry_rx,
            config: parts.config,
            events: parts.events,
            cancel: parts.cancel,
            outcome: parts.outcome,
            pending,
            exhausted: BTreeSet::new(),
            workers: JoinSet::new(),
            tx,
            rx,
            last_percent: 0.0,
        }
    }

    /// Drives the session to a terminal state.
    pub(crate) async fn run(mut self) -> TransferOutcome {
        self.refresh_channels();
        self.state.write().unwrap().status = SessionStatus::Transferring;
        info!(session = %self.session_id, chunks = self.pending.len(), "transfer started");

        let cancel = self.cancel.clone();
        let grace = self.config.channel_grace();
        let mut aborting = false;
        let mut registry_open = true;
        let mut stall_deadline: Option<Instant> = None;

        let status = loop {
            self.reap_workers();
            if !cancel.is_cancelled() {
                self.dispatch();
            }

            let in_flight = self.state.read().unwrap().in_flight();
            if cancel.is_cancelled() && in_flight == 0 {
                break SessionStatus::Cancelled;
            }
            if self.pending.is_empty() && in_flight == 0 {
                break if self.exhausted.is_empty() {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                };
            }

            // Work is queued but no channel can take it and nothing is moving.
            let stalled = !cancel.is_cancelled() && in_flight == 0;
            if stalled {
                if grace.is_zero() {
                    warn!(session = %self.session_id, pending = self.pending.len(), "no usable channel left");
                    break SessionStatus::Failed;
                }
                if stall_deadline.is_none() {
                    warn!(session = %self.session_id, grace_ms = grace.as_millis() as u64, "no usable channel, waiting");
                    stall_deadline = Some(Instant::now() + grace);
                }
            } else {
                stall_deadline = None;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !aborting => {
                    aborting = true;
                    self.abort_in_flight();
                }
                Some(msg) = self.rx.recv() => self.handle_worker(msg),
                event = self.registry_rx.recv(), if registry_open => match event {
                    Ok(event) => self.handle_channel_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(session = %self.session_id, skipped, "registry events lagged, resyncing");
                        self.refresh_channels();
                    }
                    Err(broadcast::error::RecvError::Closed) => registry_open = false,
                },
                _ = tokio::time::sleep_until(stall_deadline.unwrap_or_else(Instant::now)), if stall_deadline.is_some() => {
                    warn!(session = %self.session_id, "no channel returned within grace period");
                    break SessionStatus::Failed;
                }
            }
        };

        self.finish(status).await
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn reap_workers(&mut self) {
        while let Some(joined) = self.workers.try_join_next() {
            if let Err(e) = joined {
                error!(session = %self.session_id, error = %e, "send attempt task failed");
            }
        }
    }

    /// Hands pending chunks to channels until either runs out.
    fn dispatch(&mut self) {
        while let Some(&index) = self.pending.first() {
            let Some(slot) = self.state.read().unwrap().select_channel() else {
                break;
            };
            self.pending.pop_first();
            self.assign(index, slot);
        }
    }

    fn assign(&mut self, index: usize, slot: usize) {
        let token = CancellationToken::new();
        let (chunk, adapter, attempt, channel_id) = {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            let channel = &mut state.channels[slot];
            channel.in_flight += 1;

            let entry = &mut state.chunks[index];
            entry.attempt_seq += 1;
            entry.status = ChunkStatus::Assigned;
            entry.progress = 0;
            entry.channel = Some(slot);
            entry.live_attempt = Some(entry.attempt_seq);
            entry.abort = Some(token.clone());
            (
                Arc::clone(&entry.chunk),
                Arc::clone(&channel.adapter),
                entry.attempt_seq,
                channel.info.id.clone(),
            )
        };
        self.aggregator.observe(index, ChunkStatus::Assigned, 0);

        debug!(chunk = %chunk.id(), channel = %channel_id, attempt, "chunk assigned");
        self.workers.spawn(run_attempt(Attempt {
            adapter,
            chunk,
            index,
            attempt,
            abort: token,
            timeout: self.config.attempt_timeout(),
            tx: self.tx.clone(),
        }));
    }

    // -----------------------------------------------------------------------
    // Worker reports
    // -----------------------------------------------------------------------

    fn handle_worker(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Started { index, attempt } => self.on_started(index, attempt),
            WorkerMessage::Progress {
                index,
                attempt,
                percent,
            } => self.on_progress(index, attempt, percent),
            WorkerMessage::Finished {
                index,
                attempt,
                result,
            } => self.on_finished(index, attempt, result),
        }
    }

    fn is_live(&self, index: usize, attempt: u64) -> bool {
        let state = self.state.read().unwrap();
        state
            .chunks
            .get(index)
            .is_some_and(|e| e.live_attempt == Some(attempt))
    }

    fn on_started(&mut self, index: usize, attempt: u64) {
        if !self.is_live(index, attempt) {
            return;
        }
        let event = {
            let mut state = self.state.write().unwrap();
            let channel_id = state.chunks[index]
                .channel
                .map(|c| state.channels[c].info.id.clone())
                .unwrap_or_default();
            let entry = &mut state.chunks[index];
            entry.status = ChunkStatus::Transferring;
            SessionEvent::ChunkStarted {
                chunk_id: entry.chunk.id().to_string(),
                channel_id,
                attempt: entry.failures + 1,
            }
        };
        self.aggregator.observe(index, ChunkStatus::Transferring, 0);
        self.emit(event);
    }

    fn on_progress(&mut self, index: usize, attempt: u64, percent: u8) {
        if !self.is_live(index, attempt) {
            return;
        }
        let event = {
            let mut state = self.state.write().unwrap();
            if state.chunks[index].status != ChunkStatus::Transferring {
                return;
            }
            let channel_id = state.chunks[index]
                .channel
                .map(|c| state.channels[c].info.id.clone())
                .unwrap_or_default();
            let entry = &mut state.chunks[index];
            entry.progress = percent;
            SessionEvent::ChunkProgress {
                chunk_id: entry.chunk.id().to_string(),
                channel_id,
                percent,
            }
        };
        trace!(session = %self.session_id, index, percent, "chunk progress");
        self.emit(event);
        let aggregate = self
            .aggregator
            .observe(index, ChunkStatus::Transferring, percent);
        self.emit_percent(aggregate);
    }

    fn on_finished(&mut self, index: usize, attempt: u64, result: Result<(), TransportError>) {
        if !self.is_live(index, attempt) {
            trace!(session = %self.session_id, index, attempt, "stale attempt settled");
            return;
        }

        // Release the slot first; every outcome below frees it.
        let (chunk_id, channel_id, slot) = {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            let entry = &mut state.chunks[index];
            entry.live_attempt = None;
            entry.abort = None;
            let slot = entry.channel.take();
            let chunk_id = entry.chunk.id().to_string();
            let channel_id = match slot {
                Some(s) => {
                    let channel = &mut state.channels[s];
                    channel.in_flight = channel.in_flight.saturating_sub(1);
                    channel.info.id.clone()
                }
                None => String::new(),
            };
            (chunk_id, channel_id, slot)
        };

        match result {
            Ok(()) => self.on_completed(index, slot, chunk_id, channel_id),
            Err(err) => self.on_failed(index, slot, chunk_id, channel_id, err),
        }
    }

    fn on_completed(&mut self, index: usize, slot: Option<usize>, chunk_id: String, channel_id: String) {
        {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            let entry = &mut state.chunks[index];
            entry.status = ChunkStatus::Completed;
            entry.progress = 100;
            let size = entry.chunk.size() as u64;
            if let Some(s) = slot {
                let channel = &mut state.channels[s];
                channel.completed += 1;
                channel.speed.add_sample(size);
            }
        }
        debug!(chunk = %chunk_id, channel = %channel_id, "chunk completed");
        self.emit(SessionEvent::ChunkCompleted {
            chunk_id,
            channel_id,
        });
        let aggregate = self.aggregator.observe(index, ChunkStatus::Completed, 100);
        self.emit_percent(aggregate);
    }

    fn on_failed(
        &mut self,
        index: usize,
        slot: Option<usize>,
        chunk_id: String,
        channel_id: String,
        err: TransportError,
    ) {
        // Aborted attempts were never given a chance to finish: no charge.
        if matches!(err, TransportError::Aborted) || self.cancel.is_cancelled() {
            {
                let mut state = self.state.write().unwrap();
                let entry = &mut state.chunks[index];
                entry.status = ChunkStatus::Pending;
                entry.progress = 0;
            }
            self.aggregator.observe(index, ChunkStatus::Pending, 0);
            debug!(chunk = %chunk_id, channel = %channel_id, error = %err, "attempt ended during cancellation");
            return;
        }

        let reason = err.to_string();
        let channel_lost = matches!(err, TransportError::ChannelLost(_));

        let failures = {
            let mut state = self.state.write().unwrap();
            let entry = &mut state.chunks[index];
            entry.status = ChunkStatus::Failed;
            entry.progress = 0;
            entry.last_error = Some(reason.clone());
            // Losing the channel is not the chunk's fault.
            if !channel_lost {
                entry.failures += 1;
            }
            entry.failures
        };
        self.aggregator.observe(index, ChunkStatus::Failed, 0);

        if channel_lost && let Some(s) = slot {
            self.mark_unavailable(s, &reason);
            if let Err(e) = self.registry.set_available(&channel_id, false) {
                warn!(channel = %channel_id, error = %e, "could not update registry");
            }
        }

        if failures < self.config.max_attempts {
            warn!(chunk = %chunk_id, channel = %channel_id, failures, error = %reason, "chunk attempt failed, retrying");
            self.requeue(index);
            self.emit(SessionEvent::ChunkRetrying {
                chunk_id,
                failures,
                error: reason,
            });
        } else {
            error!(chunk = %chunk_id, failures, error = %reason, "chunk failed, attempts exhausted");
            self.exhausted.insert(index);
            self.emit(SessionEvent::ChunkFailed {
                chunk_id,
                error: reason,
            });
        }
    }

    fn requeue(&mut self, index: usize) {
        {
            let mut state = self.state.write().unwrap();
            let entry = &mut state.chunks[index];
            entry.status = ChunkStatus::Pending;
            entry.progress = 0;
        }
        self.aggregator.observe(index, ChunkStatus::Pending, 0);
        self.pending.insert(index);
    }

    // -----------------------------------------------------------------------
    // Channel changes
    // -----------------------------------------------------------------------

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Added(id) => {
                let known = self.state.read().unwrap().slot_by_id(&id).is_some();
                if !known && let Some(channel) = self.registry.get(&id) {
                    self.add_channel(channel);
                }
            }
            ChannelEvent::AvailabilityChanged { id, available } => {
                let Some(slot) = self.state.read().unwrap().slot_by_id(&id) else {
                    return;
                };
                if available {
                    self.mark_available(slot);
                } else {
                    self.mark_unavailable(slot, "reported unavailable");
                }
            }
        }
    }

    /// Reconciles the slot list with the registry.
    fn refresh_channels(&mut self) {
        for channel in self.registry.snapshot() {
            let slot = self.state.read().unwrap().slot_by_id(&channel.info.id);
            match slot {
                None => self.add_channel(channel),
                Some(s) if channel.info.available => self.mark_available(s),
                Some(s) => self.mark_unavailable(s, "reported unavailable"),
            }
        }
    }

    fn add_channel(&mut self, channel: RegisteredChannel) {
        debug!(session = %self.session_id, channel = %channel.info.id, available = channel.info.available, "channel joined session");
        let mut state = self.state.write().unwrap();
        state.channels.push(ChannelSlot::new(channel));
    }

    fn mark_available(&mut self, slot: usize) {
        let channel_id = {
            let mut state = self.state.write().unwrap();
            let channel = &mut state.channels[slot];
            if channel.info.available {
                return;
            }
            channel.info.available = true;
            channel.info.id.clone()
        };
        info!(session = %self.session_id, channel = %channel_id, "channel available");
        self.emit(SessionEvent::ChannelAvailable { channel_id });
    }

    /// Removes a channel from selection and re-queues its in-flight chunks.
    fn mark_unavailable(&mut self, slot: usize, reason: &str) {
        let (channel_id, detached) = {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            let channel = &mut state.channels[slot];
            if !channel.info.available {
                return;
            }
            channel.info.available = false;
            channel.in_flight = 0;
            let channel_id = channel.info.id.clone();
            let adapter = Arc::clone(&channel.adapter);

            let mut detached = Vec::new();
            for (index, entry) in state.chunks.iter_mut().enumerate() {
                if entry.channel != Some(slot) || entry.live_attempt.is_none() {
                    continue;
                }
                adapter.abort(entry.chunk.id());
                if let Some(token) = entry.abort.take() {
                    token.cancel();
                }
                entry.live_attempt = None;
                entry.channel = None;
                entry.status = ChunkStatus::Failed;
                entry.progress = 0;
                entry.last_error = Some(format!("channel {channel_id} lost"));
                detached.push(index);
            }
            (channel_id, detached)
        };

        warn!(session = %self.session_id, channel = %channel_id, requeued = detached.len(), reason, "channel unavailable");
        for index in detached {
            self.aggregator.observe(index, ChunkStatus::Failed, 0);
            if !self.cancel.is_cancelled() {
                self.requeue(index);
            }
        }
        self.emit(SessionEvent::ChannelUnavailable {
            channel_id,
            reason: reason.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Cancellation and completion
    // -----------------------------------------------------------------------

    /// Aborts every live attempt; their reports still arrive and settle them.
    fn abort_in_flight(&mut self) {
        info!(session = %self.session_id, "cancelling transfer");
        let state = self.state.read().unwrap();
        for entry in state.chunks.iter().filter(|e| e.live_attempt.is_some()) {
            if let Some(slot) = entry.channel {
                state.channels[slot].adapter.abort(entry.chunk.id());
            }
            if let Some(token) = &entry.abort {
                token.cancel();
            }
        }
    }

    async fn finish(mut self, status: SessionStatus) -> TransferOutcome {
        // Detached attempts were aborted; wait for them to wind down.
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(session = %self.session_id, error = %e, "send attempt task failed");
            }
        }

        let outcome = {
            let mut state = self.state.write().unwrap();
            state.status = status;
            TransferOutcome {
                session_id: self.session_id.clone(),
                status,
                unresolved: state.unresolved(),
                errors: state.errors(),
            }
        };

        match status {
            SessionStatus::Completed => info!(session = %self.session_id, "transfer completed"),
            SessionStatus::Cancelled => info!(session = %self.session_id, "transfer cancelled"),
            _ => error!(session = %self.session_id, unresolved = outcome.unresolved.len(), "transfer failed"),
        }

        if self.aggregator.finish(status) {
            self.emit(SessionEvent::Finished(outcome.clone()));
        }
        self.outcome.send_replace(Some(outcome.clone()));
        outcome
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_percent(&mut self, percent: f64) {
        if percent > self.last_percent {
            self.last_percent = percent;
            self.emit(SessionEvent::Progress { percent });
        }
    }
}

// ---------------------------------------------------------------------------
// Send attempts
// ---------------------------------------------------------------------------

struct Attempt {
    adapter: Arc<dyn TransportAdapter>,
    chunk: Arc<Chunk>,
    index: usize,
    attempt: u64,
    abort: CancellationToken,
    timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

/// Sends the final report when dropped, so a panicking adapter still
/// frees its slot.
struct FinishReport {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    index: usize,
    attempt: u64,
    result: Option<Result<(), TransportError>>,
}

impl Drop for FinishReport {
    fn drop(&mut self) {
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(TransportError::Failed("attempt panicked".into())));
        let _ = self.tx.send(WorkerMessage::Finished {
            index: self.index,
            attempt: self.attempt,
            result,
        });
    }
}

async fn run_attempt(attempt: Attempt) {
    let Attempt {
        adapter,
        chunk,
        index,
        attempt,
        abort,
        timeout,
        tx,
    } = attempt;

    let mut report = FinishReport {
        tx: tx.clone(),
        index,
        attempt,
        result: None,
    };
    let _ = tx.send(WorkerMessage::Started { index, attempt });

    let sink = ProgressSink::new(move |percent| {
        let _ = tx.send(WorkerMessage::Progress {
            index,
            attempt,
            percent,
        });
    });

    let send = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, adapter.send(&chunk, sink)).await {
                Ok(result) => result,
                Err(_) => {
                    // The future is gone but the transport may still hold the send.
                    adapter.abort(chunk.id());
                    Err(TransportError::Timeout(limit))
                }
            },
            None => adapter.send(&chunk, sink).await,
        }
    };

    let result = tokio::select! {
        biased;
        _ = abort.cancelled() => Err(TransportError::Aborted),
        result = send => result,
    };
    report.result = Some(result);
}
