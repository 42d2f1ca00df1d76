//! Simulation run: wires the registry, the simulated channels and one
//! transfer session together.

use std::path::Path;
use std::sync::Arc;

use multichannel_session::{
    ChannelInfo, ChannelRegistry, SessionEvent, TransferOutcome, TransferSession,
};
use tokio::sync::broadcast::error::RecvError;

use crate::config::SimConfig;
use crate::sim::SimulatedTransport;

/// Transfers `path` over the configured channels until the session ends.
///
/// Ctrl-C cancels the session; the run still waits for in-flight chunks
/// to settle before returning.
pub async fn run(path: &Path, config: SimConfig) -> anyhow::Result<TransferOutcome> {
    let registry = Arc::new(ChannelRegistry::new());
    let mut transports = Vec::with_capacity(config.channels.len());
    for channel in &config.channels {
        let transport = Arc::new(SimulatedTransport::new(channel));
        registry.register(
            ChannelInfo::new(
                channel.id.clone(),
                channel.kind.clone(),
                channel.max_concurrent_chunks,
            ),
            Arc::clone(&transport) as _,
        )?;
        transports.push((channel.id.clone(), transport));
    }

    let session = TransferSession::start_file(path, Arc::clone(&registry), config.session).await?;
    let meta = session.metadata();
    tracing::info!(
        transfer = %meta.transfer_id,
        file = %meta.file_name,
        size = meta.file_size,
        chunks = meta.total_chunks,
        checksum = %meta.file_checksum,
        "transfer announced"
    );

    let mut events = session
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("session events already taken"))?;
    let mut last_logged = 0u32;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Finished(_)) | Err(RecvError::Closed) => break,
                Ok(event) => log_event(&event, &mut last_logged),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event log fell behind");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupt received, cancelling transfer");
                session.cancel();
            }
        }
    }

    let outcome = session.wait().await;
    for channel in session.progress().channels {
        tracing::info!(
            channel = %channel.id,
            kind = %channel.kind,
            completed = channel.completed_chunks,
            bytes = channel.bytes_sent,
            "channel summary"
        );
    }
    for (id, transport) in &transports {
        if transport.aborted() > 0 {
            tracing::info!(channel = %id, aborted = transport.aborted(), "aborted sends");
        }
    }
    Ok(outcome)
}

fn log_event(event: &SessionEvent, last_logged: &mut u32) {
    match event {
        SessionEvent::ChunkStarted {
            chunk_id,
            channel_id,
            attempt,
        } => tracing::debug!(chunk = %chunk_id, channel = %channel_id, attempt, "chunk started"),
        SessionEvent::ChunkProgress { .. } => {}
        SessionEvent::ChunkCompleted {
            chunk_id,
            channel_id,
        } => tracing::debug!(chunk = %chunk_id, channel = %channel_id, "chunk completed"),
        SessionEvent::ChunkRetrying {
            chunk_id,
            failures,
            error,
        } => tracing::warn!(chunk = %chunk_id, failures, error = %error, "retrying chunk"),
        SessionEvent::ChunkFailed { chunk_id, error } => {
            tracing::error!(chunk = %chunk_id, error = %error, "chunk gave up")
        }
        SessionEvent::ChannelUnavailable { channel_id, reason } => {
            tracing::warn!(channel = %channel_id, reason = %reason, "channel unavailable")
        }
        SessionEvent::ChannelAvailable { channel_id } => {
            tracing::info!(channel = %channel_id, "channel back")
        }
        SessionEvent::Progress { percent } => {
            // Log in 10% steps.
            let step = (*percent / 10.0) as u32;
            if step > *last_logged {
                *last_logged = step;
                tracing::info!(percent = %format!("{percent:.1}"), "progress");
            }
        }
        SessionEvent::Finished(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimChannel;
    use multichannel_session::{ChannelKind, SessionConfig, SessionStatus};

    fn fast_channel(id: &str, kind: ChannelKind) -> SimChannel {
        SimChannel {
            id: id.into(),
            kind,
            max_concurrent_chunks: 2,
            bytes_per_sec: 1024 * 1024,
            fail_every: 0,
            drop_after: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transfers_file_over_default_style_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, vec![42u8; 100 * 1024]).unwrap();

        let config = SimConfig {
            session: SessionConfig {
                chunk_size: 16 * 1024,
                ..Default::default()
            },
            channels: vec![
                fast_channel("wlan0", ChannelKind::wifi()),
                fast_channel("usb0", ChannelKind::usb()),
            ],
        };

        let outcome = run(&path, config).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert!(outcome.unresolved.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn survives_flaky_and_dropping_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, vec![7u8; 64 * 1024]).unwrap();

        let mut flaky = fast_channel("wlan0", ChannelKind::wifi());
        flaky.fail_every = 3;
        let mut dropping = fast_channel("usb0", ChannelKind::usb());
        dropping.drop_after = Some(1);

        let config = SimConfig {
            session: SessionConfig {
                chunk_size: 8 * 1024,
                max_attempts: 5,
                ..Default::default()
            },
            channels: vec![flaky, dropping],
        };

        let outcome = run(&path, config).await.unwrap();
        assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    }
}
