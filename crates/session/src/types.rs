//! Event and outcome types of a transfer session.

use multichannel_protocol::SessionStatus;
use serde::Serialize;

use crate::error::SessionError;

/// Event emitted while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A send attempt began on a channel.
    ChunkStarted {
        chunk_id: String,
        channel_id: String,
        attempt: u32,
    },
    /// Progress of the current attempt.
    ChunkProgress {
        chunk_id: String,
        channel_id: String,
        percent: u8,
    },
    ChunkCompleted {
        chunk_id: String,
        channel_id: String,
    },
    /// An attempt failed and the chunk went back to the queue.
    ChunkRetrying {
        chunk_id: String,
        failures: u32,
        error: String,
    },
    /// The chunk used up its attempts.
    ChunkFailed { chunk_id: String, error: String },
    /// Informational: in-flight chunks of the channel were re-queued.
    ChannelUnavailable { channel_id: String, reason: String },
    ChannelAvailable { channel_id: String },
    /// The aggregate percentage moved.
    Progress { percent: f64 },
    /// Terminal event, emitted exactly once.
    Finished(TransferOutcome),
}

/// Terminal result of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    /// Ids of chunks that did not reach `Completed`, in index order.
    pub unresolved: Vec<String>,
    /// Last error per unresolved chunk that failed at least once.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<(String, String)>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// Converts the outcome into a `Result` for `?`-style callers.
    pub fn into_result(self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Completed => Ok(()),
            SessionStatus::Cancelled => Err(SessionError::Cancelled),
            _ => Err(SessionError::SessionFailed {
                unresolved: self.unresolved,
            }),
        }
    }

    /// Last error of every unresolved chunk that failed at least once.
    pub fn chunk_errors(&self) -> Vec<SessionError> {
        self.errors
            .iter()
            .map(|(chunk_id, reason)| SessionError::ChunkTransfer {
                chunk_id: chunk_id.clone(),
                reason: reason.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: SessionStatus, unresolved: &[&str]) -> TransferOutcome {
        TransferOutcome {
            session_id: "s1".into(),
            status,
            unresolved: unresolved.iter().map(|s| s.to_string()).collect(),
            errors: vec![],
        }
    }

    #[test]
    fn completed_is_ok() {
        let o = outcome(SessionStatus::Completed, &[]);
        assert!(o.is_success());
        assert!(o.into_result().is_ok());
    }

    #[test]
    fn failed_carries_unresolved_ids() {
        let o = outcome(SessionStatus::Failed, &["f_chunk_1", "f_chunk_3"]);
        match o.into_result() {
            Err(SessionError::SessionFailed { unresolved }) => {
                assert_eq!(unresolved, vec!["f_chunk_1", "f_chunk_3"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn cancelled_maps_to_cancelled() {
        let o = outcome(SessionStatus::Cancelled, &["f_chunk_0"]);
        assert!(matches!(o.into_result(), Err(SessionError::Cancelled)));
    }

    #[test]
    fn chunk_errors_name_each_chunk() {
        let mut o = outcome(SessionStatus::Failed, &["f_chunk_2"]);
        o.errors = vec![("f_chunk_2".into(), "send failed: crc".into())];
        let errors = o.chunk_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "chunk f_chunk_2 failed: send failed: crc"
        );
    }

    #[test]
    fn outcome_json_shape() {
        let json = serde_json::to_string(&outcome(SessionStatus::Completed, &[])).unwrap();
        assert_eq!(
            json,
            r#"{"sessionId":"s1","status":"completed","unresolved":[]}"#
        );
    }
}
