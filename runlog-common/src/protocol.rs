//! Relay protocol definitions.
//!
//! Defines the JSON structures exchanged with remote execution agents. A
//! remote agent sends one [`RelayEnvelope`] per event and gets a
//! [`RelayReply`] back.

use crate::errors::{ErrorCode, PipelineError};
use crate::events::Event;
use crate::types::{ChannelId, EventOutcome};
use serde::{Deserialize, Serialize};

/// One event relayed from a remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Identity of the remote caller; becomes the channel id.
    pub caller: ChannelId,
    /// Thread on the remote side that produced the event.
    #[serde(default)]
    pub thread_name: Option<String>,
    /// Wall-clock time of the sender when the event was created (epoch ms).
    pub sender_timestamp: i64,
    pub event: Event,
}

/// Failure sent back over the wire: a closed code plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Re-raise a failure received from a peer as a local error.
    pub fn into_pipeline_error(self) -> PipelineError {
        PipelineError::Remote {
            code: self.code,
            message: self.message,
        }
    }
}

impl From<&PipelineError> for RemoteError {
    fn from(err: &PipelineError) -> Self {
        match err {
            // Keep the original message when forwarding an error that already
            // came from another peer.
            PipelineError::Remote { code, message } => Self::new(*code, message.clone()),
            other => Self::new(other.code(), other.to_string()),
        }
    }
}

/// Answer to a [`RelayEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelayReply {
    /// Queued; the caller does not wait for asynchronous events.
    Accepted,
    /// Processed; ids of the channel afterwards.
    Completed(EventOutcome),
    /// The wait expired before the worker finished the event.
    TimedOut,
    Failed(RemoteError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::types::{Expectation, LifeCycleState, TestcaseId};

    #[test]
    fn test_envelope_roundtrip_from_json() {
        let json = r#"{
            "caller": "agent-3",
            "sender_timestamp": 1700000000000,
            "event": {"type": "LEAVE_TESTCASE"}
        }"#;
        let envelope: RelayEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.caller, ChannelId::new("agent-3"));
        assert_eq!(envelope.thread_name, None);
        assert_eq!(envelope.event.kind(), EventKind::LeaveTestcase);
    }

    #[test]
    fn test_remote_error_from_pipeline_error() {
        let err = PipelineError::StateViolation {
            event: EventKind::EndSuite,
            state: LifeCycleState::RunStarted,
            expected: Expectation::Exactly(LifeCycleState::SuiteStarted),
        };
        let remote = RemoteError::from(&err);
        assert_eq!(remote.code, ErrorCode::StateViolation);
        assert!(remote.message.contains("END_SUITE"));

        let replayed = remote.into_pipeline_error();
        assert_eq!(replayed.code(), ErrorCode::StateViolation);
    }

    #[test]
    fn test_unknown_remote_code_replays_as_remote() {
        let remote: RemoteError =
            serde_json::from_str(r#"{"code":"QUOTA_EXHAUSTED","message":"slow down"}"#).unwrap();
        assert_eq!(remote.code, ErrorCode::Remote);
        let err = remote.into_pipeline_error();
        assert_eq!(err.to_string(), "remote RLG-E099: slow down");
    }

    #[test]
    fn test_reply_wire_shape() {
        let reply = RelayReply::Completed(EventOutcome {
            testcase_id: Some(TestcaseId(9)),
            ..EventOutcome::default()
        });
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["testcase_id"], 9);

        let failed = RelayReply::Failed(RemoteError::new(ErrorCode::Connectivity, "down"));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["code"], "CONNECTIVITY");
    }
}
