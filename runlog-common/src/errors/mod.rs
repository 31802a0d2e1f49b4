//! Error taxonomy for the event pipeline.
//!
//! | Type             | Raised by                  | Visible to producer             |
//! |------------------|----------------------------|---------------------------------|
//! | `BackendError`   | durable-write backends     | only for critical events        |
//! | `LoadQueueError` | load-queue registry        | only for critical events        |
//! | `PipelineError`  | queue, processor, channel  | capacity and critical failures  |
//!
//! Every `PipelineError` maps onto a wire [`ErrorCode`].

pub mod catalog;

pub use catalog::ErrorCode;

use crate::events::EventKind;
use crate::types::{ChannelId, Expectation, LifeCycleState};
use thiserror::Error;

/// Failure reported by a durable-write backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The database could not be reached.
    #[error("database unreachable: {0}")]
    Connectivity(String),

    /// A foreign-key or other integrity constraint rejected the write.
    #[error("integrity constraint violated: {0}")]
    Integrity(String),

    /// The database does not have the expected tables.
    #[error("schema check failed: {0}")]
    Schema(String),

    #[error("database error: {0}")]
    Database(String),
}

impl BackendError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// Integrity failures may mean a parent row was deleted underneath us.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

/// Load-queue and checkpoint bookkeeping errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadQueueError {
    #[error("load queue '{name}' is already started")]
    AlreadyStarted { name: String },

    #[error("no load queue named '{name}'")]
    NoSuchLoadQueue { name: String },

    #[error("thread '{thread}' is already registered with load queue '{load_queue}'")]
    ThreadAlreadyRegistered { thread: String, load_queue: String },

    #[error("thread '{thread}' is not registered with any load queue")]
    ThreadNotRegistered { thread: String },

    #[error("checkpoint '{name}' is already running in thread '{thread}'")]
    CheckpointAlreadyStarted { name: String, thread: String },

    #[error("checkpoint '{name}' was not started in thread '{thread}'")]
    CheckpointNotStarted { name: String, thread: String },
}

/// Errors surfaced by the pipeline to producers and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(
        "too many messages queued for channel '{channel}' (capacity {capacity}); \
         lower the logging threshold or check DB connectivity"
    )]
    CapacityExceeded { channel: ChannelId, capacity: usize },

    #[error("{event} is not allowed in state {state} (expected {expected})")]
    StateViolation {
        event: EventKind,
        state: LifeCycleState,
        expected: Expectation,
    },

    #[error("{event} failed: {source}")]
    Backend {
        event: EventKind,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    LoadQueue(#[from] LoadQueueError),

    #[error("channel '{channel}' is closed")]
    ChannelClosed { channel: ChannelId },

    /// A failure replayed from another process.
    #[error("remote {}: {message}", .code.code_string())]
    Remote { code: ErrorCode, message: String },
}

impl PipelineError {
    pub fn backend(event: EventKind, source: BackendError) -> Self {
        Self::Backend { event, source }
    }

    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::StateViolation { .. } => ErrorCode::StateViolation,
            Self::Backend { source, .. } if source.is_connectivity() => ErrorCode::Connectivity,
            Self::Backend { .. } => ErrorCode::Persistence,
            Self::LoadQueue(_) => ErrorCode::LoadQueue,
            Self::ChannelClosed { .. } => ErrorCode::ChannelClosed,
            Self::Remote { code, .. } => *code,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        self.code() == ErrorCode::Connectivity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message_names_remedy() {
        let err = PipelineError::CapacityExceeded {
            channel: ChannelId::new("vu-7"),
            capacity: 2,
        };
        let text = err.to_string();
        assert!(text.contains("too many messages queued"));
        assert!(text.contains("lower the logging threshold"));
        assert!(text.contains("check DB connectivity"));
        assert_eq!(err.code(), ErrorCode::CapacityExceeded);
    }

    #[test]
    fn test_state_violation_display() {
        let err = PipelineError::StateViolation {
            event: EventKind::EndTestcase,
            state: LifeCycleState::SuiteStarted,
            expected: Expectation::Exactly(LifeCycleState::TestcaseStarted),
        };
        assert_eq!(
            err.to_string(),
            "END_TESTCASE is not allowed in state SUITE_STARTED (expected TEST_CASE_STARTED)"
        );
    }

    #[test]
    fn test_backend_codes() {
        let down = PipelineError::backend(
            EventKind::InsertMessage,
            BackendError::Connectivity("refused".into()),
        );
        assert_eq!(down.code(), ErrorCode::Connectivity);
        assert!(down.is_connectivity());

        let fk = PipelineError::backend(
            EventKind::InsertMessage,
            BackendError::Integrity("FOREIGN KEY constraint failed".into()),
        );
        assert_eq!(fk.code(), ErrorCode::Persistence);
        assert!(!fk.is_connectivity());
    }

    #[test]
    fn test_load_queue_error_converts() {
        let err: PipelineError = LoadQueueError::NoSuchLoadQueue {
            name: "checkout".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::LoadQueue);
        assert_eq!(err.to_string(), "no load queue named 'checkout'");
    }

    #[test]
    fn test_remote_display_uses_code_string() {
        let err = PipelineError::Remote {
            code: ErrorCode::StateViolation,
            message: "END_SUITE out of order".into(),
        };
        assert_eq!(err.to_string(), "remote RLG-E002: END_SUITE out of order");
    }
}
