//! Shared building blocks for the runlog event pipeline.
//!
//! Everything that crosses a crate boundary lives here: the event model,
//! life-cycle types, the durable-write backend trait, the error taxonomy
//! with its wire codes, configuration and logging setup.

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod protocol;
pub mod types;

pub use backend::{CheckpointInfo, MessageRecord, MessageTarget, StatisticSample, WriteBackend};
pub use config::{ConfigError, LoadedConfig, PipelineConfig};
pub use errors::{BackendError, ErrorCode, LoadQueueError, PipelineError};
pub use events::{Event, EventKind, EventRecord};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use protocol::{RelayEnvelope, RelayReply, RemoteError};
pub use types::{
    ChannelId, ChannelSnapshot, CheckpointId, CheckpointResult, EventOutcome, Expectation,
    LifeCycleState, LoadQueueId, MessageLevel, RunId, SuiteId, TestcaseId, TestcaseResult,
    TimeoutClass,
};

/// Milliseconds since the Unix epoch on the local wall clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
