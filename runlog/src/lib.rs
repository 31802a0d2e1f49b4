//! Asynchronous test-execution event pipeline.
//!
//! Producers submit life-cycle events (runs, suites, testcases, checkpoints,
//! messages) to a per-channel bounded queue and continue immediately. A worker
//! thread per channel feeds the events, in order, through an
//! [`EventProcessor`] that validates them against the channel's life-cycle
//! state and writes them to a [`runlog_common::WriteBackend`].
//!
//! ```text
//! producer ──submit──▶ ChannelQueue ──▶ Worker ──▶ EventProcessor ──▶ WriteBackend
//!     ▲                                   │
//!     └──────── Completion (awaited events only)
//! ```

#![forbid(unsafe_code)]

pub mod bridge;
pub mod channel;
pub mod load_queues;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod relay;
pub mod worker;

pub use bridge::{AwaitOutcome, ChannelStatus, LastError, ListenerSet, ProcessorListener};
pub use channel::Channel;
pub use pipeline::EventPipeline;
pub use processor::{AfterModes, Entity, EventProcessor, SuiteIdCache};
pub use queue::{ChannelQueue, Control, DequeueMode};
pub use relay::RelayAdapter;
