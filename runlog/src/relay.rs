//! Relay adapter for events produced by remote execution agents.
//!
//! Each remote caller gets its own channel. The first START_RUN or
//! JOIN_TESTCASE from a caller fixes the clock offset between the agent and
//! this process; every relayed timestamp is shifted by it. Failures travel
//! back as [`RemoteError`] values with a stable code.

use crate::bridge::AwaitOutcome;
use crate::pipeline::EventPipeline;
use runlog_common::{
    ChannelId, EventKind, EventRecord, PipelineError, RelayEnvelope, RelayReply, RemoteError,
};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RelayAdapter {
    pipeline: Arc<EventPipeline>,
}

impl RelayAdapter {
    pub fn new(pipeline: Arc<EventPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }

    /// Hand one relayed event to the caller's channel.
    ///
    /// Events with a timeout class are awaited; everything else is accepted
    /// as soon as it is queued.
    pub fn handle(&self, envelope: RelayEnvelope) -> RelayReply {
        let kind = envelope.event.kind();
        match self.dispatch(envelope) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(event = %kind, error = %err, "relayed event failed");
                RelayReply::Failed(RemoteError::from(&err))
            }
        }
    }

    fn dispatch(&self, envelope: RelayEnvelope) -> Result<RelayReply, PipelineError> {
        let RelayEnvelope {
            caller,
            thread_name,
            sender_timestamp,
            event,
        } = envelope;
        let kind = event.kind();
        let channel = self.pipeline.channel(&caller);

        if matches!(kind, EventKind::StartRun | EventKind::JoinTestcase) {
            channel.handshake(sender_timestamp);
        }

        let thread = thread_name.unwrap_or_else(|| caller.to_string());
        let record = EventRecord::with_timestamp(thread, event, sender_timestamp);

        let Some(class) = kind.default_timeout_class() else {
            channel.submit_record(record)?;
            return Ok(RelayReply::Accepted);
        };
        match channel.submit_record_and_await(record, class)? {
            AwaitOutcome::Completed(outcome) => Ok(RelayReply::Completed(outcome)),
            AwaitOutcome::TimedOut => {
                warn!(%caller, event = %kind, "relayed event still queued after timeout");
                Ok(RelayReply::TimedOut)
            }
        }
    }

    /// Unclaimed critical failure of `caller`, cleared on read.
    pub fn take_last_error(&self, caller: &ChannelId) -> Option<RemoteError> {
        self.pipeline
            .take_last_error(caller)
            .map(|err| RemoteError::from(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlog_common::events::{StartRun, StartSuite};
    use runlog_common::{ErrorCode, Event, PipelineConfig};
    use runlog_store::MemoryBackend;

    fn adapter() -> (Arc<MemoryBackend>, RelayAdapter) {
        let backend = Arc::new(MemoryBackend::new());
        let pipeline = EventPipeline::new(backend.clone(), PipelineConfig::default());
        (backend, RelayAdapter::new(Arc::new(pipeline)))
    }

    fn envelope(event: Event) -> RelayEnvelope {
        RelayEnvelope {
            caller: ChannelId::new("agent-1"),
            thread_name: Some("vu-1".into()),
            sender_timestamp: runlog_common::now_millis(),
            event,
        }
    }

    #[test]
    fn test_start_run_completes_with_run_id() {
        let (_backend, relay) = adapter();
        let reply = relay.handle(envelope(Event::StartRun(StartRun {
            run_name: "remote".into(),
            ..StartRun::default()
        })));
        match reply {
            RelayReply::Completed(outcome) => assert!(outcome.run_id.is_some()),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_async_event_is_accepted() {
        let (_backend, relay) = adapter();
        let reply = relay.handle(envelope(Event::message(
            runlog_common::MessageLevel::Info,
            "hi",
        )));
        assert_eq!(reply, RelayReply::Accepted);
    }

    #[test]
    fn test_state_violation_travels_as_code() {
        let (_backend, relay) = adapter();
        let reply = relay.handle(envelope(Event::StartSuite(StartSuite {
            suite_name: "s".into(),
            ..StartSuite::default()
        })));
        match reply {
            RelayReply::Failed(err) => assert_eq!(err.code, ErrorCode::StateViolation),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(relay.take_last_error(&ChannelId::new("agent-1")).is_none());
    }
}
