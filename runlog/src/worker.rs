//! Channel worker thread.
//!
//! One thread per channel drains the queue into the channel's
//! [`EventProcessor`]. Failures are triaged here: critical ones are kept for
//! the producer, a lost database connection is reported once, and other
//! failures are logged up to a limit and then swallowed.
//!
//! A worker on a non-main channel exits after LEAVE_TESTCASE once its queue is
//! empty and hands the processor back through its join handle, so the next
//! worker of the channel continues with the same state.

use crate::bridge::{ChannelStatus, LastError};
use crate::processor::EventProcessor;
use crate::queue::{ChannelQueue, Control, DequeueMode, Dequeued, QueuedEvent};
use runlog_common::{BackendError, ChannelId, EventKind, PipelineConfig, PipelineError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Liveness of a channel's worker, shared between the worker and producers.
#[derive(Debug, Default)]
pub struct WorkerSlot {
    pub running: bool,
    pub closed: bool,
    pub handle: Option<JoinHandle<EventProcessor>>,
}

/// Everything a worker shares with its channel.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub channel: ChannelId,
    pub queue: ChannelQueue,
    pub slot: Arc<Mutex<WorkerSlot>>,
    pub last_error: Arc<LastError>,
    pub status: Arc<ChannelStatus>,
    pub config: Arc<PipelineConfig>,
    pub is_main: bool,
}

/// Per-worker failure reporting state.
#[derive(Debug)]
struct ErrorTriage {
    connectivity_reported: bool,
    minor_logged: u32,
    minor_limit: u32,
}

impl ErrorTriage {
    fn new(minor_limit: u32) -> Self {
        Self {
            connectivity_reported: false,
            minor_logged: 0,
            minor_limit,
        }
    }

    fn report_connectivity(&mut self, channel: &ChannelId, error: &dyn std::fmt::Display) {
        if !self.connectivity_reported {
            self.connectivity_reported = true;
            error!(
                %channel,
                %error,
                "database connection lost; further connection errors on this channel are not logged"
            );
        }
    }

    fn report_minor(&mut self, channel: &ChannelId, event: EventKind, error: &PipelineError) {
        if self.minor_logged >= self.minor_limit {
            return;
        }
        self.minor_logged += 1;
        warn!(%channel, %event, %error, "event could not be recorded");
        if self.minor_logged == self.minor_limit {
            warn!(
                %channel,
                limit = self.minor_limit,
                "error limit reached; further non-critical errors on this channel are not logged"
            );
        }
    }
}

pub struct Worker {
    ctx: WorkerContext,
    processor: EventProcessor,
    triage: ErrorTriage,
    shutdown: bool,
}

impl Worker {
    pub fn new(ctx: WorkerContext, processor: EventProcessor) -> Self {
        let triage = ErrorTriage::new(ctx.config.minor_error_log_limit);
        Self {
            ctx,
            processor,
            triage,
            shutdown: false,
        }
    }

    /// Start the worker on a named thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<EventProcessor>> {
        thread::Builder::new()
            .name(format!("runlog-{}", self.ctx.channel))
            .spawn(move || self.run())
    }

    fn mode(&self) -> DequeueMode {
        if self.ctx.config.batch_mode {
            DequeueMode::TimedPoll(self.ctx.config.batch_flush_interval())
        } else {
            DequeueMode::Blocking
        }
    }

    /// Process until told to stop; returns the processor for the next worker.
    pub fn run(mut self) -> EventProcessor {
        let mode = self.mode();
        debug!(channel = %self.ctx.channel, ?mode, "worker started");

        loop {
            match self.ctx.queue.dequeue(mode) {
                Dequeued::Idle => {
                    if self.ctx.config.batch_mode {
                        self.flush();
                    }
                }
                Dequeued::Control(control) => self.apply(control),
                Dequeued::Event(queued) => {
                    for control in self.ctx.queue.take_controls() {
                        self.apply(control);
                    }
                    let kind = queued.record.kind();
                    self.handle(queued);
                    if kind == EventKind::LeaveTestcase && !self.ctx.is_main && self.try_exit() {
                        debug!(channel = %self.ctx.channel, "worker left testcase and exits");
                        break;
                    }
                }
            }

            if self.shutdown {
                while let Some(queued) = self.ctx.queue.try_dequeue() {
                    self.handle(queued);
                }
                self.flush();
                info!(channel = %self.ctx.channel, "worker stopped");
                break;
            }
        }

        self.processor
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::Delete(testcase_id) => {
                if let Err(err) = self.processor.delete_testcase(testcase_id) {
                    self.triage(EventKind::DeleteTestcase, err);
                }
                self.publish();
            }
            Control::Shutdown => self.shutdown = true,
        }
    }

    fn handle(&mut self, queued: QueuedEvent) {
        let QueuedEvent { record, completion } = queued;
        let kind = record.kind();
        let result = self.processor.process(record);
        self.publish();

        let unclaimed = match completion {
            Some(done) => done.complete(result),
            None => result.err(),
        };
        if let Some(err) = unclaimed {
            self.triage(kind, err);
        }
    }

    fn publish(&self) {
        let mut snapshot = self.processor.snapshot();
        snapshot.pending_events = self.ctx.queue.len();
        self.ctx.status.publish(snapshot);
    }

    fn flush(&mut self) {
        if let Err(err) = self.processor.flush() {
            self.report_backend(err);
        }
    }

    fn report_backend(&mut self, err: BackendError) {
        if err.is_connectivity() {
            self.triage.report_connectivity(&self.ctx.channel, &err);
        } else {
            warn!(channel = %self.ctx.channel, error = %err, "flushing cached writes failed");
        }
    }

    fn triage(&mut self, kind: EventKind, err: PipelineError) {
        if kind.is_critical() {
            debug!(channel = %self.ctx.channel, event = %kind, error = %err, "critical failure kept for the producer");
            self.ctx.last_error.record(err);
        } else if err.is_connectivity() {
            self.triage.report_connectivity(&self.ctx.channel, &err);
        } else if matches!(
            kind,
            EventKind::InsertMessage | EventKind::RegisterThreadWithLoadQueue
        ) {
            // Logging these would feed back into the channel that just failed.
        } else {
            self.triage.report_minor(&self.ctx.channel, kind, &err);
        }
    }

    /// Stop running if nothing arrived meanwhile. Producers check `running`
    /// under the same lock after enqueueing, so no event is stranded.
    fn try_exit(&self) -> bool {
        let mut slot = self.ctx.slot.lock().unwrap_or_else(|e| e.into_inner());
        if self.ctx.queue.is_empty() && !self.shutdown {
            slot.running = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlog_common::events::StartRun;
    use runlog_common::{Event, EventRecord, MessageLevel};
    use runlog_store::{BackendOp, MemoryBackend};

    fn context(config: PipelineConfig, is_main: bool) -> WorkerContext {
        let channel = ChannelId::new("w");
        WorkerContext {
            queue: ChannelQueue::new(channel.clone(), 16),
            slot: Arc::new(Mutex::new(WorkerSlot {
                running: true,
                ..WorkerSlot::default()
            })),
            last_error: Arc::new(LastError::default()),
            status: Arc::new(ChannelStatus::new(channel.clone())),
            config: Arc::new(config),
            is_main,
            channel,
        }
    }

    fn enqueue(ctx: &WorkerContext, event: Event) {
        ctx.queue
            .try_enqueue(QueuedEvent::new(EventRecord::new("t", event)))
            .unwrap();
    }

    fn start_run() -> Event {
        Event::StartRun(StartRun {
            run_name: "r".into(),
            ..StartRun::default()
        })
    }

    #[test]
    fn test_shutdown_drains_queue_and_returns_processor() {
        let backend = Arc::new(MemoryBackend::new());
        let ctx = context(PipelineConfig::default(), true);
        let processor = EventProcessor::new(ctx.channel.clone(), backend.clone(), ctx.config.clone());

        enqueue(&ctx, start_run());
        enqueue(&ctx, Event::message(MessageLevel::Info, "hello"));
        ctx.queue.send_control(Control::Shutdown);

        let processor = Worker::new(ctx.clone(), processor).run();

        assert!(processor.run_id().is_some());
        assert_eq!(backend.call_count(BackendOp::InsertMessage), 1);
        assert!(ctx.status.snapshot().run_id.is_some());
    }

    #[test]
    fn test_critical_failure_lands_in_last_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_reachable(false);
        let ctx = context(PipelineConfig::default(), true);
        let processor = EventProcessor::new(ctx.channel.clone(), backend.clone(), ctx.config.clone());

        enqueue(&ctx, start_run());
        enqueue(&ctx, Event::EndRun);
        ctx.queue.send_control(Control::Shutdown);
        Worker::new(ctx.clone(), processor).run();

        let err = ctx.last_error.take().unwrap();
        assert!(err.is_connectivity());
        assert!(ctx.last_error.take().is_none());
    }

    #[test]
    fn test_non_main_worker_exits_after_leave() {
        let backend = Arc::new(MemoryBackend::new());
        let ctx = context(PipelineConfig::default(), false);
        let processor = EventProcessor::new(ctx.channel.clone(), backend, ctx.config.clone());

        enqueue(
            &ctx,
            Event::JoinTestcase(runlog_common::events::JoinTestcase {
                run_id: runlog_common::RunId(1),
                suite_id: runlog_common::SuiteId(2),
                testcase_id: runlog_common::TestcaseId(3),
            }),
        );
        enqueue(&ctx, Event::LeaveTestcase);

        let handle = Worker::new(ctx.clone(), processor).spawn().unwrap();
        let processor = handle.join().unwrap();

        assert_eq!(
            processor.state(),
            runlog_common::LifeCycleState::Initialized
        );
        assert!(!ctx.slot.lock().unwrap().running);
    }

    #[test]
    fn test_minor_error_logging_is_limited() {
        let mut triage = ErrorTriage::new(2);
        let channel = ChannelId::new("w");
        let err = PipelineError::ChannelClosed {
            channel: channel.clone(),
        };
        for _ in 0..5 {
            triage.report_minor(&channel, EventKind::EndSuite, &err);
        }
        assert_eq!(triage.minor_logged, 2);

        triage.report_connectivity(&channel, &err);
        triage.report_connectivity(&channel, &err);
        assert!(triage.connectivity_reported);
    }
}
