//! Synchronization bridge between workers and producers.
//!
//! Information flows back to producers only through this module:
//! - [`Completion`] / [`CompletionWaiter`]: single-slot rendezvous for one
//!   in-flight event a producer is waiting on.
//! - [`LastError`]: single-slot holder for a critical failure nobody waited on.
//! - [`ChannelStatus`]: the published [`ChannelSnapshot`] of a channel.
//! - [`ProcessorListener`]: life-cycle callbacks invoked on the worker thread.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use runlog_common::{
    ChannelId, ChannelSnapshot, EventKind, EventOutcome, LifeCycleState, PipelineError, RunId,
    TestcaseId,
};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

type CompletionResult = Result<EventOutcome, PipelineError>;

// ── Rendezvous ──────────────────────────────────────────────────────────────

/// Worker side of a rendezvous. Consumed when the event has been processed.
#[derive(Debug)]
pub struct Completion {
    tx: Sender<CompletionResult>,
}

/// Producer side of a rendezvous.
#[derive(Debug)]
pub struct CompletionWaiter {
    rx: Receiver<CompletionResult>,
    channel: ChannelId,
    event: EventKind,
}

/// Result of waiting on a critical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// The worker finished the event; ids of the channel afterwards.
    Completed(EventOutcome),
    /// The wait expired. The event stays queued and will still be processed.
    TimedOut,
}

impl AwaitOutcome {
    pub fn outcome(&self) -> Option<EventOutcome> {
        match self {
            Self::Completed(outcome) => Some(*outcome),
            Self::TimedOut => None,
        }
    }
}

/// Create a connected completion pair for one event.
pub fn completion(channel: ChannelId, event: EventKind) -> (Completion, CompletionWaiter) {
    let (tx, rx) = channel::bounded(1);
    (Completion { tx }, CompletionWaiter { rx, channel, event })
}

impl Completion {
    /// Hand the result to the waiting producer.
    ///
    /// Returns the error back when the producer already stopped waiting, so
    /// the caller can keep it for a later `take_last_error`.
    pub fn complete(self, result: CompletionResult) -> Option<PipelineError> {
        match self.tx.try_send(result) {
            Ok(()) => None,
            Err(err) => err.into_inner().err(),
        }
    }
}

impl CompletionWaiter {
    pub fn event(&self) -> EventKind {
        self.event
    }

    /// Block until the worker completes the event or `timeout` passes.
    ///
    /// A failure recorded by the worker for this event is re-raised here.
    pub fn wait(self, timeout: Duration) -> Result<AwaitOutcome, PipelineError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(outcome)) => Ok(AwaitOutcome::Completed(outcome)),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    channel = %self.channel,
                    event = %self.event,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for event to be processed, continuing"
                );
                Ok(AwaitOutcome::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::ChannelClosed {
                channel: self.channel,
            }),
        }
    }
}

// ── Last error ──────────────────────────────────────────────────────────────

/// Single-slot holder for the most recent unclaimed critical failure.
#[derive(Debug, Default)]
pub struct LastError {
    slot: Mutex<Option<PipelineError>>,
}

impl LastError {
    pub fn record(&self, err: PipelineError) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(err) {
            debug!(error = %previous, "unclaimed critical error replaced");
        }
    }

    /// Read and clear.
    pub fn take(&self) -> Option<PipelineError> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

// ── Listeners ───────────────────────────────────────────────────────────────

/// Life-cycle notifications from the event processor.
///
/// Called on the worker thread; implementations must not block.
pub trait ProcessorListener: Send + Sync {
    fn on_run_started(&self, _run_id: RunId) {}

    /// Also called when the run is found deleted from the store.
    fn on_run_finished(&self, _run_id: RunId) {}

    fn on_testcase_started(&self, _testcase_id: TestcaseId) {}

    fn on_testcase_finished(&self, _testcase_id: TestcaseId) {}
}

/// Fan-out to every registered listener.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn ProcessorListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn ProcessorListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ProcessorListener for ListenerSet {
    fn on_run_started(&self, run_id: RunId) {
        for listener in &self.listeners {
            listener.on_run_started(run_id);
        }
    }

    fn on_run_finished(&self, run_id: RunId) {
        for listener in &self.listeners {
            listener.on_run_finished(run_id);
        }
    }

    fn on_testcase_started(&self, testcase_id: TestcaseId) {
        for listener in &self.listeners {
            listener.on_testcase_started(testcase_id);
        }
    }

    fn on_testcase_finished(&self, testcase_id: TestcaseId) {
        for listener in &self.listeners {
            listener.on_testcase_finished(testcase_id);
        }
    }
}

// ── Channel status ──────────────────────────────────────────────────────────

/// Latest known state of one channel, readable from any thread.
#[derive(Debug)]
pub struct ChannelStatus {
    channel: ChannelId,
    snapshot: RwLock<ChannelSnapshot>,
}

impl ChannelStatus {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            snapshot: RwLock::new(ChannelSnapshot::default()),
        }
    }

    /// Replace the snapshot with the processor's view after an event.
    pub fn publish(&self, snapshot: ChannelSnapshot) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut ChannelSnapshot)) {
        f(&mut self.snapshot.write().unwrap_or_else(|e| e.into_inner()));
    }
}

impl ProcessorListener for ChannelStatus {
    fn on_run_started(&self, run_id: RunId) {
        debug!(channel = %self.channel, %run_id, "run started");
        self.update(|s| {
            s.life_cycle_state = LifeCycleState::RunStarted;
            s.run_id = Some(run_id);
        });
    }

    fn on_run_finished(&self, run_id: RunId) {
        debug!(channel = %self.channel, %run_id, "run finished");
        self.update(|s| {
            s.life_cycle_state = LifeCycleState::Initialized;
            s.run_id = None;
            s.suite_id = None;
            s.testcase_id = None;
        });
    }

    fn on_testcase_started(&self, testcase_id: TestcaseId) {
        debug!(channel = %self.channel, %testcase_id, "testcase started");
        self.update(|s| {
            s.life_cycle_state = LifeCycleState::TestcaseStarted;
            s.testcase_id = Some(testcase_id);
        });
    }

    fn on_testcase_finished(&self, testcase_id: TestcaseId) {
        debug!(channel = %self.channel, %testcase_id, "testcase finished");
        self.update(|s| {
            s.life_cycle_state = LifeCycleState::SuiteStarted;
            s.testcase_id = None;
            s.last_executed_testcase_id = Some(testcase_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlog_common::SuiteId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn pair(event: EventKind) -> (Completion, CompletionWaiter) {
        completion(ChannelId::new("t"), event)
    }

    #[test]
    fn test_wait_returns_outcome_from_other_thread() {
        let (done, waiter) = pair(EventKind::StartTestcase);
        let worker = thread::spawn(move || {
            done.complete(Ok(EventOutcome {
                testcase_id: Some(TestcaseId(9)),
                ..EventOutcome::default()
            }))
        });

        let outcome = waiter.wait(Duration::from_secs(5)).unwrap();
        assert!(worker.join().unwrap().is_none());
        assert_eq!(outcome.outcome().unwrap().testcase_id, Some(TestcaseId(9)));
    }

    #[test]
    fn test_wait_reraises_worker_error() {
        let (done, waiter) = pair(EventKind::StartSuite);
        let err = PipelineError::ChannelClosed {
            channel: ChannelId::new("x"),
        };
        assert!(done.complete(Err(err.clone())).is_none());
        assert_eq!(waiter.wait(Duration::from_secs(1)).unwrap_err(), err);
    }

    #[test]
    fn test_wait_times_out_without_error() {
        let (_done, waiter) = pair(EventKind::EndRun);
        let outcome = waiter.wait(Duration::from_millis(20)).unwrap();
        assert_eq!(outcome, AwaitOutcome::TimedOut);
    }

    #[test]
    fn test_dropped_completion_reports_closed_channel() {
        let (done, waiter) = pair(EventKind::StartRun);
        drop(done);
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)),
            Err(PipelineError::ChannelClosed { .. })
        ));
    }

    #[test]
    fn test_complete_after_waiter_gone_returns_error() {
        let (done, waiter) = pair(EventKind::StartRun);
        drop(waiter);
        let err = PipelineError::ChannelClosed {
            channel: ChannelId::new("x"),
        };
        assert_eq!(done.complete(Err(err.clone())), Some(err));
    }

    #[test]
    fn test_last_error_is_single_slot() {
        let last = LastError::default();
        last.record(PipelineError::ChannelClosed {
            channel: ChannelId::new("a"),
        });
        last.record(PipelineError::ChannelClosed {
            channel: ChannelId::new("b"),
        });
        assert!(last.is_set());
        assert_eq!(
            last.take(),
            Some(PipelineError::ChannelClosed {
                channel: ChannelId::new("b")
            })
        );
        assert!(last.take().is_none());
    }

    #[test]
    fn test_status_tracks_listener_callbacks() {
        let status = ChannelStatus::new(ChannelId::new("c"));
        status.publish(ChannelSnapshot {
            life_cycle_state: LifeCycleState::SuiteStarted,
            run_id: Some(RunId(1)),
            suite_id: Some(SuiteId(2)),
            ..ChannelSnapshot::default()
        });

        status.on_testcase_started(TestcaseId(3));
        assert_eq!(
            status.snapshot().life_cycle_state,
            LifeCycleState::TestcaseStarted
        );

        status.on_testcase_finished(TestcaseId(3));
        let snap = status.snapshot();
        assert_eq!(snap.life_cycle_state, LifeCycleState::SuiteStarted);
        assert_eq!(snap.last_executed_testcase_id, Some(TestcaseId(3)));

        status.on_run_finished(RunId(1));
        assert_eq!(status.snapshot().run_id, None);
    }

    #[test]
    fn test_listener_set_fans_out() {
        #[derive(Default)]
        struct Counter(AtomicUsize);
        impl ProcessorListener for Counter {
            fn on_run_started(&self, _run_id: RunId) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let set = ListenerSet::new().with(a.clone()).with(b.clone());
        set.on_run_started(RunId(1));
        set.on_testcase_started(TestcaseId(1));

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 2);
    }
}
