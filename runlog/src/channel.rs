//! One producer channel: its queue, its worker and its clock offset.
//!
//! Producers never block on the database. [`Channel::submit`] enqueues and
//! returns; [`Channel::submit_and_await`] additionally waits, bounded by the
//! event's timeout class, until the worker has processed the event.
//!
//! The worker is started lazily on the first submission and, on non-main
//! channels, stops after LEAVE_TESTCASE. The next submission starts a new
//! worker that continues with the previous worker's processor.

use crate::bridge::{AwaitOutcome, ChannelStatus, LastError, ListenerSet, completion};
use crate::processor::EventProcessor;
use crate::queue::{ChannelQueue, Control, QueuedEvent};
use crate::worker::{Worker, WorkerContext, WorkerSlot};
use runlog_common::{
    ChannelId, ChannelSnapshot, Event, EventRecord, PipelineConfig, PipelineError, TestcaseId,
    TimeoutClass, WriteBackend, now_millis,
};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, error, info, warn};

pub struct Channel {
    id: ChannelId,
    queue: ChannelQueue,
    slot: Arc<Mutex<WorkerSlot>>,
    last_error: Arc<LastError>,
    status: Arc<ChannelStatus>,
    listeners: ListenerSet,
    backend: Arc<dyn WriteBackend>,
    config: Arc<PipelineConfig>,
    is_main: bool,
    offset: OnceLock<i64>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("is_main", &self.is_main)
            .field("pending_events", &self.queue.len())
            .field("offset", &self.offset.get())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(
        id: ChannelId,
        backend: Arc<dyn WriteBackend>,
        config: Arc<PipelineConfig>,
        listeners: ListenerSet,
    ) -> Self {
        let is_main = config.main_channel.as_ref() == Some(&id);
        let queue = ChannelQueue::new(id.clone(), config.queue_capacity)
            .with_monitoring(config.monitor_queue);
        Self {
            status: Arc::new(ChannelStatus::new(id.clone())),
            slot: Arc::new(Mutex::new(WorkerSlot::default())),
            last_error: Arc::new(LastError::default()),
            queue,
            listeners,
            backend,
            config,
            is_main,
            offset: OnceLock::new(),
            id,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    // ── Submission ──────────────────────────────────────────────────────────

    /// Enqueue an event produced by the calling thread and return immediately.
    pub fn submit(&self, event: Event) -> Result<(), PipelineError> {
        if let Event::DeleteTestcase { testcase_id } = event {
            return self.request_deletion(testcase_id);
        }
        self.submit_record(EventRecord::new(current_thread_name(), event))
    }

    /// Enqueue a record created elsewhere, e.g. relayed from a remote agent.
    pub fn submit_record(&self, mut record: EventRecord) -> Result<(), PipelineError> {
        if let Event::DeleteTestcase { testcase_id } = record.event {
            return self.request_deletion(testcase_id);
        }
        record.apply_time_offset(self.offset());
        self.queue.try_enqueue(QueuedEvent::new(record))?;
        self.ensure_worker()
    }

    /// Enqueue and wait until the worker has processed the event.
    ///
    /// A processing failure is returned to the caller. When the wait times out
    /// the event stays queued and [`AwaitOutcome::TimedOut`] is returned.
    pub fn submit_and_await(
        &self,
        event: Event,
        class: TimeoutClass,
    ) -> Result<AwaitOutcome, PipelineError> {
        self.submit_record_and_await(EventRecord::new(current_thread_name(), event), class)
    }

    pub fn submit_record_and_await(
        &self,
        mut record: EventRecord,
        class: TimeoutClass,
    ) -> Result<AwaitOutcome, PipelineError> {
        record.apply_time_offset(self.offset());
        let (done, waiter) = completion(self.id.clone(), record.kind());
        self.queue
            .try_enqueue(QueuedEvent::new(record).with_completion(done))?;
        self.ensure_worker()?;
        waiter.wait(self.config.timeout_for(class))
    }

    /// Delete a testcase ahead of anything already queued.
    pub fn request_deletion(&self, testcase_id: TestcaseId) -> Result<(), PipelineError> {
        debug!(channel = %self.id, %testcase_id, "testcase deletion requested");
        self.queue.send_control(Control::Delete(testcase_id));
        self.ensure_worker()
    }

    /// The most recent critical failure nobody waited for. Cleared on read.
    pub fn take_last_error(&self) -> Option<PipelineError> {
        self.last_error.take()
    }

    // ── Clock offset ────────────────────────────────────────────────────────

    /// Fix the clock offset from the sender's wall-clock time. Only the first
    /// handshake counts; later ones return the established offset.
    pub fn handshake(&self, sender_timestamp: i64) -> i64 {
        self.handshake_at(sender_timestamp, now_millis())
    }

    pub fn handshake_at(&self, sender_timestamp: i64, local_now: i64) -> i64 {
        *self.offset.get_or_init(|| {
            let offset = local_now - sender_timestamp;
            info!(channel = %self.id, offset_ms = offset, "clock offset established");
            offset
        })
    }

    /// Milliseconds added to every timestamp of this channel; 0 before the
    /// handshake.
    pub fn offset(&self) -> i64 {
        self.offset.get().copied().unwrap_or(0)
    }

    // ── State ───────────────────────────────────────────────────────────────

    /// Latest state published by the worker.
    pub fn state(&self) -> ChannelSnapshot {
        let mut snapshot = self.status.snapshot();
        snapshot.pending_events = self.queue.len();
        snapshot
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn is_worker_running(&self) -> bool {
        self.lock_slot().running
    }

    // ── Worker lifecycle ────────────────────────────────────────────────────

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, WorkerSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_processor(&self) -> EventProcessor {
        let listener = self.listeners.clone().with(self.status.clone());
        EventProcessor::new(self.id.clone(), self.backend.clone(), self.config.clone())
            .with_listener(Arc::new(listener))
    }

    fn ensure_worker(&self) -> Result<(), PipelineError> {
        let mut slot = self.lock_slot();
        if slot.closed {
            return Err(PipelineError::ChannelClosed {
                channel: self.id.clone(),
            });
        }
        if slot.running {
            return Ok(());
        }

        let processor = match slot.handle.take().map(|handle| handle.join()) {
            Some(Ok(processor)) => processor,
            Some(Err(_)) => {
                error!(channel = %self.id, "previous worker panicked; starting with fresh state");
                self.new_processor()
            }
            None => self.new_processor(),
        };

        let ctx = WorkerContext {
            channel: self.id.clone(),
            queue: self.queue.clone(),
            slot: self.slot.clone(),
            last_error: self.last_error.clone(),
            status: self.status.clone(),
            config: self.config.clone(),
            is_main: self.is_main,
        };
        match Worker::new(ctx, processor).spawn() {
            Ok(handle) => {
                debug!(channel = %self.id, "worker spawned");
                slot.handle = Some(handle);
                slot.running = true;
                Ok(())
            }
            Err(err) => {
                error!(channel = %self.id, error = %err, "failed to spawn worker");
                Err(PipelineError::ChannelClosed {
                    channel: self.id.clone(),
                })
            }
        }
    }

    /// Process what is queued, flush and stop the worker. Further submissions
    /// fail with [`PipelineError::ChannelClosed`].
    pub fn close(&self) {
        let handle = {
            let mut slot = self.lock_slot();
            if slot.closed {
                return;
            }
            slot.closed = true;
            if slot.running {
                self.queue.send_control(Control::Shutdown);
            }
            slot.running = false;
            slot.handle.take()
        };
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(channel = %self.id, "worker panicked before shutdown");
        }
        debug!(channel = %self.id, "channel closed");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn current_thread_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}
