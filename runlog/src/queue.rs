//! Bounded per-channel event queue.
//!
//! Enqueue never blocks: a full queue rejects the event with
//! [`PipelineError::CapacityExceeded`]. A second, unbounded control lane
//! carries out-of-band requests (testcase deletion, shutdown) that the worker
//! drains before the next regular event.

use crate::bridge::Completion;
use crossbeam::channel::{self, Receiver, Sender, TrySendError, select};
use runlog_common::{ChannelId, EventRecord, PipelineError, TestcaseId};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

const MONITOR_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// An event waiting for the worker, with the rendezvous of a waiting producer.
#[derive(Debug)]
pub struct QueuedEvent {
    pub record: EventRecord,
    pub completion: Option<Completion>,
}

impl QueuedEvent {
    pub fn new(record: EventRecord) -> Self {
        Self {
            record,
            completion: None,
        }
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }
}

/// Priority requests, served ahead of queued events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Delete(TestcaseId),
    /// Drain what is queued, flush and stop the worker.
    Shutdown,
}

/// How the worker waits for the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueMode {
    Blocking,
    /// Give up after the interval so an idle batch worker can flush.
    TimedPoll(Duration),
}

#[derive(Debug)]
pub enum Dequeued {
    Control(Control),
    Event(QueuedEvent),
    Idle,
}

#[derive(Debug)]
struct QueueMonitor {
    last_log: Option<Instant>,
    lowest_remaining: usize,
}

#[derive(Debug, Clone)]
pub struct ChannelQueue {
    channel: ChannelId,
    capacity: usize,
    tx: Sender<QueuedEvent>,
    rx: Receiver<QueuedEvent>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    monitor: Option<Arc<Mutex<QueueMonitor>>>,
}

impl ChannelQueue {
    pub fn new(channel: ChannelId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        let (control_tx, control_rx) = channel::unbounded();
        Self {
            channel,
            capacity,
            tx,
            rx,
            control_tx,
            control_rx,
            monitor: None,
        }
    }

    /// Log the remaining capacity, at most once per second.
    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = enabled.then(|| {
            Arc::new(Mutex::new(QueueMonitor {
                last_log: None,
                lowest_remaining: self.capacity,
            }))
        });
        self
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events accepted but not yet taken by the worker.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Non-blocking enqueue.
    pub fn try_enqueue(&self, event: QueuedEvent) -> Result<(), PipelineError> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.observe();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(PipelineError::CapacityExceeded {
                channel: self.channel.clone(),
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::ChannelClosed {
                channel: self.channel.clone(),
            }),
        }
    }

    pub fn send_control(&self, control: Control) {
        // The queue owns the receiver, so the lane cannot be disconnected.
        let _ = self.control_tx.send(control);
    }

    /// Control requests that arrived since the last call.
    pub fn take_controls(&self) -> Vec<Control> {
        self.control_rx.try_iter().collect()
    }

    /// Next control request or event, whichever is available; controls first.
    pub fn dequeue(&self, mode: DequeueMode) -> Dequeued {
        if let Ok(control) = self.control_rx.try_recv() {
            return Dequeued::Control(control);
        }
        match mode {
            DequeueMode::Blocking => select! {
                recv(self.control_rx) -> msg => msg.map_or(Dequeued::Idle, Dequeued::Control),
                recv(self.rx) -> msg => msg.map_or(Dequeued::Idle, Dequeued::Event),
            },
            DequeueMode::TimedPoll(timeout) => select! {
                recv(self.control_rx) -> msg => msg.map_or(Dequeued::Idle, Dequeued::Control),
                recv(self.rx) -> msg => msg.map_or(Dequeued::Idle, Dequeued::Event),
                default(timeout) => Dequeued::Idle,
            },
        }
    }

    /// Take a queued event without waiting.
    pub fn try_dequeue(&self) -> Option<QueuedEvent> {
        self.rx.try_recv().ok()
    }

    fn observe(&self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        let remaining = self.capacity.saturating_sub(self.tx.len());
        let mut monitor = monitor.lock().unwrap_or_else(|e| e.into_inner());
        monitor.lowest_remaining = monitor.lowest_remaining.min(remaining);
        let due = monitor
            .last_log
            .is_none_or(|at| at.elapsed() >= MONITOR_LOG_INTERVAL);
        if due {
            monitor.last_log = Some(Instant::now());
            info!(
                channel = %self.channel,
                remaining,
                lowest_remaining = monitor.lowest_remaining,
                capacity = self.capacity,
                "queue capacity"
            );
        }
    }
}
