//! Channel registry: the entry point producers talk to.

use crate::bridge::{AwaitOutcome, ListenerSet, ProcessorListener};
use crate::channel::Channel;
use runlog_common::{
    ChannelId, ChannelSnapshot, Event, PipelineConfig, PipelineError, TestcaseId, TimeoutClass,
    WriteBackend,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Routes events to per-channel queues, creating channels on first use.
pub struct EventPipeline {
    backend: Arc<dyn WriteBackend>,
    config: Arc<PipelineConfig>,
    listeners: ListenerSet,
    channels: Mutex<HashMap<ChannelId, Arc<Channel>>>,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("config", &self.config)
            .field("listeners", &self.listeners)
            .field("channels", &self.channel_ids())
            .finish_non_exhaustive()
    }
}

impl EventPipeline {
    pub fn new(backend: Arc<dyn WriteBackend>, config: PipelineConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            listeners: ListenerSet::new(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Notify `listener` of life-cycle changes on every channel created
    /// afterwards.
    pub fn with_listener(mut self, listener: Arc<dyn ProcessorListener>) -> Self {
        self.listeners = std::mem::take(&mut self.listeners).with(listener);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The channel `id`, created on first use.
    pub fn channel(&self, id: &ChannelId) -> Arc<Channel> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(id.clone())
            .or_insert_with(|| {
                info!(channel = %id, "channel created");
                Arc::new(Channel::new(
                    id.clone(),
                    self.backend.clone(),
                    self.config.clone(),
                    self.listeners.clone(),
                ))
            })
            .clone()
    }

    pub fn submit(&self, channel: &ChannelId, event: Event) -> Result<(), PipelineError> {
        self.channel(channel).submit(event)
    }

    pub fn submit_and_await(
        &self,
        channel: &ChannelId,
        event: Event,
        class: TimeoutClass,
    ) -> Result<AwaitOutcome, PipelineError> {
        self.channel(channel).submit_and_await(event, class)
    }

    pub fn request_deletion(
        &self,
        channel: &ChannelId,
        testcase_id: TestcaseId,
    ) -> Result<(), PipelineError> {
        self.channel(channel).request_deletion(testcase_id)
    }

    /// Latest published state, or `None` for a channel never used.
    pub fn channel_state(&self, channel: &ChannelId) -> Option<ChannelSnapshot> {
        self.existing(channel).map(|c| c.state())
    }

    pub fn take_last_error(&self, channel: &ChannelId) -> Option<PipelineError> {
        self.existing(channel).and_then(|c| c.take_last_error())
    }

    pub fn handshake(&self, channel: &ChannelId, sender_timestamp: i64) -> i64 {
        self.channel(channel).handshake(sender_timestamp)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<ChannelId> = channels.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Drain and stop every channel. Channels created afterwards work normally.
    pub fn close(&self) {
        let drained: Vec<Arc<Channel>> = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.drain().map(|(_, channel)| channel).collect()
        };
        let count = drained.len();
        for channel in drained {
            channel.close();
        }
        info!(channels = count, "pipeline closed");
    }

    fn existing(&self, channel: &ChannelId) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .cloned()
    }
}

impl Drop for EventPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlog_common::events::StartRun;
    use runlog_common::{LifeCycleState, RunId};
    use runlog_store::MemoryBackend;

    #[derive(Default)]
    struct RunCounter {
        started: Mutex<Vec<RunId>>,
    }

    impl ProcessorListener for RunCounter {
        fn on_run_started(&self, run_id: RunId) {
            self.started.lock().unwrap().push(run_id);
        }
    }

    #[test]
    fn test_channels_are_independent() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = Arc::new(RunCounter::default());
        let pipeline = EventPipeline::new(backend, PipelineConfig::default())
            .with_listener(counter.clone());
        let a = ChannelId::new("a");
        let b = ChannelId::new("b");

        for id in [&a, &b] {
            pipeline
                .submit_and_await(
                    id,
                    Event::StartRun(StartRun {
                        run_name: id.to_string(),
                        ..StartRun::default()
                    }),
                    TimeoutClass::Long,
                )
                .unwrap();
        }

        let state_a = pipeline.channel_state(&a).unwrap();
        let state_b = pipeline.channel_state(&b).unwrap();
        assert_eq!(state_a.life_cycle_state, LifeCycleState::RunStarted);
        assert_ne!(state_a.run_id, state_b.run_id);
        assert_eq!(counter.started.lock().unwrap().len(), 2);
        assert_eq!(pipeline.channel_ids(), vec![a, b]);
    }

    #[test]
    fn test_unknown_channel_has_no_state() {
        let pipeline = EventPipeline::new(Arc::new(MemoryBackend::new()), PipelineConfig::default());
        let id = ChannelId::new("ghost");
        assert!(pipeline.channel_state(&id).is_none());
        assert!(pipeline.take_last_error(&id).is_none());
        assert!(pipeline.channel_ids().is_empty());
    }

    #[test]
    fn test_close_empties_registry() {
        let pipeline = EventPipeline::new(Arc::new(MemoryBackend::new()), PipelineConfig::default());
        let id = ChannelId::new("a");
        pipeline.submit(&id, Event::EndRun).unwrap();
        pipeline.close();
        assert!(pipeline.channel_ids().is_empty());
    }
}
