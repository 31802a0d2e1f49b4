//! Per-testcase load-queue bookkeeping.
//!
//! Checkpoints and statistics are aggregated per load queue. The registry
//! remembers which queue each producer thread belongs to and which
//! checkpoints a thread currently has open, so END_CHECKPOINT can find the
//! row started by its matching START_CHECKPOINT.

use runlog_common::{CheckpointInfo, LoadQueueError, LoadQueueId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct LoadQueueRegistry {
    by_name: HashMap<String, LoadQueueId>,
    threads: HashMap<LoadQueueId, Vec<String>>,
    thread_queue: HashMap<String, LoadQueueId>,
    running: HashMap<String, Vec<CheckpointInfo>>,
}

impl LoadQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Remember a freshly started load queue.
    pub fn add(&mut self, name: &str, id: LoadQueueId) -> Result<(), LoadQueueError> {
        if self.is_running(name) {
            return Err(LoadQueueError::AlreadyStarted {
                name: name.to_string(),
            });
        }
        self.by_name.insert(name.to_string(), id);
        self.threads.insert(id, Vec::new());
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Result<LoadQueueId, LoadQueueError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| LoadQueueError::NoSuchLoadQueue {
                name: name.to_string(),
            })
    }

    /// Forget a load queue together with its threads and their open checkpoints.
    pub fn remove(&mut self, name: &str) -> Result<LoadQueueId, LoadQueueError> {
        let id = self
            .by_name
            .remove(name)
            .ok_or_else(|| LoadQueueError::NoSuchLoadQueue {
                name: name.to_string(),
            })?;
        for thread in self.threads.remove(&id).unwrap_or_default() {
            self.thread_queue.remove(&thread);
            self.running.remove(&thread);
        }
        Ok(id)
    }

    pub fn register_thread(&mut self, thread: &str, load_queue: &str) -> Result<(), LoadQueueError> {
        let id = self.id_of(load_queue)?;
        if let Some(existing) = self.thread_queue.get(thread) {
            if *existing == id {
                return Err(LoadQueueError::ThreadAlreadyRegistered {
                    thread: thread.to_string(),
                    load_queue: load_queue.to_string(),
                });
            }
            // A thread moving to another queue leaves the old one.
            if let Some(members) = self.threads.get_mut(existing) {
                members.retain(|t| t != thread);
            }
        }
        self.thread_queue.insert(thread.to_string(), id);
        self.threads.entry(id).or_default().push(thread.to_string());
        self.running.insert(thread.to_string(), Vec::new());
        Ok(())
    }

    pub fn queue_for_thread(&self, thread: &str) -> Result<LoadQueueId, LoadQueueError> {
        self.thread_queue
            .get(thread)
            .copied()
            .ok_or_else(|| LoadQueueError::ThreadNotRegistered {
                thread: thread.to_string(),
            })
    }

    pub fn start_checkpoint(&mut self, thread: &str, info: CheckpointInfo) -> Result<(), LoadQueueError> {
        let running = self
            .running
            .get_mut(thread)
            .ok_or_else(|| LoadQueueError::ThreadNotRegistered {
                thread: thread.to_string(),
            })?;
        if running.iter().any(|c| c.name == info.name) {
            return Err(LoadQueueError::CheckpointAlreadyStarted {
                name: info.name,
                thread: thread.to_string(),
            });
        }
        running.push(info);
        Ok(())
    }

    /// Take the open checkpoint `name` of `thread`.
    pub fn end_checkpoint(&mut self, thread: &str, name: &str) -> Result<CheckpointInfo, LoadQueueError> {
        let running = self
            .running
            .get_mut(thread)
            .ok_or_else(|| LoadQueueError::ThreadNotRegistered {
                thread: thread.to_string(),
            })?;
        let pos = running.iter().position(|c| c.name == name).ok_or_else(|| {
            LoadQueueError::CheckpointNotStarted {
                name: name.to_string(),
                thread: thread.to_string(),
            }
        })?;
        Ok(running.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.threads.clear();
        self.thread_queue.clear();
        self.running.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlog_common::CheckpointId;

    fn info(name: &str, queue: LoadQueueId) -> CheckpointInfo {
        CheckpointInfo {
            checkpoint_id: CheckpointId(7),
            name: name.to_string(),
            load_queue_id: queue,
            start_timestamp: 10,
        }
    }

    #[test]
    fn test_duplicate_load_queue_rejected() {
        let mut registry = LoadQueueRegistry::new();
        registry.add("login", LoadQueueId(1)).unwrap();
        let err = registry.add("login", LoadQueueId(2)).unwrap_err();
        assert_eq!(
            err,
            LoadQueueError::AlreadyStarted {
                name: "login".into()
            }
        );
    }

    #[test]
    fn test_thread_routes_to_its_queue() {
        let mut registry = LoadQueueRegistry::new();
        registry.add("login", LoadQueueId(1)).unwrap();
        registry.add("search", LoadQueueId(2)).unwrap();
        registry.register_thread("vu-1", "search").unwrap();

        assert_eq!(registry.queue_for_thread("vu-1").unwrap(), LoadQueueId(2));
        assert!(matches!(
            registry.queue_for_thread("vu-2"),
            Err(LoadQueueError::ThreadNotRegistered { .. })
        ));
        assert!(matches!(
            registry.register_thread("vu-1", "search"),
            Err(LoadQueueError::ThreadAlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_register_unknown_queue_fails() {
        let mut registry = LoadQueueRegistry::new();
        assert_eq!(
            registry.register_thread("vu-1", "nope").unwrap_err(),
            LoadQueueError::NoSuchLoadQueue {
                name: "nope".into()
            }
        );
    }

    #[test]
    fn test_checkpoint_start_end_pairs() {
        let mut registry = LoadQueueRegistry::new();
        registry.add("login", LoadQueueId(1)).unwrap();
        registry.register_thread("vu-1", "login").unwrap();

        registry.start_checkpoint("vu-1", info("open", LoadQueueId(1))).unwrap();
        assert!(matches!(
            registry.start_checkpoint("vu-1", info("open", LoadQueueId(1))),
            Err(LoadQueueError::CheckpointAlreadyStarted { .. })
        ));

        let ended = registry.end_checkpoint("vu-1", "open").unwrap();
        assert_eq!(ended.name, "open");
        assert!(matches!(
            registry.end_checkpoint("vu-1", "open"),
            Err(LoadQueueError::CheckpointNotStarted { .. })
        ));
    }

    #[test]
    fn test_reregistering_clears_running_checkpoints() {
        let mut registry = LoadQueueRegistry::new();
        registry.add("a", LoadQueueId(1)).unwrap();
        registry.add("b", LoadQueueId(2)).unwrap();
        registry.register_thread("vu-1", "a").unwrap();
        registry.start_checkpoint("vu-1", info("open", LoadQueueId(1))).unwrap();

        registry.register_thread("vu-1", "b").unwrap();
        assert!(registry.end_checkpoint("vu-1", "open").is_err());
        assert_eq!(registry.queue_for_thread("vu-1").unwrap(), LoadQueueId(2));
    }

    #[test]
    fn test_remove_drops_threads() {
        let mut registry = LoadQueueRegistry::new();
        registry.add("login", LoadQueueId(1)).unwrap();
        registry.register_thread("vu-1", "login").unwrap();

        assert_eq!(registry.remove("login").unwrap(), LoadQueueId(1));
        assert!(registry.queue_for_thread("vu-1").is_err());
        assert!(registry.is_empty());
    }
}
