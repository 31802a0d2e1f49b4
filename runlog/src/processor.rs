//! Per-channel event processor.
//!
//! Owns the life-cycle state machine of one channel. Only the channel's worker
//! thread calls into it, so nothing here is locked. Each event is checked
//! against the current [`LifeCycleState`], dispatched to the durable-write
//! backend, and the state is stepped accordingly. END events release their
//! scope on every path so a failed write cannot wedge the parent scope.
//!
//! Integrity failures are re-checked against the backend: if the targeted
//! entity is gone it was deleted by someone else, so it is remembered and
//! every later event for it is dropped without touching the backend.

use crate::bridge::{ListenerSet, ProcessorListener};
use crate::load_queues::LoadQueueRegistry;
use runlog_common::events::{
    EndCheckpoint, EndLoadQueue, InsertCheckpoint, InsertMessage, JoinTestcase, Metainfo,
    RegisterThread, StartCheckpoint, StartLoadQueue, StartRun, StartSuite, StartTestcase,
    StatisticSample, TestcaseMetainfo, UpdateRun, UpdateSuite, UpdateTestcase,
};
use runlog_common::{
    BackendError, ChannelId, ChannelSnapshot, Event, EventKind, EventOutcome, EventRecord,
    Expectation, LifeCycleState, LoadQueueError, MessageRecord, MessageTarget, PipelineConfig,
    PipelineError, RunId, SuiteId, TestcaseId, TestcaseResult, WriteBackend,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

// ── Suite-id cache ──────────────────────────────────────────────────────────

/// Suites opened in a run, by name, so re-entering a suite reuses its row.
#[derive(Debug, Clone, Default)]
pub struct SuiteIdCache {
    ids: HashMap<(RunId, String), SuiteId>,
}

impl SuiteIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: RunId, suite_name: &str) -> Option<SuiteId> {
        self.ids.get(&(run_id, suite_name.to_string())).copied()
    }

    pub fn insert(&mut self, run_id: RunId, suite_name: &str, suite_id: SuiteId) {
        self.ids.insert((run_id, suite_name.to_string()), suite_id);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ── Deleted entities ────────────────────────────────────────────────────────

/// A stored entity an event writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Run(RunId),
    Suite(SuiteId),
    Testcase(TestcaseId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(id) => write!(f, "run {id}"),
            Self::Suite(id) => write!(f, "suite {id}"),
            Self::Testcase(id) => write!(f, "testcase {id}"),
        }
    }
}

impl From<MessageTarget> for Entity {
    fn from(target: MessageTarget) -> Self {
        match target {
            MessageTarget::Run(id) => Self::Run(id),
            MessageTarget::Suite(id) => Self::Suite(id),
            MessageTarget::Testcase(id) => Self::Testcase(id),
        }
    }
}

/// Entities known to be removed by an external actor. Membership is permanent.
#[derive(Debug, Clone, Default)]
pub struct DeletedEntities {
    entities: HashSet<Entity>,
}

impl DeletedEntities {
    pub fn insert(&mut self, entity: Entity) -> bool {
        self.entities.insert(entity)
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.entities.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// ── After modes ─────────────────────────────────────────────────────────────

/// Teardown phases announced by the producer. Each one is toggled on its own
/// and redirects messages to the scope that just finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AfterModes {
    /// Messages go to the run.
    pub suite: bool,
    /// Messages go to the last ended suite.
    pub class: bool,
    /// Messages and testcase metainfo go to the last executed testcase.
    pub method: bool,
}

// ── Processor ───────────────────────────────────────────────────────────────

pub struct EventProcessor {
    channel: ChannelId,
    backend: Arc<dyn WriteBackend>,
    config: Arc<PipelineConfig>,
    listener: Arc<dyn ProcessorListener>,

    state: LifeCycleState,
    run_id: Option<RunId>,
    previous_run_id: Option<RunId>,
    suite_id: Option<SuiteId>,
    testcase_id: Option<TestcaseId>,
    last_executed_testcase_id: Option<TestcaseId>,
    last_ended_suite_id: Option<SuiteId>,
    after: AfterModes,

    deleted: DeletedEntities,
    load_queues: LoadQueueRegistry,
    suite_cache: SuiteIdCache,
    pending_update_run: Option<EventRecord>,
    pending_update_suite: Option<EventRecord>,
    /// Latest UPDATE_RUN from the producer, applied again whenever a run starts.
    user_update_run: Option<UpdateRun>,
}

impl fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProcessor")
            .field("channel", &self.channel)
            .field("state", &self.state)
            .field("run_id", &self.run_id)
            .field("suite_id", &self.suite_id)
            .field("testcase_id", &self.testcase_id)
            .field("deleted", &self.deleted.len())
            .finish_non_exhaustive()
    }
}

fn backend_failure(kind: EventKind) -> impl FnOnce(BackendError) -> PipelineError {
    move |source| PipelineError::backend(kind, source)
}

fn is_integrity(err: &PipelineError) -> bool {
    matches!(err, PipelineError::Backend { source, .. } if source.is_integrity())
}

impl EventProcessor {
    pub fn new(
        channel: ChannelId,
        backend: Arc<dyn WriteBackend>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            channel,
            backend,
            config,
            listener: Arc::new(ListenerSet::new()),
            state: LifeCycleState::Initialized,
            run_id: None,
            previous_run_id: None,
            suite_id: None,
            testcase_id: None,
            last_executed_testcase_id: None,
            last_ended_suite_id: None,
            after: AfterModes::default(),
            deleted: DeletedEntities::default(),
            load_queues: LoadQueueRegistry::new(),
            suite_cache: SuiteIdCache::new(),
            pending_update_run: None,
            pending_update_suite: None,
            user_update_run: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProcessorListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Start from a pre-populated suite cache instead of an empty one.
    pub fn with_suite_cache(mut self, cache: SuiteIdCache) -> Self {
        self.suite_cache = cache;
        self
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn state(&self) -> LifeCycleState {
        self.state
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    pub fn previous_run_id(&self) -> Option<RunId> {
        self.previous_run_id
    }

    pub fn suite_id(&self) -> Option<SuiteId> {
        self.suite_id
    }

    pub fn testcase_id(&self) -> Option<TestcaseId> {
        self.testcase_id
    }

    pub fn last_executed_testcase_id(&self) -> Option<TestcaseId> {
        self.last_executed_testcase_id
    }

    pub fn last_ended_suite_id(&self) -> Option<SuiteId> {
        self.last_ended_suite_id
    }

    pub fn after_modes(&self) -> AfterModes {
        self.after
    }

    pub fn suite_cache(&self) -> &SuiteIdCache {
        &self.suite_cache
    }

    pub fn is_deleted(&self, entity: Entity) -> bool {
        self.deleted.contains(entity)
    }

    pub fn outcome(&self) -> EventOutcome {
        EventOutcome {
            run_id: self.run_id,
            suite_id: self.suite_id,
            testcase_id: self.testcase_id,
        }
    }

    /// The processor's view; the queue depth is filled in by the caller.
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            life_cycle_state: self.state,
            run_id: self.run_id,
            suite_id: self.suite_id,
            testcase_id: self.testcase_id,
            last_executed_testcase_id: self.last_executed_testcase_id,
            pending_events: 0,
        }
    }

    /// Commit whatever the backend holds in its batch cache.
    pub fn flush(&self) -> Result<(), BackendError> {
        self.backend.flush_cache()
    }

    /// Delete a testcase on request and drop every later event for it.
    pub fn delete_testcase(&mut self, testcase_id: TestcaseId) -> Result<(), PipelineError> {
        let entity = Entity::Testcase(testcase_id);
        if self.deleted.contains(entity) {
            return Ok(());
        }
        let result = self
            .backend
            .delete_testcase(testcase_id)
            .map_err(backend_failure(EventKind::DeleteTestcase));
        // Remembered even when the delete failed: the producer no longer wants it.
        self.deleted.insert(entity);
        info!(channel = %self.channel, %testcase_id, "testcase deleted on request");
        result
    }

    /// Process one event and return the channel ids afterwards.
    pub fn process(&mut self, record: EventRecord) -> Result<EventOutcome, PipelineError> {
        let kind = record.kind();

        let target = self.write_target(&record.event);
        if let Some(entity) = target
            && !releases_scope(kind)
            && !is_start(kind)
            && self.is_dropped(entity)
        {
            trace!(channel = %self.channel, event = %kind, %entity, "dropping event for deleted entity");
            return Ok(self.outcome());
        }

        let expectation = kind.expectation();
        if !expectation.is_met_by(self.state) {
            if kind.is_deferrable() {
                self.defer(record);
                return Ok(self.outcome());
            }
            return Err(PipelineError::StateViolation {
                event: kind,
                state: self.state,
                expected: expectation,
            });
        }

        if self.config.batch_mode
            && !kind.is_cacheable()
            && self.state == LifeCycleState::TestcaseStarted
        {
            self.backend.flush_cache().map_err(backend_failure(kind))?;
        }

        match self.dispatch(&record) {
            Ok(()) => {}
            Err(err) if is_integrity(&err) => match target.or_else(|| self.parent_of(kind)) {
                Some(entity) => self.recover(kind, entity, err)?,
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }

        match kind {
            EventKind::StartRun if self.pending_update_run.is_some() => {
                self.replay_pending(EventKind::UpdateRun)
            }
            EventKind::StartRun => self.reapply_user_update_run(),
            EventKind::StartSuite => self.replay_pending(EventKind::UpdateSuite),
            _ => {}
        }

        Ok(self.outcome())
    }

    // ── Routing ─────────────────────────────────────────────────────────────

    /// The entity an event writes into, if it writes into an existing one.
    fn write_target(&self, event: &Event) -> Option<Entity> {
        match event {
            Event::EndRun | Event::UpdateRun(_) | Event::AddRunMetainfo(_) => {
                self.run_id.map(Entity::Run)
            }
            Event::EndSuite | Event::UpdateSuite(_) => self.suite_id.map(Entity::Suite),
            Event::EndTestcase { .. }
            | Event::AddScenarioMetainfo(_)
            | Event::ClearScenarioMetainfo
            | Event::StartLoadQueue(_)
            | Event::EndLoadQueue(_)
            | Event::StartCheckpoint(_)
            | Event::EndCheckpoint(_)
            | Event::InsertCheckpoint(_)
            | Event::InsertSystemStat(_)
            | Event::InsertUserActivityStat(_) => self.testcase_id.map(Entity::Testcase),
            Event::UpdateTestcase(_) => self
                .testcase_id
                .or(self.last_executed_testcase_id)
                .map(Entity::Testcase),
            Event::AddTestcaseMetainfo(meta) => self.metainfo_testcase(meta).map(Entity::Testcase),
            Event::InsertMessage(msg) => self.message_target(msg).map(Entity::from),
            Event::StartAfterSuite
            | Event::EndAfterSuite
            | Event::StartAfterClass
            | Event::EndAfterClass
            | Event::StartAfterMethod
            | Event::EndAfterMethod
            | Event::StartRun(_)
            | Event::StartSuite(_)
            | Event::StartTestcase(_)
            | Event::JoinTestcase(_)
            | Event::LeaveTestcase
            | Event::DeleteTestcase { .. }
            | Event::RegisterThreadWithLoadQueue(_) => None,
        }
    }

    /// Parent whose disappearance explains an integrity failure of a START event.
    fn parent_of(&self, kind: EventKind) -> Option<Entity> {
        match kind {
            EventKind::StartSuite => self.run_id.map(Entity::Run),
            EventKind::StartTestcase => self.suite_id.map(Entity::Suite),
            _ => None,
        }
    }

    /// Whether the entity, or a scope of the channel above it, is deleted.
    fn is_dropped(&self, entity: Entity) -> bool {
        let run_gone = self
            .run_id
            .is_some_and(|id| self.deleted.contains(Entity::Run(id)));
        let suite_gone = self
            .suite_id
            .is_some_and(|id| self.deleted.contains(Entity::Suite(id)));
        self.deleted.contains(entity)
            || match entity {
                Entity::Run(_) => false,
                Entity::Suite(_) => run_gone,
                Entity::Testcase(_) => run_gone || suite_gone,
            }
    }

    fn message_target(&self, msg: &InsertMessage) -> Option<MessageTarget> {
        let after = self.after;
        let run_level = msg.run_message
            || after.suite
            || (self.state == LifeCycleState::RunStarted && !after.class);
        if run_level {
            return self
                .run_id
                .filter(|_| self.config.log_run_and_suite_messages)
                .map(MessageTarget::Run);
        }
        if after.method {
            return self.last_executed_testcase_id.map(MessageTarget::Testcase);
        }
        if self.state == LifeCycleState::TestcaseStarted {
            return self.testcase_id.map(MessageTarget::Testcase);
        }
        let suite_id = if after.class {
            self.last_ended_suite_id
        } else if self.state == LifeCycleState::SuiteStarted {
            self.suite_id
        } else {
            None
        };
        suite_id
            .filter(|_| self.config.log_run_and_suite_messages)
            .map(MessageTarget::Suite)
    }

    /// Explicit id first; inside an after-method phase the last executed
    /// testcase, otherwise the open one.
    fn metainfo_testcase(&self, meta: &TestcaseMetainfo) -> Option<TestcaseId> {
        meta.testcase_id.or_else(|| {
            if self.after.method {
                self.last_executed_testcase_id
            } else {
                self.testcase_id.or(self.last_executed_testcase_id)
            }
        })
    }

    fn commit_for(&self, kind: EventKind) -> bool {
        !(self.config.batch_mode && kind.is_cacheable())
    }

    // ── Deferral and recovery ───────────────────────────────────────────────

    fn defer(&mut self, record: EventRecord) {
        let kind = record.kind();
        debug!(channel = %self.channel, event = %kind, state = %self.state, "deferring update until its scope starts");
        if let Event::UpdateRun(update) = &record.event {
            self.user_update_run = Some(update.clone());
        }
        let slot = match kind {
            EventKind::UpdateRun => &mut self.pending_update_run,
            _ => &mut self.pending_update_suite,
        };
        if slot.replace(record).is_some() {
            debug!(channel = %self.channel, event = %kind, "replaced an earlier deferred update");
        }
    }

    fn replay_pending(&mut self, kind: EventKind) {
        let pending = match kind {
            EventKind::UpdateRun => self.pending_update_run.take(),
            _ => self.pending_update_suite.take(),
        };
        if let Some(record) = pending {
            debug!(channel = %self.channel, event = %kind, "replaying deferred update");
            if let Err(err) = self.process(record) {
                warn!(channel = %self.channel, event = %kind, error = %err, "deferred update failed");
            }
        }
    }

    fn reapply_user_update_run(&mut self) {
        let (Some(run_id), Some(update)) = (self.run_id, self.user_update_run.as_ref()) else {
            return;
        };
        debug!(channel = %self.channel, %run_id, "re-applying the latest run update");
        if let Err(err) = self.backend.update_run(run_id, update, true) {
            warn!(channel = %self.channel, %run_id, error = %err, "run update after start failed");
        }
    }

    fn recover(
        &mut self,
        kind: EventKind,
        entity: Entity,
        err: PipelineError,
    ) -> Result<(), PipelineError> {
        let present = match entity {
            Entity::Run(id) => self.backend.is_run_present(id),
            Entity::Suite(id) => self.backend.is_suite_present(id),
            Entity::Testcase(id) => self.backend.is_testcase_present(id),
        };
        match present {
            Ok(false) => {
                warn!(
                    channel = %self.channel,
                    %entity,
                    "{entity} appears to be deleted from the database; no additional data will be recorded for it"
                );
                self.deleted.insert(entity);
                if let Entity::Run(run_id) = entity {
                    self.listener.on_run_finished(run_id);
                }
                // A broken hierarchy root still has to reach the producer.
                if is_start(kind) { Err(err) } else { Ok(()) }
            }
            Ok(true) => {
                error!(channel = %self.channel, %entity, error = %err, "{entity} exists but the write failed");
                Err(err)
            }
            Err(check) => {
                debug!(channel = %self.channel, %entity, error = %check, "presence check failed");
                Err(err)
            }
        }
    }

    fn scope_violation(&self, kind: EventKind, expected: Expectation) -> PipelineError {
        PipelineError::StateViolation {
            event: kind,
            state: self.state,
            expected,
        }
    }

    fn current_run(&self, kind: EventKind) -> Result<RunId, PipelineError> {
        self.run_id.ok_or_else(|| {
            self.scope_violation(kind, Expectation::AtLeast(LifeCycleState::RunStarted))
        })
    }

    fn current_suite(&self, kind: EventKind) -> Result<SuiteId, PipelineError> {
        self.suite_id.ok_or_else(|| {
            self.scope_violation(kind, Expectation::AtLeast(LifeCycleState::SuiteStarted))
        })
    }

    fn current_testcase(&self, kind: EventKind) -> Result<TestcaseId, PipelineError> {
        self.testcase_id.ok_or_else(|| {
            self.scope_violation(kind, Expectation::Exactly(LifeCycleState::TestcaseStarted))
        })
    }

    // ── Dispatch ────────────────────────────────────────────────────────────

    fn dispatch(&mut self, record: &EventRecord) -> Result<(), PipelineError> {
        let ts = record.timestamp;
        match &record.event {
            Event::StartRun(run) => self.start_run(run, ts),
            Event::EndRun => self.end_run(ts),
            Event::UpdateRun(update) => self.update_run(update),
            Event::StartAfterSuite | Event::EndAfterSuite => {
                self.after.suite = record.event == Event::StartAfterSuite;
                Ok(())
            }
            Event::StartAfterClass | Event::EndAfterClass => {
                self.after.class = record.event == Event::StartAfterClass;
                Ok(())
            }
            Event::StartAfterMethod | Event::EndAfterMethod => {
                self.after.method = record.event == Event::StartAfterMethod;
                Ok(())
            }
            Event::AddRunMetainfo(meta) => self.add_run_metainfo(meta),
            Event::StartSuite(suite) => self.start_suite(suite, ts),
            Event::EndSuite => self.end_suite(ts),
            Event::UpdateSuite(update) => self.update_suite(update),
            Event::StartTestcase(testcase) => self.start_testcase(testcase, ts),
            Event::EndTestcase { result } => self.end_testcase(*result, ts),
            Event::JoinTestcase(join) => {
                self.join_testcase(join);
                Ok(())
            }
            Event::LeaveTestcase => {
                self.leave_testcase();
                Ok(())
            }
            Event::UpdateTestcase(update) => self.update_testcase(update, ts),
            Event::DeleteTestcase { testcase_id } => self.delete_testcase(*testcase_id),
            Event::AddScenarioMetainfo(meta) => self.add_scenario_metainfo(meta),
            Event::ClearScenarioMetainfo => self.clear_scenario_metainfo(),
            Event::AddTestcaseMetainfo(meta) => self.add_testcase_metainfo(meta),
            Event::StartLoadQueue(load_queue) => self.start_load_queue(load_queue, ts),
            Event::EndLoadQueue(end) => self.end_load_queue(end, ts),
            Event::RegisterThreadWithLoadQueue(register) => self.register_thread(register),
            Event::StartCheckpoint(checkpoint) => self.start_checkpoint(checkpoint),
            Event::EndCheckpoint(checkpoint) => self.end_checkpoint(checkpoint),
            Event::InsertCheckpoint(checkpoint) => self.insert_checkpoint(checkpoint),
            Event::InsertSystemStat(sample) => self.insert_statistics(EventKind::InsertSystemStat, sample),
            Event::InsertUserActivityStat(sample) => {
                self.insert_statistics(EventKind::InsertUserActivityStat, sample)
            }
            Event::InsertMessage(msg) => self.insert_message(msg, &record.thread_name, ts),
        }
    }

    // ── Runs ────────────────────────────────────────────────────────────────

    fn start_run(&mut self, run: &StartRun, ts: i64) -> Result<(), PipelineError> {
        let fail = backend_failure(EventKind::StartRun);
        self.suite_cache.clear();

        let rejoined = match self.previous_run_id {
            Some(previous) => self.rejoin_run(previous, run)?,
            None => None,
        };
        let run_id = match rejoined {
            Some(run_id) => run_id,
            None => {
                self.backend
                    .sanity_check()
                    .map_err(backend_failure(EventKind::StartRun))?;
                let run_id = self.backend.start_run(run, ts, true).map_err(fail)?;
                info!(channel = %self.channel, %run_id, run_name = %run.run_name, "started a new run");
                run_id
            }
        };

        self.run_id = Some(run_id);
        self.state = LifeCycleState::RunStarted;
        self.listener.on_run_started(run_id);
        Ok(())
    }

    /// Rename the channel's previous run and continue in it. `None` when that
    /// run has been deleted from the database meanwhile.
    fn rejoin_run(&mut self, previous: RunId, run: &StartRun) -> Result<Option<RunId>, PipelineError> {
        let err = match self
            .backend
            .update_run(previous, &UpdateRun::rename(&run.run_name), true)
        {
            Ok(()) => {
                info!(channel = %self.channel, run_id = %previous, run_name = %run.run_name, "joined an existing run");
                return Ok(Some(previous));
            }
            Err(err) if err.is_integrity() => err,
            Err(err) => return Err(PipelineError::backend(EventKind::StartRun, err)),
        };
        match self.backend.is_run_present(previous) {
            Ok(false) => {
                warn!(
                    channel = %self.channel,
                    run_id = %previous,
                    "previous run appears to be deleted from the database; starting a new run"
                );
                self.deleted.insert(Entity::Run(previous));
                self.previous_run_id = None;
                Ok(None)
            }
            _ => Err(PipelineError::backend(EventKind::StartRun, err)),
        }
    }

    fn end_run(&mut self, ts: i64) -> Result<(), PipelineError> {
        let run_id = self.current_run(EventKind::EndRun)?;
        let deleted = self.deleted.contains(Entity::Run(run_id));
        let result = if deleted {
            Ok(())
        } else {
            self.backend
                .end_run(run_id, ts, true)
                .map_err(backend_failure(EventKind::EndRun))
        };

        if !deleted {
            self.previous_run_id = Some(run_id);
        }
        self.run_id = None;
        self.suite_id = None;
        self.state = LifeCycleState::Initialized;
        self.listener.on_run_finished(run_id);
        result
    }

    fn update_run(&mut self, update: &UpdateRun) -> Result<(), PipelineError> {
        let run_id = self.current_run(EventKind::UpdateRun)?;
        self.user_update_run = Some(update.clone());
        self.backend
            .update_run(run_id, update, true)
            .map_err(backend_failure(EventKind::UpdateRun))
    }

    fn add_run_metainfo(&mut self, meta: &Metainfo) -> Result<(), PipelineError> {
        let run_id = self.current_run(EventKind::AddRunMetainfo)?;
        self.backend
            .add_run_metainfo(run_id, &meta.key, &meta.value, true)
            .map_err(backend_failure(EventKind::AddRunMetainfo))
    }

    // ── Suites ──────────────────────────────────────────────────────────────

    fn start_suite(&mut self, suite: &StartSuite, ts: i64) -> Result<(), PipelineError> {
        let run_id = self.current_run(EventKind::StartSuite)?;
        let suite_id = match self.suite_cache.get(run_id, &suite.suite_name) {
            Some(cached) => {
                debug!(channel = %self.channel, suite_id = %cached, suite_name = %suite.suite_name, "re-entering cached suite");
                cached
            }
            None => {
                let suite_id = self
                    .backend
                    .start_suite(&suite.package_name, &suite.suite_name, ts, run_id, true)
                    .map_err(backend_failure(EventKind::StartSuite))?;
                self.suite_cache.insert(run_id, &suite.suite_name, suite_id);
                suite_id
            }
        };
        self.suite_id = Some(suite_id);
        self.state = LifeCycleState::SuiteStarted;
        Ok(())
    }

    fn end_suite(&mut self, ts: i64) -> Result<(), PipelineError> {
        let suite_id = self.current_suite(EventKind::EndSuite)?;
        let result = if self.is_dropped(Entity::Suite(suite_id)) {
            Ok(())
        } else {
            self.backend
                .end_suite(suite_id, ts, true)
                .map_err(backend_failure(EventKind::EndSuite))
        };
        if result.is_ok() {
            self.last_ended_suite_id = Some(suite_id);
        }
        self.suite_id = None;
        self.state = LifeCycleState::RunStarted;
        result
    }

    fn update_suite(&mut self, update: &UpdateSuite) -> Result<(), PipelineError> {
        let run_id = self.current_run(EventKind::UpdateSuite)?;
        let suite_id = self.current_suite(EventKind::UpdateSuite)?;
        let result = self
            .backend
            .update_suite(
                suite_id,
                update.suite_name.as_deref(),
                update.user_note.as_deref(),
                true,
            )
            .map_err(backend_failure(EventKind::UpdateSuite));
        if let Some(name) = update.suite_name.as_deref().filter(|n| !n.is_empty()) {
            self.suite_cache.insert(run_id, name, suite_id);
        }
        result
    }

    // ── Testcases ───────────────────────────────────────────────────────────

    fn start_testcase(&mut self, testcase: &StartTestcase, ts: i64) -> Result<(), PipelineError> {
        let run_id = self.current_run(EventKind::StartTestcase)?;
        let current = self.current_suite(EventKind::StartTestcase)?;
        let suite_id = testcase
            .suite_simple_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .and_then(|name| self.suite_cache.get(run_id, name))
            .unwrap_or(current);

        let testcase_id = self
            .backend
            .start_testcase(testcase, suite_id, ts, true)
            .map_err(backend_failure(EventKind::StartTestcase))?;

        self.testcase_id = Some(testcase_id);
        self.state = LifeCycleState::TestcaseStarted;
        self.listener.on_testcase_started(testcase_id);
        Ok(())
    }

    fn end_testcase(&mut self, result: TestcaseResult, ts: i64) -> Result<(), PipelineError> {
        let testcase_id = self.current_testcase(EventKind::EndTestcase)?;
        let outcome = if self.is_dropped(Entity::Testcase(testcase_id)) {
            Ok(())
        } else {
            self.backend
                .end_testcase(testcase_id, result, ts, true)
                .map_err(backend_failure(EventKind::EndTestcase))
        };

        self.state = LifeCycleState::SuiteStarted;
        self.last_executed_testcase_id = Some(testcase_id);
        self.testcase_id = None;
        self.load_queues.clear();
        self.listener.on_testcase_finished(testcase_id);
        outcome
    }

    fn join_testcase(&mut self, join: &JoinTestcase) {
        self.run_id = Some(join.run_id);
        self.suite_id = Some(join.suite_id);
        self.testcase_id = Some(join.testcase_id);
        self.state = LifeCycleState::TestcaseStarted;
        debug!(channel = %self.channel, testcase_id = %join.testcase_id, "joined testcase");
    }

    fn leave_testcase(&mut self) {
        debug!(channel = %self.channel, testcase_id = ?self.testcase_id, "left testcase");
        self.run_id = None;
        self.suite_id = None;
        self.testcase_id = None;
        self.load_queues.clear();
        self.state = LifeCycleState::Initialized;
    }

    fn update_testcase(&mut self, update: &UpdateTestcase, ts: i64) -> Result<(), PipelineError> {
        let testcase_id = self
            .testcase_id
            .or(self.last_executed_testcase_id)
            .ok_or_else(|| {
                self.scope_violation(
                    EventKind::UpdateTestcase,
                    Expectation::Exactly(LifeCycleState::TestcaseStarted),
                )
            })?;
        self.backend
            .update_testcase(testcase_id, update, ts, true)
            .map_err(backend_failure(EventKind::UpdateTestcase))
    }

    fn add_scenario_metainfo(&mut self, meta: &Metainfo) -> Result<(), PipelineError> {
        let testcase_id = self.current_testcase(EventKind::AddScenarioMetainfo)?;
        self.backend
            .add_scenario_metainfo(testcase_id, &meta.key, &meta.value, true)
            .map_err(backend_failure(EventKind::AddScenarioMetainfo))
    }

    fn clear_scenario_metainfo(&mut self) -> Result<(), PipelineError> {
        let testcase_id = self.current_testcase(EventKind::ClearScenarioMetainfo)?;
        self.backend
            .clear_scenario_metainfo(testcase_id, true)
            .map_err(backend_failure(EventKind::ClearScenarioMetainfo))
    }

    fn add_testcase_metainfo(&mut self, meta: &TestcaseMetainfo) -> Result<(), PipelineError> {
        let testcase_id = self.metainfo_testcase(meta).ok_or_else(|| {
            self.scope_violation(
                EventKind::AddTestcaseMetainfo,
                Expectation::Exactly(LifeCycleState::TestcaseStarted),
            )
        })?;
        self.backend
            .add_testcase_metainfo(testcase_id, &meta.key, &meta.value, true)
            .map_err(backend_failure(EventKind::AddTestcaseMetainfo))
    }

    // ── Load queues and checkpoints ─────────────────────────────────────────

    fn start_load_queue(&mut self, load_queue: &StartLoadQueue, ts: i64) -> Result<(), PipelineError> {
        let testcase_id = self.current_testcase(EventKind::StartLoadQueue)?;
        if self.load_queues.is_running(&load_queue.name) {
            return Err(LoadQueueError::AlreadyStarted {
                name: load_queue.name.clone(),
            }
            .into());
        }
        let load_queue_id = self
            .backend
            .start_load_queue(load_queue, ts, testcase_id, true)
            .map_err(backend_failure(EventKind::StartLoadQueue))?;
        self.load_queues.add(&load_queue.name, load_queue_id)?;
        Ok(())
    }

    fn end_load_queue(&mut self, end: &EndLoadQueue, ts: i64) -> Result<(), PipelineError> {
        let load_queue_id = self.load_queues.id_of(&end.name)?;
        let result = self
            .backend
            .end_load_queue(load_queue_id, end.result, ts, true)
            .map_err(backend_failure(EventKind::EndLoadQueue));
        self.load_queues.remove(&end.name)?;
        result
    }

    fn register_thread(&mut self, register: &RegisterThread) -> Result<(), PipelineError> {
        self.load_queues
            .register_thread(&register.thread_name, &register.load_queue_name)?;
        Ok(())
    }

    fn start_checkpoint(&mut self, checkpoint: &StartCheckpoint) -> Result<(), PipelineError> {
        if !self.config.enable_checkpoints {
            return Ok(());
        }
        let Ok(load_queue_id) = self.load_queues.queue_for_thread(&checkpoint.thread_name) else {
            debug!(channel = %self.channel, thread = %checkpoint.thread_name, "checkpoint from a thread outside any load queue ignored");
            return Ok(());
        };
        let info = self
            .backend
            .start_checkpoint(
                &checkpoint.name,
                &checkpoint.thread_name,
                checkpoint.start_timestamp,
                &checkpoint.transfer_unit,
                load_queue_id,
                true,
            )
            .map_err(backend_failure(EventKind::StartCheckpoint))?;
        self.load_queues
            .start_checkpoint(&checkpoint.thread_name, info)?;
        Ok(())
    }

    fn end_checkpoint(&mut self, checkpoint: &EndCheckpoint) -> Result<(), PipelineError> {
        if !self.config.enable_checkpoints {
            return Ok(());
        }
        let info = self
            .load_queues
            .end_checkpoint(&checkpoint.thread_name, &checkpoint.name)?;
        self.backend
            .end_checkpoint(
                &info,
                checkpoint.end_timestamp,
                checkpoint.transfer_size,
                checkpoint.result,
                true,
            )
            .map_err(backend_failure(EventKind::EndCheckpoint))
    }

    fn insert_checkpoint(&mut self, checkpoint: &InsertCheckpoint) -> Result<(), PipelineError> {
        if !self.config.enable_checkpoints {
            return Ok(());
        }
        let load_queue_id = self.load_queues.queue_for_thread(&checkpoint.thread_name)?;
        let commit = self.commit_for(EventKind::InsertCheckpoint);
        self.backend
            .insert_checkpoint(checkpoint, load_queue_id, commit)
            .map_err(backend_failure(EventKind::InsertCheckpoint))
    }

    fn insert_statistics(
        &mut self,
        kind: EventKind,
        sample: &StatisticSample,
    ) -> Result<(), PipelineError> {
        let testcase_id = self.current_testcase(kind)?;
        let commit = self.commit_for(kind);
        let result = if kind == EventKind::InsertSystemStat {
            self.backend
                .insert_system_statistics(testcase_id, sample, commit)
        } else {
            self.backend
                .insert_user_activity_statistics(testcase_id, sample, commit)
        };
        result.map_err(backend_failure(kind))
    }

    // ── Messages ────────────────────────────────────────────────────────────

    fn insert_message(
        &mut self,
        msg: &InsertMessage,
        thread_name: &str,
        ts: i64,
    ) -> Result<(), PipelineError> {
        let Some(target) = self.message_target(msg) else {
            trace!(channel = %self.channel, state = %self.state, "message without an open scope dropped");
            return Ok(());
        };
        let record = MessageRecord {
            message: msg.message.clone(),
            level: msg.level,
            escape_html: msg.escape_html,
            machine_name: self.config.machine_name.clone(),
            thread_name: thread_name.to_string(),
            timestamp: ts,
        };
        let commit = self.commit_for(EventKind::InsertMessage);
        self.backend
            .insert_message(target, &record, commit)
            .map_err(backend_failure(EventKind::InsertMessage))
    }
}

/// END and LEAVE events always run so their scope is released.
fn releases_scope(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::EndRun | EventKind::EndSuite | EventKind::EndTestcase | EventKind::LeaveTestcase
    )
}

fn is_start(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::StartRun
            | EventKind::StartSuite
            | EventKind::StartTestcase
            | EventKind::JoinTestcase
    )
}
