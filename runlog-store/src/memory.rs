//! In-memory recording backend.
//!
//! Keeps runs, suites and testcases in maps, records every call in arrival
//! order and emulates the foreign-key behaviour of a relational store: a write
//! against a parent that does not exist (or was deleted by an external actor)
//! fails with [`BackendError::Integrity`]. Used by tests and by the CLI when
//! no database file is given.

use runlog_common::backend::{BackendResult, CheckpointInfo, MessageRecord, MessageTarget};
use runlog_common::events::{
    InsertCheckpoint, StartLoadQueue, StartRun, StartTestcase, StatisticSample, UpdateRun,
    UpdateTestcase,
};
use runlog_common::{
    BackendError, CheckpointId, CheckpointResult, LoadQueueId, MessageLevel, RunId, SuiteId,
    TestcaseId, TestcaseResult, WriteBackend,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

// ── Call log ────────────────────────────────────────────────────────────────

/// Backend operation names, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOp {
    SanityCheck,
    StartRun,
    EndRun,
    UpdateRun,
    AddRunMetainfo,
    StartSuite,
    EndSuite,
    UpdateSuite,
    StartTestcase,
    EndTestcase,
    UpdateTestcase,
    DeleteTestcase,
    AddScenarioMetainfo,
    ClearScenarioMetainfo,
    AddTestcaseMetainfo,
    InsertMessage,
    StartLoadQueue,
    EndLoadQueue,
    StartCheckpoint,
    EndCheckpoint,
    InsertCheckpoint,
    InsertSystemStatistics,
    InsertUserActivityStatistics,
    IsRunPresent,
    IsSuitePresent,
    IsTestcasePresent,
    FlushCache,
}

impl BackendOp {
    pub fn is_presence_check(self) -> bool {
        matches!(
            self,
            Self::IsRunPresent | Self::IsSuitePresent | Self::IsTestcasePresent
        )
    }
}

/// One recorded backend call with the arguments tests care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BackendCall {
    SanityCheck,
    StartRun {
        run_name: String,
        timestamp: i64,
    },
    EndRun {
        run_id: RunId,
    },
    UpdateRun {
        run_id: RunId,
        update: UpdateRun,
    },
    AddRunMetainfo {
        run_id: RunId,
        key: String,
        value: String,
    },
    StartSuite {
        suite_name: String,
        run_id: RunId,
    },
    EndSuite {
        suite_id: SuiteId,
    },
    UpdateSuite {
        suite_id: SuiteId,
        suite_name: Option<String>,
        user_note: Option<String>,
    },
    StartTestcase {
        testcase_name: String,
        suite_id: SuiteId,
        timestamp: i64,
    },
    EndTestcase {
        testcase_id: TestcaseId,
        result: TestcaseResult,
    },
    UpdateTestcase {
        testcase_id: TestcaseId,
        update: UpdateTestcase,
    },
    DeleteTestcase {
        testcase_id: TestcaseId,
    },
    AddScenarioMetainfo {
        testcase_id: TestcaseId,
        key: String,
        value: String,
    },
    ClearScenarioMetainfo {
        testcase_id: TestcaseId,
    },
    AddTestcaseMetainfo {
        testcase_id: TestcaseId,
        key: String,
        value: String,
    },
    InsertMessage {
        target: MessageTarget,
        message: String,
        level: MessageLevel,
        timestamp: i64,
    },
    StartLoadQueue {
        name: String,
        testcase_id: TestcaseId,
    },
    EndLoadQueue {
        load_queue_id: LoadQueueId,
        result: CheckpointResult,
    },
    StartCheckpoint {
        name: String,
        thread_name: String,
        start_timestamp: i64,
        load_queue_id: LoadQueueId,
    },
    EndCheckpoint {
        checkpoint_id: CheckpointId,
        end_timestamp: i64,
        result: CheckpointResult,
    },
    InsertCheckpoint {
        name: String,
        start_timestamp: i64,
        load_queue_id: LoadQueueId,
    },
    InsertSystemStatistics {
        testcase_id: TestcaseId,
        timestamp: i64,
    },
    InsertUserActivityStatistics {
        testcase_id: TestcaseId,
        timestamp: i64,
    },
    IsRunPresent {
        run_id: RunId,
    },
    IsSuitePresent {
        suite_id: SuiteId,
    },
    IsTestcasePresent {
        testcase_id: TestcaseId,
    },
    FlushCache,
}

impl BackendCall {
    pub fn op(&self) -> BackendOp {
        match self {
            Self::SanityCheck => BackendOp::SanityCheck,
            Self::StartRun { .. } => BackendOp::StartRun,
            Self::EndRun { .. } => BackendOp::EndRun,
            Self::UpdateRun { .. } => BackendOp::UpdateRun,
            Self::AddRunMetainfo { .. } => BackendOp::AddRunMetainfo,
            Self::StartSuite { .. } => BackendOp::StartSuite,
            Self::EndSuite { .. } => BackendOp::EndSuite,
            Self::UpdateSuite { .. } => BackendOp::UpdateSuite,
            Self::StartTestcase { .. } => BackendOp::StartTestcase,
            Self::EndTestcase { .. } => BackendOp::EndTestcase,
            Self::UpdateTestcase { .. } => BackendOp::UpdateTestcase,
            Self::DeleteTestcase { .. } => BackendOp::DeleteTestcase,
            Self::AddScenarioMetainfo { .. } => BackendOp::AddScenarioMetainfo,
            Self::ClearScenarioMetainfo { .. } => BackendOp::ClearScenarioMetainfo,
            Self::AddTestcaseMetainfo { .. } => BackendOp::AddTestcaseMetainfo,
            Self::InsertMessage { .. } => BackendOp::InsertMessage,
            Self::StartLoadQueue { .. } => BackendOp::StartLoadQueue,
            Self::EndLoadQueue { .. } => BackendOp::EndLoadQueue,
            Self::StartCheckpoint { .. } => BackendOp::StartCheckpoint,
            Self::EndCheckpoint { .. } => BackendOp::EndCheckpoint,
            Self::InsertCheckpoint { .. } => BackendOp::InsertCheckpoint,
            Self::InsertSystemStatistics { .. } => BackendOp::InsertSystemStatistics,
            Self::InsertUserActivityStatistics { .. } => BackendOp::InsertUserActivityStatistics,
            Self::IsRunPresent { .. } => BackendOp::IsRunPresent,
            Self::IsSuitePresent { .. } => BackendOp::IsSuitePresent,
            Self::IsTestcasePresent { .. } => BackendOp::IsTestcasePresent,
            Self::FlushCache => BackendOp::FlushCache,
        }
    }
}

// ── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRow {
    pub run_name: String,
    pub os_name: String,
    pub product_name: String,
    pub version_name: String,
    pub build_name: String,
    pub host_name: String,
    pub user_note: Option<String>,
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
    pub metainfo: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteRow {
    pub run_id: RunId,
    pub suite_name: String,
    pub package_name: String,
    pub user_note: Option<String>,
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestcaseRow {
    pub suite_id: SuiteId,
    pub suite_full_name: String,
    pub scenario_name: String,
    pub scenario_description: String,
    pub testcase_name: String,
    pub user_note: Option<String>,
    pub result: TestcaseResult,
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
    pub scenario_metainfo: Vec<(String, String)>,
    pub metainfo: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadQueueRow {
    pub testcase_id: TestcaseId,
    pub name: String,
    pub result: CheckpointResult,
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointRow {
    pub checkpoint_id: CheckpointId,
    pub load_queue_id: LoadQueueId,
    pub name: String,
    pub thread_name: String,
    pub start_timestamp: i64,
    pub response_time: Option<i64>,
    pub transfer_size: i64,
    pub result: CheckpointResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    System,
    UserActivity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticRow {
    pub kind: StatisticKind,
    pub testcase_id: TestcaseId,
    pub sample: StatisticSample,
}

/// A write parked in the batch cache.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CachedWrite {
    Message(MessageTarget, MessageRecord),
    Checkpoint(CheckpointRow),
    Statistic(StatisticRow),
}

/// Row counts, as printed by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemorySummary {
    pub runs: usize,
    pub suites: usize,
    pub testcases: usize,
    pub messages: usize,
    pub checkpoints: usize,
    pub statistics: usize,
    pub pending_writes: usize,
    pub calls: usize,
}

// ── Backend ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    next_id: i64,
    unreachable: bool,
    calls: Vec<BackendCall>,
    failures: HashMap<BackendOp, VecDeque<BackendError>>,
    runs: HashMap<RunId, RunRow>,
    suites: HashMap<SuiteId, SuiteRow>,
    testcases: HashMap<TestcaseId, TestcaseRow>,
    load_queues: HashMap<LoadQueueId, LoadQueueRow>,
    messages: Vec<(MessageTarget, MessageRecord)>,
    checkpoints: Vec<CheckpointRow>,
    statistics: Vec<StatisticRow>,
    cache: Vec<CachedWrite>,
    flushes: usize,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn commit_cache(&mut self) {
        for write in self.cache.drain(..) {
            match write {
                CachedWrite::Message(target, message) => self.messages.push((target, message)),
                CachedWrite::Checkpoint(row) => self.checkpoints.push(row),
                CachedWrite::Statistic(row) => self.statistics.push(row),
            }
        }
        self.flushes += 1;
    }

    fn store(&mut self, write: CachedWrite, commit: bool, max_cached: usize) {
        self.cache.push(write);
        if commit || self.cache.len() >= max_cached {
            self.commit_cache();
        }
    }

    fn remove_testcase(&mut self, testcase_id: TestcaseId) {
        self.testcases.remove(&testcase_id);
        let queues: Vec<LoadQueueId> = self
            .load_queues
            .iter()
            .filter(|(_, row)| row.testcase_id == testcase_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &queues {
            self.load_queues.remove(id);
        }
        self.checkpoints
            .retain(|row| !queues.contains(&row.load_queue_id));
        self.statistics.retain(|row| row.testcase_id != testcase_id);
        self.messages
            .retain(|(target, _)| *target != MessageTarget::Testcase(testcase_id));
    }

    fn remove_suite(&mut self, suite_id: SuiteId) {
        self.suites.remove(&suite_id);
        let testcases: Vec<TestcaseId> = self
            .testcases
            .iter()
            .filter(|(_, row)| row.suite_id == suite_id)
            .map(|(id, _)| *id)
            .collect();
        for id in testcases {
            self.remove_testcase(id);
        }
        self.messages
            .retain(|(target, _)| *target != MessageTarget::Suite(suite_id));
    }

    fn remove_run(&mut self, run_id: RunId) {
        self.runs.remove(&run_id);
        let suites: Vec<SuiteId> = self
            .suites
            .iter()
            .filter(|(_, row)| row.run_id == run_id)
            .map(|(id, _)| *id)
            .collect();
        for id in suites {
            self.remove_suite(id);
        }
        self.messages
            .retain(|(target, _)| *target != MessageTarget::Run(run_id));
    }

    fn run(&mut self, run_id: RunId) -> BackendResult<&mut RunRow> {
        self.runs
            .get_mut(&run_id)
            .ok_or_else(|| missing("run", run_id.get()))
    }

    fn suite(&mut self, suite_id: SuiteId) -> BackendResult<&mut SuiteRow> {
        self.suites
            .get_mut(&suite_id)
            .ok_or_else(|| missing("suite", suite_id.get()))
    }

    fn testcase(&mut self, testcase_id: TestcaseId) -> BackendResult<&mut TestcaseRow> {
        self.testcases
            .get_mut(&testcase_id)
            .ok_or_else(|| missing("testcase", testcase_id.get()))
    }

    fn load_queue(&mut self, load_queue_id: LoadQueueId) -> BackendResult<&mut LoadQueueRow> {
        self.load_queues
            .get_mut(&load_queue_id)
            .ok_or_else(|| missing("load queue", load_queue_id.get()))
    }

    fn target_exists(&self, target: MessageTarget) -> bool {
        match target {
            MessageTarget::Run(id) => self.runs.contains_key(&id),
            MessageTarget::Suite(id) => self.suites.contains_key(&id),
            MessageTarget::Testcase(id) => self.testcases.contains_key(&id),
        }
    }
}

fn missing(entity: &str, id: i64) -> BackendError {
    BackendError::Integrity(format!(
        "FOREIGN KEY constraint failed: no {entity} with id {id}"
    ))
}

/// Thread-safe recording backend.
pub struct MemoryBackend {
    state: Mutex<State>,
    max_cached: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_cached: usize::MAX,
        }
    }

    /// Commit the batch cache on its own once `max` writes are pending.
    pub fn with_max_cached(mut self, max: usize) -> Self {
        self.max_cached = max.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call, then apply outage and injected failures.
    fn enter(&self, call: BackendCall) -> BackendResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        let op = call.op();
        state.calls.push(call);
        if state.unreachable {
            return Err(BackendError::Connectivity(
                "connection refused (simulated outage)".to_string(),
            ));
        }
        if let Some(err) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            debug!(?op, error = %err, "injected backend failure");
            return Err(err);
        }
        Ok(state)
    }

    // ── Test controls ───────────────────────────────────────────────────────

    /// Fail the next call of `op` with `error`. Queued failures are used in order.
    pub fn fail_next(&self, op: BackendOp, error: BackendError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Simulate losing or regaining the database connection.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Delete a run and everything below it, as an external actor would.
    pub fn delete_run(&self, run_id: RunId) {
        self.lock().remove_run(run_id);
    }

    pub fn delete_suite(&self, suite_id: SuiteId) {
        self.lock().remove_suite(suite_id);
    }

    pub fn delete_testcase_externally(&self, testcase_id: TestcaseId) {
        self.lock().remove_testcase(testcase_id);
    }

    // ── Inspection ──────────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Calls excluding presence checks and cache flushes.
    pub fn write_calls(&self) -> Vec<BackendCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| !call.op().is_presence_check() && call.op() != BackendOp::FlushCache)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, op: BackendOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn run(&self, run_id: RunId) -> Option<RunRow> {
        self.lock().runs.get(&run_id).cloned()
    }

    pub fn suite(&self, suite_id: SuiteId) -> Option<SuiteRow> {
        self.lock().suites.get(&suite_id).cloned()
    }

    pub fn testcase(&self, testcase_id: TestcaseId) -> Option<TestcaseRow> {
        self.lock().testcases.get(&testcase_id).cloned()
    }

    pub fn load_queue(&self, load_queue_id: LoadQueueId) -> Option<LoadQueueRow> {
        self.lock().load_queues.get(&load_queue_id).cloned()
    }

    /// Committed messages in commit order.
    pub fn messages(&self) -> Vec<(MessageTarget, MessageRecord)> {
        self.lock().messages.clone()
    }

    pub fn checkpoints(&self) -> Vec<CheckpointRow> {
        self.lock().checkpoints.clone()
    }

    pub fn statistics(&self) -> Vec<StatisticRow> {
        self.lock().statistics.clone()
    }

    /// Writes still held in the batch cache.
    pub fn pending_writes(&self) -> usize {
        self.lock().cache.len()
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    pub fn summary(&self) -> MemorySummary {
        let state = self.lock();
        MemorySummary {
            runs: state.runs.len(),
            suites: state.suites.len(),
            testcases: state.testcases.len(),
            messages: state.messages.len(),
            checkpoints: state.checkpoints.len(),
            statistics: state.statistics.len(),
            pending_writes: state.cache.len(),
            calls: state.calls.len(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBackend for MemoryBackend {
    fn sanity_check(&self) -> BackendResult<()> {
        self.enter(BackendCall::SanityCheck).map(|_| ())
    }

    fn start_run(&self, run: &StartRun, timestamp: i64, _commit: bool) -> BackendResult<RunId> {
        let mut state = self.enter(BackendCall::StartRun {
            run_name: run.run_name.clone(),
            timestamp,
        })?;
        let run_id = RunId(state.next_id());
        state.runs.insert(
            run_id,
            RunRow {
                run_name: run.run_name.clone(),
                os_name: run.os_name.clone(),
                product_name: run.product_name.clone(),
                version_name: run.version_name.clone(),
                build_name: run.build_name.clone(),
                host_name: run.host_name.clone(),
                user_note: None,
                start_timestamp: timestamp,
                end_timestamp: None,
                metainfo: Vec::new(),
            },
        );
        Ok(run_id)
    }

    fn end_run(&self, run_id: RunId, timestamp: i64, _commit: bool) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::EndRun { run_id })?;
        state.run(run_id)?.end_timestamp = Some(timestamp);
        Ok(())
    }

    fn update_run(&self, run_id: RunId, update: &UpdateRun, _commit: bool) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::UpdateRun {
            run_id,
            update: update.clone(),
        })?;
        let row = state.run(run_id)?;
        let fields = [
            (&mut row.run_name, &update.run_name),
            (&mut row.os_name, &update.os_name),
            (&mut row.product_name, &update.product_name),
            (&mut row.version_name, &update.version_name),
            (&mut row.build_name, &update.build_name),
            (&mut row.host_name, &update.host_name),
        ];
        for (slot, value) in fields {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        if update.user_note.is_some() {
            row.user_note = update.user_note.clone();
        }
        Ok(())
    }

    fn add_run_metainfo(
        &self,
        run_id: RunId,
        key: &str,
        value: &str,
        _commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::AddRunMetainfo {
            run_id,
            key: key.to_string(),
            value: value.to_string(),
        })?;
        state
            .run(run_id)?
            .metainfo
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn start_suite(
        &self,
        package_name: &str,
        suite_name: &str,
        timestamp: i64,
        run_id: RunId,
        _commit: bool,
    ) -> BackendResult<SuiteId> {
        let mut state = self.enter(BackendCall::StartSuite {
            suite_name: suite_name.to_string(),
            run_id,
        })?;
        state.run(run_id)?;
        let suite_id = SuiteId(state.next_id());
        state.suites.insert(
            suite_id,
            SuiteRow {
                run_id,
                suite_name: suite_name.to_string(),
                package_name: package_name.to_string(),
                user_note: None,
                start_timestamp: timestamp,
                end_timestamp: None,
            },
        );
        Ok(suite_id)
    }

    fn end_suite(&self, suite_id: SuiteId, timestamp: i64, _commit: bool) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::EndSuite { suite_id })?;
        state.suite(suite_id)?.end_timestamp = Some(timestamp);
        Ok(())
    }

    fn update_suite(
        &self,
        suite_id: SuiteId,
        suite_name: Option<&str>,
        user_note: Option<&str>,
        _commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::UpdateSuite {
            suite_id,
            suite_name: suite_name.map(str::to_string),
            user_note: user_note.map(str::to_string),
        })?;
        let row = state.suite(suite_id)?;
        if let Some(name) = suite_name {
            row.suite_name = name.to_string();
        }
        if let Some(note) = user_note {
            row.user_note = Some(note.to_string());
        }
        Ok(())
    }

    fn start_testcase(
        &self,
        testcase: &StartTestcase,
        suite_id: SuiteId,
        timestamp: i64,
        _commit: bool,
    ) -> BackendResult<TestcaseId> {
        let mut state = self.enter(BackendCall::StartTestcase {
            testcase_name: testcase.testcase_name.clone(),
            suite_id,
            timestamp,
        })?;
        state.suite(suite_id)?;
        let testcase_id = TestcaseId(state.next_id());
        state.testcases.insert(
            testcase_id,
            TestcaseRow {
                suite_id,
                suite_full_name: testcase.suite_full_name.clone(),
                scenario_name: testcase.scenario_name.clone(),
                scenario_description: testcase.scenario_description.clone(),
                testcase_name: testcase.testcase_name.clone(),
                user_note: None,
                result: TestcaseResult::Running,
                start_timestamp: timestamp,
                end_timestamp: None,
                scenario_metainfo: Vec::new(),
                metainfo: Vec::new(),
            },
        );
        Ok(testcase_id)
    }

    fn end_testcase(
        &self,
        testcase_id: TestcaseId,
        result: TestcaseResult,
        timestamp: i64,
        _commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::EndTestcase {
            testcase_id,
            result,
        })?;
        let row = state.testcase(testcase_id)?;
        row.result = result;
        row.end_timestamp = Some(timestamp);
        Ok(())
    }

    fn update_testcase(
        &self,
        testcase_id: TestcaseId,
        update: &UpdateTestcase,
        _timestamp: i64,
        _commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::UpdateTestcase {
            testcase_id,
            update: update.clone(),
        })?;
        let row = state.testcase(testcase_id)?;
        let fields = [
            (&mut row.suite_full_name, &update.suite_full_name),
            (&mut row.scenario_name, &update.scenario_name),
            (&mut row.scenario_description, &update.scenario_description),
            (&mut row.testcase_name, &update.testcase_name),
        ];
        for (slot, value) in fields {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        if update.user_note.is_some() {
            row.user_note = update.user_note.clone();
        }
        if let Some(result) = update.result {
            row.result = result;
        }
        Ok(())
    }

    fn delete_testcase(&self, testcase_id: TestcaseId) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::DeleteTestcase { testcase_id })?;
        state.remove_testcase(testcase_id);
        Ok(())
    }

    fn add_scenario_metainfo(
        &self,
        testcase_id: TestcaseId,
        key: &str,
        value: &str,
        _commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::AddScenarioMetainfo {
            testcase_id,
            key: key.to_string(),
            value: value.to_string(),
        })?;
        state
            .testcase(testcase_id)?
            .scenario_metainfo
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn clear_scenario_metainfo(&self, testcase_id: TestcaseId, _commit: bool) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::ClearScenarioMetainfo { testcase_id })?;
        state.testcase(testcase_id)?.scenario_metainfo.clear();
        Ok(())
    }

    fn add_testcase_metainfo(
        &self,
        testcase_id: TestcaseId,
        key: &str,
        value: &str,
        _commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::AddTestcaseMetainfo {
            testcase_id,
            key: key.to_string(),
            value: value.to_string(),
        })?;
        state
            .testcase(testcase_id)?
            .metainfo
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn insert_message(
        &self,
        target: MessageTarget,
        message: &MessageRecord,
        commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::InsertMessage {
            target,
            message: message.message.clone(),
            level: message.level,
            timestamp: message.timestamp,
        })?;
        if !state.target_exists(target) {
            return Err(match target {
                MessageTarget::Run(id) => missing("run", id.get()),
                MessageTarget::Suite(id) => missing("suite", id.get()),
                MessageTarget::Testcase(id) => missing("testcase", id.get()),
            });
        }
        state.store(
            CachedWrite::Message(target, message.clone()),
            commit,
            self.max_cached,
        );
        Ok(())
    }

    fn start_load_queue(
        &self,
        load_queue: &StartLoadQueue,
        timestamp: i64,
        testcase_id: TestcaseId,
        _commit: bool,
    ) -> BackendResult<LoadQueueId> {
        let mut state = self.enter(BackendCall::StartLoadQueue {
            name: load_queue.name.clone(),
            testcase_id,
        })?;
        state.testcase(testcase_id)?;
        let load_queue_id = LoadQueueId(state.next_id());
        state.load_queues.insert(
            load_queue_id,
            LoadQueueRow {
                testcase_id,
                name: load_queue.name.clone(),
                result: CheckpointResult::Running,
                start_timestamp: timestamp,
                end_timestamp: None,
            },
        );
        Ok(load_queue_id)
    }

    fn end_load_queue(
        &self,
        load_queue_id: LoadQueueId,
        result: CheckpointResult,
        timestamp: i64,
        _commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::EndLoadQueue {
            load_queue_id,
            result,
        })?;
        let row = state.load_queue(load_queue_id)?;
        row.result = result;
        row.end_timestamp = Some(timestamp);
        Ok(())
    }

    fn start_checkpoint(
        &self,
        name: &str,
        thread_name: &str,
        start_timestamp: i64,
        _transfer_unit: &str,
        load_queue_id: LoadQueueId,
        _commit: bool,
    ) -> BackendResult<CheckpointInfo> {
        let mut state = self.enter(BackendCall::StartCheckpoint {
            name: name.to_string(),
            thread_name: thread_name.to_string(),
            start_timestamp,
            load_queue_id,
        })?;
        state.load_queue(load_queue_id)?;
        let checkpoint_id = CheckpointId(state.next_id());
        state.checkpoints.push(CheckpointRow {
            checkpoint_id,
            load_queue_id,
            name: name.to_string(),
            thread_name: thread_name.to_string(),
            start_timestamp,
            response_time: None,
            transfer_size: 0,
            result: CheckpointResult::Running,
        });
        Ok(CheckpointInfo {
            checkpoint_id,
            name: name.to_string(),
            load_queue_id,
            start_timestamp,
        })
    }

    fn end_checkpoint(
        &self,
        checkpoint: &CheckpointInfo,
        end_timestamp: i64,
        transfer_size: i64,
        result: CheckpointResult,
        _commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::EndCheckpoint {
            checkpoint_id: checkpoint.checkpoint_id,
            end_timestamp,
            result,
        })?;
        let row = state
            .checkpoints
            .iter_mut()
            .find(|row| row.checkpoint_id == checkpoint.checkpoint_id)
            .ok_or_else(|| missing("checkpoint", checkpoint.checkpoint_id.get()))?;
        row.response_time = Some(end_timestamp - row.start_timestamp);
        row.transfer_size = transfer_size;
        row.result = result;
        Ok(())
    }

    fn insert_checkpoint(
        &self,
        checkpoint: &InsertCheckpoint,
        load_queue_id: LoadQueueId,
        commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::InsertCheckpoint {
            name: checkpoint.name.clone(),
            start_timestamp: checkpoint.start_timestamp,
            load_queue_id,
        })?;
        state.load_queue(load_queue_id)?;
        let checkpoint_id = CheckpointId(state.next_id());
        let row = CheckpointRow {
            checkpoint_id,
            load_queue_id,
            name: checkpoint.name.clone(),
            thread_name: checkpoint.thread_name.clone(),
            start_timestamp: checkpoint.start_timestamp,
            response_time: Some(checkpoint.response_time),
            transfer_size: checkpoint.transfer_size,
            result: checkpoint.result,
        };
        state.store(CachedWrite::Checkpoint(row), commit, self.max_cached);
        Ok(())
    }

    fn insert_system_statistics(
        &self,
        testcase_id: TestcaseId,
        sample: &StatisticSample,
        commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::InsertSystemStatistics {
            testcase_id,
            timestamp: sample.timestamp,
        })?;
        state.testcase(testcase_id)?;
        let row = StatisticRow {
            kind: StatisticKind::System,
            testcase_id,
            sample: sample.clone(),
        };
        state.store(CachedWrite::Statistic(row), commit, self.max_cached);
        Ok(())
    }

    fn insert_user_activity_statistics(
        &self,
        testcase_id: TestcaseId,
        sample: &StatisticSample,
        commit: bool,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::InsertUserActivityStatistics {
            testcase_id,
            timestamp: sample.timestamp,
        })?;
        state.testcase(testcase_id)?;
        let row = StatisticRow {
            kind: StatisticKind::UserActivity,
            testcase_id,
            sample: sample.clone(),
        };
        state.store(CachedWrite::Statistic(row), commit, self.max_cached);
        Ok(())
    }

    fn is_run_present(&self, run_id: RunId) -> BackendResult<bool> {
        let state = self.enter(BackendCall::IsRunPresent { run_id })?;
        Ok(state.runs.contains_key(&run_id))
    }

    fn is_suite_present(&self, suite_id: SuiteId) -> BackendResult<bool> {
        let state = self.enter(BackendCall::IsSuitePresent { suite_id })?;
        Ok(state.suites.contains_key(&suite_id))
    }

    fn is_testcase_present(&self, testcase_id: TestcaseId) -> BackendResult<bool> {
        let state = self.enter(BackendCall::IsTestcasePresent { testcase_id })?;
        Ok(state.testcases.contains_key(&testcase_id))
    }

    fn flush_cache(&self) -> BackendResult<()> {
        let mut state = self.enter(BackendCall::FlushCache)?;
        if !state.cache.is_empty() {
            state.commit_cache();
        }
        Ok(())
    }
}
