//! Durable-write backend boundary.
//!
//! The pipeline never talks SQL. Every persistence step goes through
//! [`WriteBackend`], which is shared by all channel workers and must therefore
//! be thread-safe. Each write takes a final `commit` flag: `true` for
//! interactive writes, `false` for writes that may stay in the backend's batch
//! cache until [`WriteBackend::flush_cache`].

use crate::errors::BackendError;
use crate::events::{
    InsertCheckpoint, StartLoadQueue, StartRun, StartTestcase, UpdateRun, UpdateTestcase,
};
use crate::types::{
    CheckpointId, CheckpointResult, LoadQueueId, MessageLevel, RunId, SuiteId, TestcaseId,
    TestcaseResult,
};
use serde::{Deserialize, Serialize};

pub use crate::events::StatisticSample;

/// Entity a message is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum MessageTarget {
    Run(RunId),
    Suite(SuiteId),
    Testcase(TestcaseId),
}

/// A message as it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message: String,
    pub level: MessageLevel,
    pub escape_html: bool,
    pub machine_name: String,
    pub thread_name: String,
    pub timestamp: i64,
}

/// Handle to a started checkpoint, needed to end it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: CheckpointId,
    pub name: String,
    pub load_queue_id: LoadQueueId,
    pub start_timestamp: i64,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Operations the event processor needs from durable storage.
pub trait WriteBackend: Send + Sync {
    // ── Runs ────────────────────────────────────────────────────────────────

    /// Verify the store is reachable and has the expected schema.
    fn sanity_check(&self) -> BackendResult<()>;

    fn start_run(&self, run: &StartRun, timestamp: i64, commit: bool) -> BackendResult<RunId>;

    fn end_run(&self, run_id: RunId, timestamp: i64, commit: bool) -> BackendResult<()>;

    fn update_run(&self, run_id: RunId, update: &UpdateRun, commit: bool) -> BackendResult<()>;

    fn add_run_metainfo(
        &self,
        run_id: RunId,
        key: &str,
        value: &str,
        commit: bool,
    ) -> BackendResult<()>;

    // ── Suites ──────────────────────────────────────────────────────────────

    fn start_suite(
        &self,
        package_name: &str,
        suite_name: &str,
        timestamp: i64,
        run_id: RunId,
        commit: bool,
    ) -> BackendResult<SuiteId>;

    fn end_suite(&self, suite_id: SuiteId, timestamp: i64, commit: bool) -> BackendResult<()>;

    fn update_suite(
        &self,
        suite_id: SuiteId,
        suite_name: Option<&str>,
        user_note: Option<&str>,
        commit: bool,
    ) -> BackendResult<()>;

    // ── Testcases ───────────────────────────────────────────────────────────

    fn start_testcase(
        &self,
        testcase: &StartTestcase,
        suite_id: SuiteId,
        timestamp: i64,
        commit: bool,
    ) -> BackendResult<TestcaseId>;

    fn end_testcase(
        &self,
        testcase_id: TestcaseId,
        result: TestcaseResult,
        timestamp: i64,
        commit: bool,
    ) -> BackendResult<()>;

    fn update_testcase(
        &self,
        testcase_id: TestcaseId,
        update: &UpdateTestcase,
        timestamp: i64,
        commit: bool,
    ) -> BackendResult<()>;

    fn delete_testcase(&self, testcase_id: TestcaseId) -> BackendResult<()>;

    fn add_scenario_metainfo(
        &self,
        testcase_id: TestcaseId,
        key: &str,
        value: &str,
        commit: bool,
    ) -> BackendResult<()>;

    fn clear_scenario_metainfo(&self, testcase_id: TestcaseId, commit: bool) -> BackendResult<()>;

    fn add_testcase_metainfo(
        &self,
        testcase_id: TestcaseId,
        key: &str,
        value: &str,
        commit: bool,
    ) -> BackendResult<()>;

    // ── Messages ────────────────────────────────────────────────────────────

    fn insert_message(
        &self,
        target: MessageTarget,
        message: &MessageRecord,
        commit: bool,
    ) -> BackendResult<()>;

    // ── Load queues and checkpoints ─────────────────────────────────────────

    fn start_load_queue(
        &self,
        load_queue: &StartLoadQueue,
        timestamp: i64,
        testcase_id: TestcaseId,
        commit: bool,
    ) -> BackendResult<LoadQueueId>;

    fn end_load_queue(
        &self,
        load_queue_id: LoadQueueId,
        result: CheckpointResult,
        timestamp: i64,
        commit: bool,
    ) -> BackendResult<()>;

    fn start_checkpoint(
        &self,
        name: &str,
        thread_name: &str,
        start_timestamp: i64,
        transfer_unit: &str,
        load_queue_id: LoadQueueId,
        commit: bool,
    ) -> BackendResult<CheckpointInfo>;

    fn end_checkpoint(
        &self,
        checkpoint: &CheckpointInfo,
        end_timestamp: i64,
        transfer_size: i64,
        result: CheckpointResult,
        commit: bool,
    ) -> BackendResult<()>;

    fn insert_checkpoint(
        &self,
        checkpoint: &InsertCheckpoint,
        load_queue_id: LoadQueueId,
        commit: bool,
    ) -> BackendResult<()>;

    // ── Statistics ──────────────────────────────────────────────────────────

    fn insert_system_statistics(
        &self,
        testcase_id: TestcaseId,
        sample: &StatisticSample,
        commit: bool,
    ) -> BackendResult<()>;

    fn insert_user_activity_statistics(
        &self,
        testcase_id: TestcaseId,
        sample: &StatisticSample,
        commit: bool,
    ) -> BackendResult<()>;

    // ── Presence checks and cache ───────────────────────────────────────────

    fn is_run_present(&self, run_id: RunId) -> BackendResult<bool>;

    fn is_suite_present(&self, suite_id: SuiteId) -> BackendResult<bool>;

    fn is_testcase_present(&self, testcase_id: TestcaseId) -> BackendResult<bool>;

    /// Commit everything held in the batch cache.
    fn flush_cache(&self) -> BackendResult<()>;
}
