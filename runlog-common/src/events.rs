//! Test life-cycle events.
//!
//! An [`EventRecord`] is created by a producer, enqueued once on its channel and
//! consumed exactly once by that channel's worker. The payload is a closed,
//! serde-tagged [`Event`] set that the processor dispatches exhaustively.

use crate::types::{
    CheckpointResult, Expectation, LifeCycleState, MessageLevel, RunId, SuiteId, TestcaseId,
    TestcaseResult, TimeoutClass,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRun {
    pub run_name: String,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub version_name: String,
    #[serde(default)]
    pub build_name: String,
    #[serde(default)]
    pub host_name: String,
}

/// Partial run update. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
}

impl UpdateRun {
    /// An update that only renames the run.
    pub fn rename(run_name: impl Into<String>) -> Self {
        Self {
            run_name: Some(run_name.into()),
            ..Self::default()
        }
    }
}

impl From<&StartRun> for UpdateRun {
    fn from(start: &StartRun) -> Self {
        Self {
            run_name: Some(start.run_name.clone()),
            os_name: Some(start.os_name.clone()),
            product_name: Some(start.product_name.clone()),
            version_name: Some(start.version_name.clone()),
            build_name: Some(start.build_name.clone()),
            user_note: None,
            host_name: Some(start.host_name.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSuite {
    pub suite_name: String,
    #[serde(default)]
    pub package_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSuite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTestcase {
    pub suite_full_name: String,
    /// Short suite name used to look up an already opened suite of this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_simple_name: Option<String>,
    pub scenario_name: String,
    #[serde(default)]
    pub scenario_description: String,
    pub testcase_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTestcase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testcase_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TestcaseResult>,
}

/// Ids of a testcase opened by another process, adopted by a joining channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTestcase {
    pub run_id: RunId,
    pub suite_id: SuiteId,
    pub testcase_id: TestcaseId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metainfo {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseMetainfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testcase_id: Option<TestcaseId>,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartLoadQueue {
    pub name: String,
    #[serde(default)]
    pub sequence: i32,
    #[serde(default)]
    pub hosts: String,
    #[serde(default)]
    pub threading_pattern: String,
    #[serde(default)]
    pub number_threads: i32,
    #[serde(default)]
    pub machine: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndLoadQueue {
    pub name: String,
    pub result: CheckpointResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterThread {
    pub thread_name: String,
    pub load_queue_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCheckpoint {
    pub name: String,
    pub thread_name: String,
    pub start_timestamp: i64,
    #[serde(default)]
    pub transfer_unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndCheckpoint {
    pub name: String,
    pub thread_name: String,
    pub end_timestamp: i64,
    #[serde(default)]
    pub transfer_size: i64,
    pub result: CheckpointResult,
}

/// A checkpoint measured entirely on the producer side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertCheckpoint {
    pub name: String,
    pub thread_name: String,
    pub start_timestamp: i64,
    pub response_time: i64,
    #[serde(default)]
    pub transfer_size: i64,
    #[serde(default)]
    pub transfer_unit: String,
    pub result: CheckpointResult,
}

/// One sampling of a monitored machine. Ids and values are parallel
/// `_`-separated lists, as produced by the monitoring agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticSample {
    pub monitored_machine: String,
    pub statistic_ids: String,
    pub statistic_values: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertMessage {
    pub message: String,
    #[serde(default)]
    pub level: MessageLevel,
    #[serde(default)]
    pub escape_html: bool,
    /// Force the message to the run even while a suite or testcase is open.
    #[serde(default)]
    pub run_message: bool,
}

impl InsertMessage {
    pub fn new(level: MessageLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            escape_html: false,
            run_message: false,
        }
    }
}

// ── Event set ───────────────────────────────────────────────────────────────

/// Closed set of life-cycle, annotation and measurement events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    StartRun(StartRun),
    EndRun,
    UpdateRun(UpdateRun),
    StartAfterSuite,
    EndAfterSuite,
    StartSuite(StartSuite),
    EndSuite,
    UpdateSuite(UpdateSuite),
    StartAfterClass,
    EndAfterClass,
    StartTestcase(StartTestcase),
    EndTestcase { result: TestcaseResult },
    JoinTestcase(JoinTestcase),
    LeaveTestcase,
    UpdateTestcase(UpdateTestcase),
    DeleteTestcase { testcase_id: TestcaseId },
    StartAfterMethod,
    EndAfterMethod,
    AddRunMetainfo(Metainfo),
    AddScenarioMetainfo(Metainfo),
    ClearScenarioMetainfo,
    AddTestcaseMetainfo(TestcaseMetainfo),
    #[serde(rename = "START_LOADQUEUE")]
    StartLoadQueue(StartLoadQueue),
    #[serde(rename = "END_LOADQUEUE")]
    EndLoadQueue(EndLoadQueue),
    #[serde(rename = "REGISTER_THREAD_WITH_LOADQUEUE")]
    RegisterThreadWithLoadQueue(RegisterThread),
    StartCheckpoint(StartCheckpoint),
    EndCheckpoint(EndCheckpoint),
    InsertCheckpoint(InsertCheckpoint),
    InsertSystemStat(StatisticSample),
    InsertUserActivityStat(StatisticSample),
    InsertMessage(InsertMessage),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StartRun(_) => EventKind::StartRun,
            Self::EndRun => EventKind::EndRun,
            Self::UpdateRun(_) => EventKind::UpdateRun,
            Self::StartAfterSuite => EventKind::StartAfterSuite,
            Self::EndAfterSuite => EventKind::EndAfterSuite,
            Self::StartSuite(_) => EventKind::StartSuite,
            Self::EndSuite => EventKind::EndSuite,
            Self::UpdateSuite(_) => EventKind::UpdateSuite,
            Self::StartAfterClass => EventKind::StartAfterClass,
            Self::EndAfterClass => EventKind::EndAfterClass,
            Self::StartTestcase(_) => EventKind::StartTestcase,
            Self::EndTestcase { .. } => EventKind::EndTestcase,
            Self::JoinTestcase(_) => EventKind::JoinTestcase,
            Self::LeaveTestcase => EventKind::LeaveTestcase,
            Self::UpdateTestcase(_) => EventKind::UpdateTestcase,
            Self::DeleteTestcase { .. } => EventKind::DeleteTestcase,
            Self::StartAfterMethod => EventKind::StartAfterMethod,
            Self::EndAfterMethod => EventKind::EndAfterMethod,
            Self::AddRunMetainfo(_) => EventKind::AddRunMetainfo,
            Self::AddScenarioMetainfo(_) => EventKind::AddScenarioMetainfo,
            Self::ClearScenarioMetainfo => EventKind::ClearScenarioMetainfo,
            Self::AddTestcaseMetainfo(_) => EventKind::AddTestcaseMetainfo,
            Self::StartLoadQueue(_) => EventKind::StartLoadQueue,
            Self::EndLoadQueue(_) => EventKind::EndLoadQueue,
            Self::RegisterThreadWithLoadQueue(_) => EventKind::RegisterThreadWithLoadQueue,
            Self::StartCheckpoint(_) => EventKind::StartCheckpoint,
            Self::EndCheckpoint(_) => EventKind::EndCheckpoint,
            Self::InsertCheckpoint(_) => EventKind::InsertCheckpoint,
            Self::InsertSystemStat(_) => EventKind::InsertSystemStat,
            Self::InsertUserActivityStat(_) => EventKind::InsertUserActivityStat,
            Self::InsertMessage(_) => EventKind::InsertMessage,
        }
    }

    pub fn message(level: MessageLevel, message: impl Into<String>) -> Self {
        Self::InsertMessage(InsertMessage::new(level, message))
    }
}

/// Tag of an [`Event`], used for classification and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StartRun,
    EndRun,
    UpdateRun,
    StartAfterSuite,
    EndAfterSuite,
    StartSuite,
    EndSuite,
    UpdateSuite,
    StartAfterClass,
    EndAfterClass,
    StartTestcase,
    EndTestcase,
    JoinTestcase,
    LeaveTestcase,
    UpdateTestcase,
    DeleteTestcase,
    StartAfterMethod,
    EndAfterMethod,
    AddRunMetainfo,
    AddScenarioMetainfo,
    ClearScenarioMetainfo,
    AddTestcaseMetainfo,
    #[serde(rename = "START_LOADQUEUE")]
    StartLoadQueue,
    #[serde(rename = "END_LOADQUEUE")]
    EndLoadQueue,
    #[serde(rename = "REGISTER_THREAD_WITH_LOADQUEUE")]
    RegisterThreadWithLoadQueue,
    StartCheckpoint,
    EndCheckpoint,
    InsertCheckpoint,
    InsertSystemStat,
    InsertUserActivityStat,
    InsertMessage,
}

impl EventKind {
    /// Failures on these events break a hierarchy root and go back to the producer.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Self::StartRun
                | Self::StartSuite
                | Self::StartTestcase
                | Self::JoinTestcase
                | Self::StartCheckpoint
        )
    }

    /// Whether the backend may keep this write in its batch cache.
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            Self::InsertMessage
                | Self::InsertCheckpoint
                | Self::InsertSystemStat
                | Self::InsertUserActivityStat
        )
    }

    /// Events a producer waits on, and for how long.
    pub fn default_timeout_class(self) -> Option<TimeoutClass> {
        match self {
            Self::StartRun | Self::EndRun => Some(TimeoutClass::Long),
            Self::StartSuite | Self::StartTestcase | Self::EndTestcase => {
                Some(TimeoutClass::Standard)
            }
            _ => None,
        }
    }

    /// Life-cycle state the channel must be in for this event to be legal.
    pub fn expectation(self) -> Expectation {
        use LifeCycleState::*;
        match self {
            Self::StartRun | Self::JoinTestcase => Expectation::Exactly(Initialized),
            Self::EndRun | Self::StartSuite => Expectation::Exactly(RunStarted),
            Self::UpdateRun | Self::AddRunMetainfo => Expectation::AtLeast(RunStarted),
            Self::EndSuite | Self::StartTestcase => Expectation::Exactly(SuiteStarted),
            Self::UpdateSuite | Self::UpdateTestcase => Expectation::AtLeast(SuiteStarted),
            Self::EndTestcase
            | Self::LeaveTestcase
            | Self::AddScenarioMetainfo
            | Self::ClearScenarioMetainfo
            | Self::StartLoadQueue
            | Self::EndLoadQueue
            | Self::RegisterThreadWithLoadQueue
            | Self::StartCheckpoint
            | Self::EndCheckpoint
            | Self::InsertCheckpoint
            | Self::InsertSystemStat
            | Self::InsertUserActivityStat => Expectation::Exactly(TestcaseStarted),
            Self::DeleteTestcase
            | Self::AddTestcaseMetainfo
            | Self::InsertMessage
            | Self::StartAfterSuite
            | Self::EndAfterSuite
            | Self::StartAfterClass
            | Self::EndAfterClass
            | Self::StartAfterMethod
            | Self::EndAfterMethod => Expectation::Any,
        }
    }

    /// Updates that arrive before their START event are held and replayed.
    pub fn is_deferrable(self) -> bool {
        matches!(self, Self::UpdateRun | Self::UpdateSuite)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartRun => "START_RUN",
            Self::EndRun => "END_RUN",
            Self::UpdateRun => "UPDATE_RUN",
            Self::StartAfterSuite => "START_AFTER_SUITE",
            Self::EndAfterSuite => "END_AFTER_SUITE",
            Self::StartSuite => "START_SUITE",
            Self::EndSuite => "END_SUITE",
            Self::UpdateSuite => "UPDATE_SUITE",
            Self::StartAfterClass => "START_AFTER_CLASS",
            Self::EndAfterClass => "END_AFTER_CLASS",
            Self::StartTestcase => "START_TESTCASE",
            Self::EndTestcase => "END_TESTCASE",
            Self::JoinTestcase => "JOIN_TESTCASE",
            Self::LeaveTestcase => "LEAVE_TESTCASE",
            Self::UpdateTestcase => "UPDATE_TESTCASE",
            Self::DeleteTestcase => "DELETE_TESTCASE",
            Self::StartAfterMethod => "START_AFTER_METHOD",
            Self::EndAfterMethod => "END_AFTER_METHOD",
            Self::AddRunMetainfo => "ADD_RUN_METAINFO",
            Self::AddScenarioMetainfo => "ADD_SCENARIO_METAINFO",
            Self::ClearScenarioMetainfo => "CLEAR_SCENARIO_METAINFO",
            Self::AddTestcaseMetainfo => "ADD_TESTCASE_METAINFO",
            Self::StartLoadQueue => "START_LOADQUEUE",
            Self::EndLoadQueue => "END_LOADQUEUE",
            Self::RegisterThreadWithLoadQueue => "REGISTER_THREAD_WITH_LOADQUEUE",
            Self::StartCheckpoint => "START_CHECKPOINT",
            Self::EndCheckpoint => "END_CHECKPOINT",
            Self::InsertCheckpoint => "INSERT_CHECKPOINT",
            Self::InsertSystemStat => "INSERT_SYSTEM_STAT",
            Self::InsertUserActivityStat => "INSERT_USER_ACTIVITY_STAT",
            Self::InsertMessage => "INSERT_MESSAGE",
        };
        f.write_str(name)
    }
}

// ── Record ──────────────────────────────────────────────────────────────────

/// An event together with its origin and creation time (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub thread_name: String,
    pub event: Event,
    pub timestamp: i64,
}

impl EventRecord {
    /// Record stamped with the local wall clock.
    pub fn new(thread_name: impl Into<String>, event: Event) -> Self {
        Self::with_timestamp(thread_name, event, crate::now_millis())
    }

    pub fn with_timestamp(thread_name: impl Into<String>, event: Event, timestamp: i64) -> Self {
        Self {
            thread_name: thread_name.into(),
            event,
            timestamp,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Shift the record and every timestamp carried in its payload onto the
    /// reference clock.
    pub fn apply_time_offset(&mut self, offset_ms: i64) {
        if offset_ms == 0 {
            return;
        }
        self.timestamp += offset_ms;
        match &mut self.event {
            Event::StartCheckpoint(start) => start.start_timestamp += offset_ms,
            Event::EndCheckpoint(end) => end.end_timestamp += offset_ms,
            Event::InsertCheckpoint(checkpoint) => checkpoint.start_timestamp += offset_ms,
            Event::InsertSystemStat(sample) | Event::InsertUserActivityStat(sample) => {
                sample.timestamp += offset_ms
            }
            _ => {}
        }
    }
}
