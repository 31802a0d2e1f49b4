//! Common types used across runlog components.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

entity_id!(
    /// Database id of a run.
    RunId
);
entity_id!(
    /// Database id of a suite.
    SuiteId
);
entity_id!(
    /// Database id of a testcase.
    TestcaseId
);
entity_id!(
    /// Database id of a load queue.
    LoadQueueId
);
entity_id!(
    /// Database id of a single checkpoint row.
    CheckpointId
);

/// Identity of a logical event stream (one execution thread or remote caller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Position of a channel in the run → suite → testcase hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifeCycleState {
    #[default]
    Initialized,
    RunStarted,
    SuiteStarted,
    TestcaseStarted,
}

impl LifeCycleState {
    /// Depth in the hierarchy, `Initialized` being the root.
    pub fn depth(self) -> u8 {
        match self {
            Self::Initialized => 0,
            Self::RunStarted => 1,
            Self::SuiteStarted => 2,
            Self::TestcaseStarted => 3,
        }
    }
}

impl fmt::Display for LifeCycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "INITIALIZED"),
            Self::RunStarted => write!(f, "RUN_STARTED"),
            Self::SuiteStarted => write!(f, "SUITE_STARTED"),
            Self::TestcaseStarted => write!(f, "TEST_CASE_STARTED"),
        }
    }
}

/// Life-cycle requirement an event places on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "state")]
pub enum Expectation {
    Exactly(LifeCycleState),
    AtLeast(LifeCycleState),
    Any,
}

impl Expectation {
    pub fn is_met_by(self, state: LifeCycleState) -> bool {
        match self {
            Self::Exactly(expected) => state == expected,
            Self::AtLeast(expected) => state.depth() >= expected.depth(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exactly(state) => write!(f, "{state}"),
            Self::AtLeast(state) => write!(f, "at least {state}"),
            Self::Any => write!(f, "any state"),
        }
    }
}

/// How long a producer waits on a synchronous event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    /// Suite and testcase level events.
    Standard,
    /// Run level events, which may include first-time schema checks.
    Long,
}

/// Final outcome of a testcase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestcaseResult {
    Failed,
    Passed,
    Skipped,
    Running,
}

impl TestcaseResult {
    /// Integer code stored by persistence backends.
    pub fn code(self) -> i32 {
        match self {
            Self::Failed => 0,
            Self::Passed => 1,
            Self::Skipped => 2,
            Self::Running => 4,
        }
    }
}

/// Outcome of a checkpoint or a load queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointResult {
    Failed,
    Passed,
    Running,
}

impl CheckpointResult {
    pub fn code(self) -> i32 {
        match self {
            Self::Failed => 0,
            Self::Passed => 1,
            Self::Running => 4,
        }
    }
}

/// Severity of a free-text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageLevel {
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
    System,
}

impl MessageLevel {
    pub fn code(self) -> i32 {
        match self {
            Self::Fatal => 1,
            Self::Error => 2,
            Self::Warn => 3,
            Self::Info => 4,
            Self::Debug => 5,
            Self::Trace => 6,
            Self::System => 7,
        }
    }
}

/// Ids of the channel after an event was processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOutcome {
    pub run_id: Option<RunId>,
    pub suite_id: Option<SuiteId>,
    pub testcase_id: Option<TestcaseId>,
}

/// Point-in-time view of a channel, as published by its worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub life_cycle_state: LifeCycleState,
    pub run_id: Option<RunId>,
    pub suite_id: Option<SuiteId>,
    pub testcase_id: Option<TestcaseId>,
    pub last_executed_testcase_id: Option<TestcaseId>,
    /// Events accepted but not yet consumed by the worker.
    pub pending_events: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_matches_only_the_named_state() {
        let rule = Expectation::Exactly(LifeCycleState::SuiteStarted);
        assert!(rule.is_met_by(LifeCycleState::SuiteStarted));
        assert!(!rule.is_met_by(LifeCycleState::RunStarted));
        assert!(!rule.is_met_by(LifeCycleState::TestcaseStarted));
    }

    #[test]
    fn test_at_least_accepts_deeper_states() {
        let rule = Expectation::AtLeast(LifeCycleState::RunStarted);
        assert!(!rule.is_met_by(LifeCycleState::Initialized));
        assert!(rule.is_met_by(LifeCycleState::RunStarted));
        assert!(rule.is_met_by(LifeCycleState::SuiteStarted));
        assert!(rule.is_met_by(LifeCycleState::TestcaseStarted));
    }

    #[test]
    fn test_any_accepts_everything() {
        for state in [
            LifeCycleState::Initialized,
            LifeCycleState::RunStarted,
            LifeCycleState::SuiteStarted,
            LifeCycleState::TestcaseStarted,
        ] {
            assert!(Expectation::Any.is_met_by(state));
        }
    }

    #[test]
    fn test_result_codes_are_stable() {
        assert_eq!(TestcaseResult::Failed.code(), 0);
        assert_eq!(TestcaseResult::Passed.code(), 1);
        assert_eq!(TestcaseResult::Skipped.code(), 2);
        assert_eq!(TestcaseResult::Running.code(), 4);
        assert_eq!(CheckpointResult::Running.code(), 4);
        assert_eq!(MessageLevel::Fatal.code(), 1);
        assert_eq!(MessageLevel::System.code(), 7);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&TestcaseId(42)).unwrap();
        assert_eq!(json, "42");
        let channel: ChannelId = serde_json::from_str("\"agent-1\"").unwrap();
        assert_eq!(channel.as_str(), "agent-1");
    }

    #[test]
    fn test_state_display_uses_wire_names() {
        assert_eq!(LifeCycleState::TestcaseStarted.to_string(), "TEST_CASE_STARTED");
        assert_eq!(
            Expectation::AtLeast(LifeCycleState::RunStarted).to_string(),
            "at least RUN_STARTED"
        );
    }
}
