//! Wire error codes.
//!
//! Failures that cross a process boundary carry one of these codes plus a
//! message string. The set is closed; a code this build does not know decodes
//! as [`ErrorCode::Remote`].
//!
//! | Code      | Variant            |
//! |-----------|--------------------|
//! | RLG-E001  | CapacityExceeded   |
//! | RLG-E002  | StateViolation     |
//! | RLG-E003  | DeletedEntity      |
//! | RLG-E004  | Connectivity       |
//! | RLG-E005  | Persistence        |
//! | RLG-E006  | LoadQueue          |
//! | RLG-E007  | ChannelClosed      |
//! | RLG-E099  | Remote             |

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Channel queue full, event rejected
    CapacityExceeded,
    /// Event illegal in the channel's life-cycle state
    StateViolation,
    /// Target entity was removed by an external actor
    DeletedEntity,
    /// Backend unreachable
    Connectivity,
    /// Backend rejected a write
    Persistence,
    /// Load-queue or checkpoint bookkeeping error
    LoadQueue,
    /// Channel shut down
    ChannelClosed,
    /// Anything else, including codes from newer peers
    #[serde(other)]
    Remote,
}

impl ErrorCode {
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::CapacityExceeded => 1,
            Self::StateViolation => 2,
            Self::DeletedEntity => 3,
            Self::Connectivity => 4,
            Self::Persistence => 5,
            Self::LoadQueue => 6,
            Self::ChannelClosed => 7,
            Self::Remote => 99,
        }
    }

    /// Formatted code string, e.g. `RLG-E001`.
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("RLG-E{:03}", self.code_number())
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::CapacityExceeded => "Too many events queued for the channel",
            Self::StateViolation => "Event not allowed in the current life-cycle state",
            Self::DeletedEntity => "Target entity was deleted",
            Self::Connectivity => "Database unreachable",
            Self::Persistence => "Database write failed",
            Self::LoadQueue => "Load queue bookkeeping error",
            Self::ChannelClosed => "Channel closed",
            Self::Remote => "Remote error",
        }
    }

    /// Whether a producer may retry the same call later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity)
    }

    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::CapacityExceeded,
            Self::StateViolation,
            Self::DeletedEntity,
            Self::Connectivity,
            Self::Persistence,
            Self::LoadQueue,
            Self::ChannelClosed,
            Self::Remote,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}
