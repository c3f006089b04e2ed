//! Per-rule build states
//!
//! ```text
//! UNKNOWN -> CACHED -> (optimize) PRUNED
//!         -> STALE  -> RUNNING -> DONE | FAILED
//!                   -> BLOCKED
//! ```
//!
//! A forced rebuild turns `CACHED` into `STALE` during evaluation. During
//! execution `CACHED` becomes `STALE` again when its outputs cannot be
//! fetched from an optional remote, and `FAILED` when a restore or a
//! mandatory upload fails.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    Unknown,
    Cached,
    Stale,
    Running,
    Done,
    Failed,
    Blocked,
    Pruned,
}

impl RuleState {
    /// Whether the state can still change during a build
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cached | Self::Done | Self::Failed | Self::Blocked | Self::Pruned
        )
    }

    /// States that count against the exit status
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Blocked)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_become(&self, next: RuleState) -> bool {
        use RuleState::*;
        matches!(
            (self, next),
            (Unknown, Cached)
                | (Unknown, Stale)
                | (Cached, Pruned)
                | (Cached, Stale)
                | (Cached, Failed)
                | (Stale, Running)
                | (Stale, Blocked)
                | (Running, Done)
                | (Running, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Cached => "CACHED",
            Self::Stale => "STALE",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
            Self::Pruned => "PRUNED",
        }
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
