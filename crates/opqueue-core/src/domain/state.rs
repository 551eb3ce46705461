//! Run-state machine for delegated operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle stage of an operation.
///
/// State transitions:
/// - Scheduled -> Queued -> Running -> Completed
/// - Scheduled | Queued | Running -> Failed
///
/// Nothing ever moves back to Queued or Scheduled once it has left them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Submitted by a remote caller, not yet released to the queue.
    Scheduled,

    /// Ready to be claimed by an orchestrator.
    Queued,

    /// Claimed and executing.
    Running,

    /// Finished successfully.
    Completed,

    /// Finished with an error (or failed by hand).
    Failed,
}

impl RunState {
    pub const ALL: [RunState; 5] = [
        RunState::Scheduled,
        RunState::Queued,
        RunState::Running,
        RunState::Completed,
        RunState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Scheduled => "scheduled",
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// States a record may be in for a transition into `self` to apply.
    pub fn predecessors(self) -> &'static [RunState] {
        match self {
            RunState::Scheduled => &[],
            RunState::Queued => &[RunState::Scheduled],
            RunState::Running => &[RunState::Queued],
            RunState::Completed => &[RunState::Running],
            RunState::Failed => &[RunState::Scheduled, RunState::Queued, RunState::Running],
        }
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        next.predecessors().contains(&self)
    }

    /// Name of the timestamp field set when a record enters this state.
    pub fn timestamp_field(self) -> &'static str {
        match self {
            RunState::Scheduled => "scheduled_at",
            RunState::Queued => "queued_at",
            RunState::Running => "started_at",
            RunState::Completed => "completed_at",
            RunState::Failed => "failed_at",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown run state `{s}`"))
    }
}
