use serde::{Deserialize, Serialize};

use crate::domain::RunState;

/// Number of operations per run state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub scheduled: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn get(&self, state: RunState) -> u64 {
        match state {
            RunState::Scheduled => self.scheduled,
            RunState::Queued => self.queued,
            RunState::Running => self.running,
            RunState::Completed => self.completed,
            RunState::Failed => self.failed,
        }
    }

    pub(crate) fn set(&mut self, state: RunState, count: u64) {
        let slot = match state {
            RunState::Scheduled => &mut self.scheduled,
            RunState::Queued => &mut self.queued,
            RunState::Running => &mut self.running,
            RunState::Completed => &mut self.completed,
            RunState::Failed => &mut self.failed,
        };
        *slot = count;
    }

    pub fn total(&self) -> u64 {
        RunState::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Work not finished yet.
    pub fn pending(&self) -> u64 {
        self.scheduled + self.queued + self.running
    }
}
