//! In-memory slot assignment.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

/// Which half of the coding/review cycle a Slot is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Coding,
    Review,
    Rebase,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Review => "review",
            Self::Rebase => "rebase",
        }
    }

    /// Parse the `phase` field of a persisted `AssignmentRecord`,
    /// defaulting to `Coding` for anything unrecognized.
    pub fn from_assignment_str(s: &str) -> Self {
        match s {
            "review" => Self::Review,
            "rebase" => Self::Rebase,
            _ => Self::Coding,
        }
    }
}

/// An in-memory assignment of a task to a phase and a running agent.
///
/// A ProjectRunner holds at most `maxSlots` of these. Created when the
/// runner admits a task; destroyed when the task closes, blocks, or is
/// reclaimed by recovery.
pub struct Slot {
    pub task_id: String,
    pub title: String,
    pub branch_name: String,
    pub worktree_path: std::path::PathBuf,
    pub attempt: u32,
    pub phase: Phase,
    pub agent_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    /// The background task driving this slot's PhaseExecutor.
    pub handle: Option<JoinHandle<()>>,
    /// Monotonic clock anchor for inactivity/guard timeouts.
    pub phase_started: Instant,
}

impl Slot {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>, branch_name: impl Into<String>, worktree_path: std::path::PathBuf, attempt: u32) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            branch_name: branch_name.into(),
            worktree_path,
            attempt,
            phase: Phase::Coding,
            agent_pid: None,
            started_at: Utc::now(),
            handle: None,
            phase_started: Instant::now(),
        }
    }

    pub fn branch_for(task_id: &str) -> String {
        format!("opensprint/{task_id}")
    }

    pub fn enter_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.phase_started = Instant::now();
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("task_id", &self.task_id)
            .field("branch_name", &self.branch_name)
            .field("attempt", &self.attempt)
            .field("phase", &self.phase)
            .field("agent_pid", &self.agent_pid)
            .finish()
    }
}
