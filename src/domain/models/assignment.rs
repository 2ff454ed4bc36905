//! Durable assignment record, the handoff file recovery reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::slot::Phase;

/// Role an agent subprocess plays in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coder,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
        }
    }
}

/// A durable copy of a Slot's essentials, written to
/// `<workspace>/.opensprint/active/<taskId>/assignment.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub task_id: String,
    pub phase: String,
    pub branch_name: String,
    pub worktree_path: String,
    pub attempt: u32,
    pub agent_pid: Option<u32>,
    pub heartbeat_path: String,
    pub agent_role: AgentRole,
    pub created_at: DateTime<Utc>,
}

impl AssignmentRecord {
    pub fn new(
        task_id: impl Into<String>,
        phase: Phase,
        branch_name: impl Into<String>,
        worktree_path: impl Into<String>,
        attempt: u32,
        agent_role: AgentRole,
    ) -> Self {
        let task_id = task_id.into();
        let worktree_path = worktree_path.into();
        let heartbeat_path = format!("{worktree_path}/.opensprint/active/{task_id}/heartbeat.json");
        Self {
            task_id,
            phase: phase.as_str().to_string(),
            branch_name: branch_name.into(),
            worktree_path,
            attempt,
            agent_pid: None,
            heartbeat_path,
            agent_role,
            created_at: Utc::now(),
        }
    }
}
