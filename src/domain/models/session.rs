//! Session archive metadata: an immutable per-attempt record created on
//! slot teardown under `<repo>/.opensprint/sessions/<taskId>-<attempt>/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result_doc::ResultStatus;

/// Why a session ended, independent of the agent's own result status —
/// covers paths where no result document was ever produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Success,
    Failed,
    Approved,
    Rejected,
    Interrupted,
    Cancelled,
}

impl From<ResultStatus> for SessionOutcome {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Success => Self::Success,
            ResultStatus::Failed => Self::Failed,
            ResultStatus::Approved => Self::Approved,
            ResultStatus::Rejected => Self::Rejected,
        }
    }
}

/// Metadata written alongside `output.log`, `diff`, and `result.json`
/// inside a session archive directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub task_id: String,
    pub attempt: u32,
    pub outcome: SessionOutcome,
    pub branch_name: String,
    pub started_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

impl SessionMetadata {
    pub fn dir_name(task_id: &str, attempt: u32) -> String {
        format!("{task_id}-{attempt}")
    }
}
