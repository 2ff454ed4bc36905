//! Agent-written terminal result document.

use serde::{Deserialize, Serialize};

/// Terminal status an agent can report in `result.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
    Approved,
    Rejected,
}

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        true
    }

    /// The process exit code the state machine treats this status as if
    /// the agent never exited on its own.
    pub fn as_exit_code(&self) -> i32 {
        match self {
            Self::Success | Self::Approved => 0,
            Self::Failed | Self::Rejected => 1,
        }
    }
}

/// One reported test outcome, free-form beyond pass/fail + message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: bool,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Terminal document an agent writes to
/// `<workspace>/.opensprint/active/<taskId>/result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultDocument {
    pub status: ResultStatus,
    pub summary: String,
    #[serde(default)]
    pub issues: Option<Vec<String>>,
    #[serde(default)]
    pub test_results: Option<TestResults>,
}
