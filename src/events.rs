//! Events broadcast to subscribers (`SPEC_FULL.md` §6), delivered
//! at-least-once to the subscriber layer.

use serde::{Deserialize, Serialize};

use crate::domain::models::ResultStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTaskSummary {
    pub task_id: String,
    pub title: String,
    pub phase: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecuteEvent {
    #[serde(rename = "execute.status")]
    Status {
        active_tasks: Vec<ActiveTaskSummary>,
        queue_depth: u32,
        total_done: u64,
        total_failed: u64,
    },
    #[serde(rename = "agent.output")]
    AgentOutput { task_id: String, chunk: String },
    #[serde(rename = "agent.completed")]
    AgentCompleted {
        task_id: String,
        status: ResultStatus,
        test_results_passed: Option<bool>,
    },
    #[serde(rename = "task.updated")]
    TaskUpdated { task_id: String },
}
