//! Plan domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Complexity;

/// A parent artifact owning an epic task. Carries a complexity estimate
/// inherited by child tasks that omit their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub epic_task_id: String,
    pub title: String,
    pub summary: String,
    pub complexity: Option<Complexity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(epic_task_id: impl Into<String>, title: impl Into<String>, summary: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            epic_task_id: epic_task_id.into(),
            title: title.into(),
            summary: summary.into(),
            complexity: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolve a child task's complexity: its own if set, else the plan's.
    pub fn resolve_complexity(&self, task_complexity: Option<Complexity>) -> Option<Complexity> {
        task_complexity.or(self.complexity)
    }
}
