//! Task-store port: the contract the core consumes (`SPEC_FULL.md` §6).
//!
//! The core treats the store as linearizable for the rows it touches;
//! `runWrite` is the serializable-transaction primitive other operations
//! are built from.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::errors::ExecuteResult;
use crate::domain::models::{Plan, Task, TaskStatus};

/// Contract the Execute core consumes from the task store (`SPEC_FULL.md`
/// §6). Implementations are keyed by `(projectId, taskId)`.
///
/// `update`/`close`/`block`/`add_label`/`remove_label` each run inside
/// their own serializable transaction (the `runWrite` primitive named in
/// the interface contract is an implementation detail of the adapter,
/// not part of this object-safe port).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// The ready set: open tasks whose `blocks` dependencies are all
    /// closed, not already slotted, sorted by `(priority asc, createdAt
    /// asc)`, whose assignee is empty or an `agent-N` placeholder.
    async fn ready(&self, project_id: &str) -> ExecuteResult<Vec<Task>>;

    async fn show(&self, project_id: &str, task_id: &str) -> ExecuteResult<Task>;

    /// All tasks for a project. An empty result is semantically distinct
    /// from "no tasks exist" when used for stale-slot reconciliation —
    /// callers must preserve that distinction rather than normalizing it.
    async fn list_all(&self, project_id: &str) -> ExecuteResult<Vec<Task>>;

    async fn update(&self, project_id: &str, task_id: &str, mutate: &dyn Fn(&mut Task)) -> ExecuteResult<Task>;

    async fn close(&self, project_id: &str, task_id: &str, reason: &str) -> ExecuteResult<Task>;

    async fn block(&self, project_id: &str, task_id: &str, reason: &str) -> ExecuteResult<Task>;

    async fn add_label(&self, project_id: &str, task_id: &str, label: &str) -> ExecuteResult<()>;

    async fn remove_label(&self, project_id: &str, task_id: &str, label: &str) -> ExecuteResult<()>;

    async fn get_cumulative_attempts(&self, project_id: &str, task_id: &str) -> ExecuteResult<u32>;

    async fn set_cumulative_attempts(&self, project_id: &str, task_id: &str, n: u32) -> ExecuteResult<()>;

    async fn are_all_blockers_closed(&self, project_id: &str, task_id: &str) -> ExecuteResult<bool>;

    async fn get_status_map(&self, project_id: &str) -> ExecuteResult<HashMap<String, TaskStatus>>;

    /// The plan for `epic_task_id`, if one has been recorded. A task
    /// without its own `complexity` inherits this plan's estimate
    /// (`SPEC_FULL.md` §3).
    async fn get_plan(&self, project_id: &str, epic_task_id: &str) -> ExecuteResult<Option<Plan>>;
}
