//! `opensprint task ...` — operates directly on the [`TaskStore`], bypassing
//! the orchestrator (`SPEC_FULL.md` §6).

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, ContentArrangement, Table};
use serde::Serialize;

use crate::cli::output::{print, CommandOutput};
use crate::domain::models::{IssueType, Task};
use crate::domain::ports::TaskStore;
use crate::infrastructure::database::SqliteTaskStore;

#[derive(Serialize)]
struct TaskView {
    id: String,
    title: String,
    status: String,
    priority: u8,
    issue_type: String,
    assignee: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status.as_str().to_string(),
            priority: task.priority,
            issue_type: task.issue_type.as_str().to_string(),
            assignee: task.assignee.clone(),
        }
    }
}

impl CommandOutput for TaskView {
    fn to_human(&self) -> String {
        format!(
            "{} [{}] {} (priority {}, {})",
            self.id, self.status, self.title, self.priority, self.issue_type
        )
    }
}

#[derive(Serialize)]
struct TaskListView(Vec<TaskView>);

impl CommandOutput for TaskListView {
    fn to_human(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(presets::NOTHING)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("ID"),
                Cell::new("STATUS"),
                Cell::new("PRI"),
                Cell::new("TYPE"),
                Cell::new("ASSIGNEE"),
                Cell::new("TITLE"),
            ]);
        for task in &self.0 {
            table.add_row(vec![
                task.id.clone(),
                task.status.clone(),
                task.priority.to_string(),
                task.issue_type.clone(),
                task.assignee.clone().unwrap_or_default(),
                task.title.clone(),
            ]);
        }
        table.to_string()
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_submit(
    store: &SqliteTaskStore,
    project: &str,
    id: &str,
    title: &str,
    description: &str,
    priority: u8,
    issue_type: &str,
    json: bool,
) -> Result<()> {
    let mut task = Task::new(id, title, description);
    task.priority = priority.min(4);
    task.issue_type = IssueType::from_str(issue_type)
        .with_context(|| format!("invalid issue type: {issue_type}"))?;
    task.validate().map_err(anyhow::Error::msg)?;

    store
        .insert(project, &task)
        .await
        .with_context(|| format!("failed to submit task {id}"))?;

    print(&TaskView::from(&task), json);
    Ok(())
}

pub async fn handle_list(store: &SqliteTaskStore, project: &str, json: bool) -> Result<()> {
    let tasks = store
        .list_all(project)
        .await
        .with_context(|| format!("failed to list tasks for project {project}"))?;
    let views: Vec<TaskView> = tasks.iter().map(TaskView::from).collect();
    print(&TaskListView(views), json);
    Ok(())
}

pub async fn handle_show(store: &SqliteTaskStore, project: &str, id: &str, json: bool) -> Result<()> {
    let task = store
        .show(project, id)
        .await
        .with_context(|| format!("task {id} not found in project {project}"))?;
    print(&TaskView::from(&task), json);
    Ok(())
}
