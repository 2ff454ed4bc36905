//! SQLite implementation of the [`TaskStore`] port.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::errors::{ExecuteError, ExecuteResult};
use crate::domain::models::task::{is_agent_placeholder, Complexity, DependencyEdge, DependencyKind, IssueType, Task, TaskStatus};
use crate::domain::models::Plan;
use crate::domain::ports::TaskStore;

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, project_id: &str, task: &Task) -> ExecuteResult<()> {
        sqlx::query(
            r#"INSERT INTO tasks (id, project_id, title, description, priority, issue_type,
               status, close_reason, assignee, complexity, created_at, updated_at, started_at,
               completed_at, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&task.id)
        .bind(project_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(i64::from(task.priority))
        .bind(task.issue_type.as_str())
        .bind(task.status.as_str())
        .bind(&task.close_reason)
        .bind(&task.assignee)
        .bind(task.complexity.map(complexity_str))
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.version as i64)
        .execute(&self.pool)
        .await?;

        for label in &task.labels {
            self.add_label(project_id, &task.id, label).await?;
        }
        for dep in &task.dependencies {
            sqlx::query(
                "INSERT OR IGNORE INTO task_dependencies (project_id, task_id, depends_on, kind) VALUES (?, ?, ?, ?)",
            )
            .bind(project_id)
            .bind(&task.id)
            .bind(&dep.depends_on)
            .bind(dep.kind.as_str())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn load_labels(&self, project_id: &str, task_id: &str) -> ExecuteResult<BTreeSet<String>> {
        let rows = sqlx::query("SELECT label FROM task_labels WHERE project_id = ? AND task_id = ?")
            .bind(project_id)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("label")).collect())
    }

    async fn load_dependencies(&self, project_id: &str, task_id: &str) -> ExecuteResult<Vec<DependencyEdge>> {
        let rows = sqlx::query("SELECT depends_on, kind FROM task_dependencies WHERE project_id = ? AND task_id = ?")
            .bind(project_id)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let kind = DependencyKind::from_str(&r.get::<String, _>("kind"))?;
                Some(DependencyEdge {
                    depends_on: r.get::<String, _>("depends_on"),
                    kind,
                })
            })
            .collect())
    }

    async fn row_to_task(&self, project_id: &str, row: &sqlx::sqlite::SqliteRow) -> ExecuteResult<Task> {
        let id: String = row.get("id");
        let labels = self.load_labels(project_id, &id).await?;
        let dependencies = self.load_dependencies(project_id, &id).await?;

        Ok(Task {
            id: id.clone(),
            title: row.get("title"),
            description: row.get("description"),
            priority: row.get::<i64, _>("priority") as u8,
            issue_type: IssueType::from_str(&row.get::<String, _>("issue_type")).unwrap_or(IssueType::Task),
            status: TaskStatus::from_str(&row.get::<String, _>("status")).unwrap_or(TaskStatus::Open),
            close_reason: row.get("close_reason"),
            assignee: row.get("assignee"),
            labels,
            dependencies,
            complexity: row
                .get::<Option<String>, _>("complexity")
                .and_then(|s| complexity_from_str(&s)),
            created_at: parse_dt(row.get("created_at"))?,
            updated_at: parse_dt(row.get("updated_at"))?,
            started_at: row.get::<Option<String>, _>("started_at").map(|s| parse_dt(s)).transpose()?,
            completed_at: row.get::<Option<String>, _>("completed_at").map(|s| parse_dt(s)).transpose()?,
            version: row.get::<i64, _>("version") as u64,
        })
    }

    async fn persist(&self, project_id: &str, task: &Task) -> ExecuteResult<()> {
        sqlx::query(
            r#"UPDATE tasks SET title = ?, description = ?, priority = ?, issue_type = ?,
               status = ?, close_reason = ?, assignee = ?, complexity = ?, updated_at = ?,
               started_at = ?, completed_at = ?, version = ? WHERE project_id = ? AND id = ?"#,
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(i64::from(task.priority))
        .bind(task.issue_type.as_str())
        .bind(task.status.as_str())
        .bind(&task.close_reason)
        .bind(&task.assignee)
        .bind(task.complexity.map(complexity_str))
        .bind(task.updated_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.version as i64)
        .bind(project_id)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM task_labels WHERE project_id = ? AND task_id = ?")
            .bind(project_id)
            .bind(&task.id)
            .execute(&self.pool)
            .await?;
        for label in &task.labels {
            self.add_label(project_id, &task.id, label).await?;
        }
        Ok(())
    }

    async fn load_task(&self, project_id: &str, task_id: &str) -> ExecuteResult<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE project_id = ? AND id = ?")
            .bind(project_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ExecuteError::TaskNotFound(task_id.to_string()))?;
        self.row_to_task(project_id, &row).await
    }
}

fn parse_dt(raw: String) -> ExecuteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ExecuteError::Database(e.to_string()))
}

fn complexity_str(c: Complexity) -> &'static str {
    match c {
        Complexity::Simple => "simple",
        Complexity::Complex => "complex",
    }
}

fn complexity_from_str(s: &str) -> Option<Complexity> {
    match s {
        "simple" => Some(Complexity::Simple),
        "complex" => Some(Complexity::Complex),
        _ => None,
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn ready(&self, project_id: &str) -> ExecuteResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE project_id = ? AND status = 'open' ORDER BY priority ASC, created_at ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut ready = Vec::new();
        for row in &rows {
            let task = self.row_to_task(project_id, row).await?;
            if !task.has_admittable_assignee() {
                continue;
            }
            let blockers: Vec<&str> = task.blockers().collect();
            if blockers.is_empty() {
                ready.push(task);
                continue;
            }
            let mut all_closed = true;
            for blocker_id in blockers {
                match self.load_task(project_id, blocker_id).await {
                    Ok(blocker) if blocker.status == TaskStatus::Closed => {}
                    _ => {
                        all_closed = false;
                        break;
                    }
                }
            }
            if all_closed {
                ready.push(task);
            }
        }
        Ok(ready)
    }

    async fn show(&self, project_id: &str, task_id: &str) -> ExecuteResult<Task> {
        self.load_task(project_id, task_id).await
    }

    async fn list_all(&self, project_id: &str) -> ExecuteResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at ASC")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(self.row_to_task(project_id, row).await?);
        }
        Ok(tasks)
    }

    async fn update(&self, project_id: &str, task_id: &str, mutate: &dyn Fn(&mut Task)) -> ExecuteResult<Task> {
        let mut task = self.load_task(project_id, task_id).await?;
        mutate(&mut task);
        task.updated_at = Utc::now();
        task.version += 1;
        task.validate().map_err(ExecuteError::ValidationFailed)?;
        self.persist(project_id, &task).await?;
        Ok(task)
    }

    async fn close(&self, project_id: &str, task_id: &str, reason: &str) -> ExecuteResult<Task> {
        self.update(project_id, task_id, &|task| {
            task.close();
            task.close_reason = Some(reason.to_string());
        })
        .await
    }

    async fn block(&self, project_id: &str, task_id: &str, reason: &str) -> ExecuteResult<Task> {
        self.update(project_id, task_id, &|task| {
            task.block(reason.to_string());
        })
        .await
    }

    async fn add_label(&self, project_id: &str, task_id: &str, label: &str) -> ExecuteResult<()> {
        sqlx::query("INSERT OR IGNORE INTO task_labels (project_id, task_id, label) VALUES (?, ?, ?)")
            .bind(project_id)
            .bind(task_id)
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_label(&self, project_id: &str, task_id: &str, label: &str) -> ExecuteResult<()> {
        sqlx::query("DELETE FROM task_labels WHERE project_id = ? AND task_id = ? AND label = ?")
            .bind(project_id)
            .bind(task_id)
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_cumulative_attempts(&self, project_id: &str, task_id: &str) -> ExecuteResult<u32> {
        let task = self.load_task(project_id, task_id).await?;
        Ok(task.attempts())
    }

    async fn set_cumulative_attempts(&self, project_id: &str, task_id: &str, n: u32) -> ExecuteResult<()> {
        self.update(project_id, task_id, &move |task| task.set_attempts(n)).await?;
        Ok(())
    }

    async fn are_all_blockers_closed(&self, project_id: &str, task_id: &str) -> ExecuteResult<bool> {
        let task = self.load_task(project_id, task_id).await?;
        for blocker_id in task.blockers() {
            let blocker = self.load_task(project_id, blocker_id).await?;
            if blocker.status != TaskStatus::Closed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn get_plan(&self, project_id: &str, epic_task_id: &str) -> ExecuteResult<Option<Plan>> {
        let row = sqlx::query("SELECT * FROM plans WHERE project_id = ? AND epic_task_id = ?")
            .bind(project_id)
            .bind(epic_task_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Plan {
            epic_task_id: row.get("epic_task_id"),
            title: row.get("title"),
            summary: row.get("summary"),
            complexity: row
                .get::<Option<String>, _>("complexity")
                .and_then(|s| complexity_from_str(&s)),
            created_at: parse_dt(row.get("created_at"))?,
            updated_at: parse_dt(row.get("updated_at"))?,
        }))
    }

    async fn get_status_map(&self, project_id: &str) -> ExecuteResult<HashMap<String, TaskStatus>> {
        let rows = sqlx::query("SELECT id, status FROM tasks WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let id: String = r.get("id");
                let status = TaskStatus::from_str(&r.get::<String, _>("status"))?;
                Some((id, status))
            })
            .collect())
    }
}
