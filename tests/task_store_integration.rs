use opensprint_execute::domain::models::{DependencyEdge, DependencyKind, IssueType, Task};
use opensprint_execute::domain::ports::TaskStore;
use opensprint_execute::infrastructure::database::{connect, SqliteTaskStore};

async fn store() -> SqliteTaskStore {
    let pool = connect(":memory:", 1).await.expect("failed to open in-memory database");
    SqliteTaskStore::new(pool)
}

#[tokio::test]
async fn migrations_create_expected_tables() {
    let pool = connect(":memory:", 1).await.expect("failed to open in-memory database");
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .expect("failed to query tables");

    let names: Vec<String> = rows.into_iter().map(|(n,)| n).collect();
    for table in ["tasks", "task_labels", "task_dependencies", "plans"] {
        assert!(names.iter().any(|n| n == table), "missing table {table}");
    }
}

#[tokio::test]
async fn ready_set_excludes_blocked_tasks() {
    let store = store().await;

    let mut blocker = Task::new("1.1", "Write the parser", "");
    blocker.priority = 1;
    store.insert("proj1", &blocker).await.unwrap();

    let mut blocked = Task::new("1.2", "Write the codegen", "");
    blocked.priority = 1;
    blocked.issue_type = IssueType::Task;
    blocked.dependencies.push(DependencyEdge {
        depends_on: "1.1".to_string(),
        kind: DependencyKind::Blocks,
    });
    store.insert("proj1", &blocked).await.unwrap();

    let ready = store.ready("proj1").await.unwrap();
    let ready_ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
    assert!(ready_ids.contains(&"1.1"));
    assert!(!ready_ids.contains(&"1.2"));

    store.close("proj1", "1.1", "done").await.unwrap();
    let ready = store.ready("proj1").await.unwrap();
    assert!(ready.iter().any(|t| t.id == "1.2"));
}

#[tokio::test]
async fn ready_set_orders_by_priority_then_created_at() {
    let store = store().await;

    let mut low = Task::new("2.1", "Low priority", "");
    low.priority = 4;
    store.insert("proj1", &low).await.unwrap();

    let mut high = Task::new("2.2", "High priority", "");
    high.priority = 0;
    store.insert("proj1", &high).await.unwrap();

    let ready = store.ready("proj1").await.unwrap();
    assert_eq!(ready.first().map(|t| t.id.as_str()), Some("2.2"));
}

#[tokio::test]
async fn close_sets_completed_at_and_reason() {
    let store = store().await;
    let task = Task::new("3.1", "One-off chore", "");
    store.insert("proj1", &task).await.unwrap();

    let closed = store.close("proj1", "3.1", "done").await.unwrap();
    assert_eq!(closed.close_reason.as_deref(), Some("done"));
    assert!(closed.completed_at.is_some());
}

#[tokio::test]
async fn show_unknown_task_errors() {
    let store = store().await;
    let result = store.show("proj1", "missing").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn list_all_is_scoped_per_project() {
    let store = store().await;
    store.insert("proj1", &Task::new("4.1", "Task A", "")).await.unwrap();
    store.insert("proj2", &Task::new("4.1", "Task B", "")).await.unwrap();

    let proj1_tasks = store.list_all("proj1").await.unwrap();
    assert_eq!(proj1_tasks.len(), 1);
    assert_eq!(proj1_tasks[0].title, "Task A");
}
