//! Property tests for the ready-set and attempts-counter invariants
//! (`spec.md` §8).

use opensprint_execute::domain::models::{DependencyEdge, DependencyKind, Task, TaskStatus};
use opensprint_execute::domain::ports::TaskStore;
use opensprint_execute::infrastructure::database::{connect, SqliteTaskStore};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

async fn store() -> SqliteTaskStore {
    let pool = connect(":memory:", 1).await.expect("connect");
    SqliteTaskStore::new(pool)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    /// A linear chain of `blocks` edges (task i depends on task i-1) never
    /// admits a task into the ready set while its immediate blocker is
    /// still open, regardless of chain length.
    #[test]
    fn prop_ready_set_respects_blocker_chain(size in 1usize..12) {
        runtime().block_on(async move {
            let store = store().await;
            let ids: Vec<String> = (0..size).map(|i| format!("epic1.{}", i + 1)).collect();

            for (i, id) in ids.iter().enumerate() {
                let mut task = Task::new(id.clone(), format!("Task {id}"), "");
                if i > 0 {
                    task.dependencies.push(DependencyEdge {
                        depends_on: ids[i - 1].clone(),
                        kind: DependencyKind::Blocks,
                    });
                }
                store.insert("proj1", &task).await.map_err(|e| TestCaseError::fail(e.to_string()))?;
            }

            let ready = store.ready("proj1").await.map_err(|e| TestCaseError::fail(e.to_string()))?;
            let ready_ids: std::collections::HashSet<&str> = ready.iter().map(|t| t.id.as_str()).collect();

            // Only the head of the chain has no blocker, so only it is ready.
            prop_assert_eq!(ready.len(), 1);
            prop_assert!(ready_ids.contains(ids[0].as_str()));

            // Closing the chain one link at a time should reveal exactly
            // the next task and never more than one at a time.
            for i in 0..size - 1 {
                store
                    .update("proj1", &ids[i], &|t| t.close())
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let ready = store.ready("proj1").await.map_err(|e| TestCaseError::fail(e.to_string()))?;
                let ready_ids: std::collections::HashSet<&str> = ready.iter().map(|t| t.id.as_str()).collect();
                prop_assert!(ready_ids.contains(ids[i + 1].as_str()));
            }
            Ok(())
        })?;
    }

    /// Tasks with no dependency edges at all are always in the ready set
    /// together, independent of insertion order.
    #[test]
    fn prop_independent_tasks_all_ready(size in 1usize..20) {
        runtime().block_on(async move {
            let store = store().await;
            let ids: Vec<String> = (0..size).map(|i| format!("epic2.{}", i + 1)).collect();
            for id in &ids {
                let task = Task::new(id.clone(), format!("Task {id}"), "");
                store.insert("proj2", &task).await.map_err(|e| TestCaseError::fail(e.to_string()))?;
            }

            let ready = store.ready("proj2").await.map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(ready.len(), size);
            let input_ids: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
            let output_ids: std::collections::HashSet<&str> = ready.iter().map(|t| t.id.as_str()).collect();
            prop_assert_eq!(input_ids, output_ids);
            Ok(())
        })?;
    }

    /// `increment_attempts` always leaves exactly one `attempts:*` label
    /// and the counter equals the number of increments, for any sequence
    /// of increments.
    #[test]
    fn prop_attempts_counter_is_single_valued(n in 0u32..50) {
        let mut task = Task::new("epic3.1", "Title", "Desc");
        for _ in 0..n {
            task.increment_attempts();
        }
        prop_assert_eq!(task.attempts(), n);
        prop_assert!(task.validate().is_ok());
        let attempt_labels = task
            .labels
            .iter()
            .filter(|l| l.starts_with(opensprint_execute::domain::models::ATTEMPTS_LABEL_PREFIX))
            .count();
        prop_assert!(attempt_labels <= 1);
    }
}
