//! End-to-end seed scenarios from `spec.md` §8, driving the real
//! `Orchestrator` against a temp git repo with a fake agent executable.

use std::path::Path;
use std::time::Duration;

use opensprint_execute::domain::models::{Task, TaskStatus};
use opensprint_execute::domain::ports::TaskStore;
use opensprint_execute::infrastructure::database::{connect, SqliteTaskStore};
use opensprint_execute::services::Orchestrator;

async fn run_git(dir: &Path, args: &[&str]) {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .expect("git invocation failed");
    assert!(output.status.success(), "git {:?} failed: {}", args, String::from_utf8_lossy(&output.stderr));
}

async fn init_repo(dir: &Path) {
    tokio::fs::create_dir_all(dir).await.unwrap();
    run_git(dir, &["init", "-q", "-b", "main"]).await;
    run_git(dir, &["config", "user.email", "test@example.com"]).await;
    run_git(dir, &["config", "user.name", "Test"]).await;
    tokio::fs::write(dir.join("README.md"), b"hello\n").await.unwrap();
    run_git(dir, &["add", "-A"]).await;
    run_git(dir, &["commit", "-q", "-m", "init"]).await;
}

/// Write a project config pointing `simple_complexity_agent` at `script`,
/// forcing worktree mode, single slot, no review, and fast polling so
/// the e2e test doesn't wait on the default 2s result-poll cadence.
async fn write_config(project_dir: &Path, script: &Path, max_coding_attempts: u32) {
    let yaml = format!(
        r#"
max_concurrent_coders: 1
git_working_mode: worktree
review_mode: never
max_coding_attempts: {max_coding_attempts}
push_best_effort: true
simple_complexity_agent:
  kind: custom
  executable: "{script}"
  args: []
polling:
  output_poll_ms: 20
  result_poll_ms: 30
  recovery_interval_secs: 60
  heartbeat_interval_secs: 30
  agent_kill_grace_secs: 2
  inactivity_timeout_secs: 1200
"#,
        script = script.display(),
    );
    let config_dir = project_dir.join(".opensprint");
    tokio::fs::create_dir_all(&config_dir).await.unwrap();
    tokio::fs::write(config_dir.join("config.yaml"), yaml).await.unwrap();
}

/// Like [`write_config`] but for the branches-mode seed scenario, which
/// needs `maxConcurrentCoders` left at 3 so the single-slot enforcement
/// visibly comes from `gitWorkingMode: branches`, not from capacity.
async fn write_branches_config(project_dir: &Path, script: &Path) {
    let yaml = format!(
        r#"
max_concurrent_coders: 3
git_working_mode: branches
review_mode: never
max_coding_attempts: 3
push_best_effort: true
simple_complexity_agent:
  kind: custom
  executable: "{script}"
  args: []
polling:
  output_poll_ms: 20
  result_poll_ms: 30
  recovery_interval_secs: 60
  heartbeat_interval_secs: 30
  agent_kill_grace_secs: 2
  inactivity_timeout_secs: 1200
"#,
        script = script.display(),
    );
    let config_dir = project_dir.join(".opensprint");
    tokio::fs::create_dir_all(&config_dir).await.unwrap();
    tokio::fs::write(config_dir.join("config.yaml"), yaml).await.unwrap();
}

async fn write_script(path: &Path, body: &str) {
    tokio::fs::write(path, format!("#!/bin/sh\nset -e\n{body}\n")).await.unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms).await.unwrap();
    }
}

async fn wait_until<F, Fut>(mut predicate: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn happy_path_worktree_no_review_merges_and_closes() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("proj1");
    init_repo(&project_dir).await;

    let script_path = tmp.path().join("agent.sh");
    write_script(
        &script_path,
        r#"echo "feature" > feature.txt
git add -A
git commit -q -m "feature commit"
mkdir -p .opensprint/active/1.1
printf '{"status":"success","summary":"done"}' > .opensprint/active/1.1/result.json
"#,
    )
    .await;
    write_config(&project_dir, &script_path, 3).await;

    let pool = connect(":memory:", 1).await.unwrap();
    let store = SqliteTaskStore::new(pool);
    let task = Task::new("1.1", "Implement feature", "do the thing");
    store.insert("proj1", &task).await.unwrap();

    let task_store: std::sync::Arc<dyn TaskStore> = std::sync::Arc::new(store.clone());
    let orchestrator = Orchestrator::new(tmp.path().to_path_buf(), tmp.path().join("worktrees"), task_store);
    orchestrator.ensure_running("proj1").await.unwrap();

    wait_until(
        || {
            let store = store.clone();
            async move { matches!(store.show("proj1", "1.1").await.map(|t| t.status), Ok(TaskStatus::Closed)) }
        },
        Duration::from_secs(15),
    )
    .await;

    let task = store.show("proj1", "1.1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Closed);
    assert!(task.completed_at.is_some());

    let status = orchestrator.get_status("proj1").await.unwrap();
    assert_eq!(status.total_done, 1);
    assert!(status.active_tasks.is_empty());

    assert!(project_dir.join("feature.txt").is_file(), "merged feature file should exist on main");
    assert!(
        project_dir.join(".opensprint/sessions/1.1-1").is_dir(),
        "the successful attempt should leave a session archive"
    );

    wait_until(
        || {
            let project_dir = project_dir.clone();
            async move {
                let out = tokio::process::Command::new("git")
                    .args(["branch", "--list", "opensprint/1.1"])
                    .current_dir(&project_dir)
                    .output()
                    .await
                    .unwrap();
                String::from_utf8_lossy(&out.stdout).trim().is_empty()
            }
        },
        Duration::from_secs(5),
    )
    .await;
}

#[tokio::test]
async fn retry_then_block_on_repeated_coding_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("proj1");
    init_repo(&project_dir).await;

    let script_path = tmp.path().join("agent.sh");
    write_script(&script_path, "exit 1").await;
    write_config(&project_dir, &script_path, 2).await;

    let pool = connect(":memory:", 1).await.unwrap();
    let store = SqliteTaskStore::new(pool);
    let task = Task::new("1.1", "Implement feature", "do the thing");
    store.insert("proj1", &task).await.unwrap();

    let task_store: std::sync::Arc<dyn TaskStore> = std::sync::Arc::new(store.clone());
    let orchestrator = Orchestrator::new(tmp.path().to_path_buf(), tmp.path().join("worktrees"), task_store);
    orchestrator.ensure_running("proj1").await.unwrap();

    wait_until(
        || {
            let store = store.clone();
            async move { matches!(store.show("proj1", "1.1").await.map(|t| t.status), Ok(TaskStatus::Blocked)) }
        },
        Duration::from_secs(15),
    )
    .await;

    let task = store.show("proj1", "1.1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(task.close_reason.as_deref(), Some("Coding Failure"));
    assert_eq!(task.attempts(), 2);

    let status = orchestrator.get_status("proj1").await.unwrap();
    assert_eq!(status.total_failed, 1);
    assert!(status.active_tasks.is_empty());

    assert!(project_dir.join(".opensprint/sessions/1.1-1").is_dir());
    assert!(project_dir.join(".opensprint/sessions/1.1-2").is_dir());

    let branch_check = tokio::process::Command::new("git")
        .args(["branch", "--list", "opensprint/1.1"])
        .current_dir(&project_dir)
        .output()
        .await
        .unwrap();
    assert!(
        !String::from_utf8_lossy(&branch_check.stdout).trim().is_empty(),
        "blocked task's branch is left behind, no merge attempted"
    );
}

#[tokio::test]
async fn branches_mode_forces_single_slot_despite_higher_capacity() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("proj1");
    init_repo(&project_dir).await;

    let script_path = tmp.path().join("agent.sh");
    // Branches mode shares one working directory across tasks, so with a
    // single enforced slot exactly one `.opensprint/active/<taskId>`
    // directory exists while this script runs; it discovers that
    // directory rather than being told the task id directly.
    write_script(
        &script_path,
        r#"sleep 1
dir=$(ls -d .opensprint/active/*/ | head -1)
printf '{"status":"success","summary":"done"}' > "${dir}result.json"
"#,
    )
    .await;
    write_branches_config(&project_dir, &script_path).await;

    let pool = connect(":memory:", 1).await.unwrap();
    let store = SqliteTaskStore::new(pool);
    store.insert("proj1", &Task::new("1.1", "First", "")).await.unwrap();
    store.insert("proj1", &Task::new("1.2", "Second", "")).await.unwrap();

    let task_store: std::sync::Arc<dyn TaskStore> = std::sync::Arc::new(store.clone());
    let orchestrator = Orchestrator::new(tmp.path().to_path_buf(), tmp.path().join("worktrees"), task_store);
    orchestrator.ensure_running("proj1").await.unwrap();

    wait_until(
        || async { !orchestrator.get_status("proj1").await.unwrap().active_tasks.is_empty() },
        Duration::from_secs(10),
    )
    .await;

    let status = orchestrator.get_status("proj1").await.unwrap();
    assert_eq!(status.active_tasks.len(), 1, "branches mode admits exactly one task at a time");
    assert_eq!(status.active_tasks[0].task_id, "1.1");
    assert_eq!(status.queue_depth, 1, "the second ready task waits in the queue");

    wait_until(
        || {
            let store = store.clone();
            async move {
                matches!(store.show("proj1", "1.2").await.map(|t| t.status), Ok(TaskStatus::Closed))
            }
        },
        Duration::from_secs(15),
    )
    .await;
}
