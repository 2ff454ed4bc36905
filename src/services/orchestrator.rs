//! Orchestrator: per-process singleton multiplexing one [`ProjectRunner`]
//! per project (`SPEC_FULL.md` §4.1).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{info, instrument};

use crate::config::{ConfigLoader, Settings};
use crate::domain::errors::{ExecuteError, ExecuteResult};
use crate::domain::ports::TaskStore;
use crate::events::ExecuteEvent;

use super::git_queue::GitQueue;
use super::output_broker::OutputBroker;
use super::project_runner::{ProjectRunner, StatusSnapshot};
use super::recovery::RecoveryCoordinator;
use super::workspace::BranchManager;

const EVENTS_CHANNEL_CAPACITY: usize = 1024;

struct ProjectEntry {
    runner: Arc<ProjectRunner>,
    output_broker: OutputBroker,
    events: broadcast::Sender<ExecuteEvent>,
}

/// Per-process singleton owning one [`ProjectRunner`] per project.
///
/// `ensureRunning` takes a write lock only long enough to insert a
/// missing runner, then drops it before running recovery and nudging,
/// so concurrent calls for different projects never block each other
/// (`SPEC_FULL.md` §4.1).
pub struct Orchestrator {
    projects_root: PathBuf,
    worktree_root: PathBuf,
    task_store: Arc<dyn TaskStore>,
    runners: RwLock<HashMap<String, ProjectEntry>>,
}

impl Orchestrator {
    pub fn new(projects_root: PathBuf, worktree_root: PathBuf, task_store: Arc<dyn TaskStore>) -> Arc<Self> {
        Arc::new(Self {
            projects_root,
            worktree_root,
            task_store,
            runners: RwLock::new(HashMap::new()),
        })
    }

    fn repo_path(&self, project_id: &str) -> PathBuf {
        self.projects_root.join(project_id)
    }

    async fn existing(&self, project_id: &str) -> Option<Arc<ProjectRunner>> {
        self.runners.read().await.get(project_id).map(|e| e.runner.clone())
    }

    /// Idempotent. On first call for `project_id`: construct a
    /// `ProjectRunner`, run `RecoveryCoordinator` against it, then
    /// `nudge()`. Subsequent calls just return the current snapshot.
    #[instrument(skip(self))]
    pub async fn ensure_running(self: &Arc<Self>, project_id: &str) -> ExecuteResult<StatusSnapshot> {
        if let Some(runner) = self.existing(project_id).await {
            return Ok(runner.status().await);
        }

        let repo_path = self.repo_path(project_id);
        let settings = Arc::new(
            ConfigLoader::load(&repo_path)
                .map_err(|e| ExecuteError::ValidationFailed(e.to_string()))?,
        );
        let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        let output_broker = OutputBroker::new();
        let branch_manager = Arc::new(BranchManager::new(&repo_path, &self.worktree_root));
        let git_queue = GitQueue::new(
            branch_manager.clone(),
            settings.git_queue.job_timeout_secs,
            settings.git_queue.merge_timeout_secs,
            settings.git_queue.lock_stale_secs,
            settings.git_queue.lock_wait_cap_secs,
        );

        let runner = ProjectRunner::new(
            project_id,
            repo_path.clone(),
            settings.clone(),
            self.task_store.clone(),
            git_queue.clone(),
            branch_manager.clone(),
            output_broker.clone(),
            events_tx.clone(),
        );

        // Double check under the write lock: another caller may have
        // raced us to construction for the same project.
        {
            let mut runners = self.runners.write().await;
            if let Some(entry) = runners.get(project_id) {
                return Ok(entry.runner.status().await);
            }
            runners.insert(
                project_id.to_string(),
                ProjectEntry {
                    runner: runner.clone(),
                    output_broker: output_broker.clone(),
                    events: events_tx.clone(),
                },
            );
        }

        let recovery = Arc::new(RecoveryCoordinator::new(
            project_id,
            repo_path,
            crate::paths::worktree_base(&self.worktree_root),
            settings,
            self.task_store.clone(),
            git_queue,
            branch_manager,
            output_broker,
            events_tx,
            runner.slots_handle(),
            runner.nudge_handle(),
        ));
        recovery.spawn();

        runner.nudge();
        info!(project_id, "project runner admitted and recovery started");
        Ok(runner.status().await)
    }

    /// Ask the `ProjectRunner` to stop accepting new work and cancel its
    /// timers; existing slots drain naturally. Does not kill agents.
    pub async fn stop_project(&self, project_id: &str) -> ExecuteResult<()> {
        let runner = self
            .existing(project_id)
            .await
            .ok_or_else(|| ExecuteError::ProjectNotRunning(project_id.to_string()))?;
        runner.stop();
        Ok(())
    }

    /// Compose a status snapshot for `project_id`, reconciling the slot
    /// set against the task store (see `ProjectRunner::status`).
    pub async fn get_status(&self, project_id: &str) -> ExecuteResult<StatusSnapshot> {
        let runner = self
            .existing(project_id)
            .await
            .ok_or_else(|| ExecuteError::ProjectNotRunning(project_id.to_string()))?;
        Ok(runner.status().await)
    }

    /// Single-shot signal that a new `runLoop` pass should occur soon;
    /// coalesces multiple callers. A no-op if the project isn't running.
    pub async fn nudge(&self, project_id: &str) {
        if let Some(runner) = self.existing(project_id).await {
            runner.nudge();
        }
    }

    /// Current `OutputLog` content for `task_id`, empty if absent.
    pub async fn get_live_output(&self, project_id: &str, task_id: &str) -> String {
        let Some(broker) = self.runners.read().await.get(project_id).map(|e| e.output_broker.clone()) else {
            return String::new();
        };
        String::from_utf8_lossy(&broker.snapshot(task_id).await).into_owned()
    }

    /// Subscribe to the named event shapes broadcast for `project_id`
    /// (`SPEC_FULL.md` §6); `None` if the project isn't running yet.
    pub async fn subscribe_events(&self, project_id: &str) -> Option<broadcast::Receiver<ExecuteEvent>> {
        self.runners.read().await.get(project_id).map(|e| e.events.subscribe())
    }

    pub fn settings_for(&self, project_id: &str) -> ExecuteResult<Settings> {
        ConfigLoader::load(self.repo_path(project_id)).map_err(|e| ExecuteError::ValidationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::SqliteTaskStore;

    async fn init_repo(dir: &std::path::Path) {
        tokio::process::Command::new("git").arg("init").arg("-q").arg("-b").arg("main").current_dir(dir).output().await.unwrap();
        tokio::process::Command::new("git").args(["config", "user.email", "test@example.com"]).current_dir(dir).output().await.unwrap();
        tokio::process::Command::new("git").args(["config", "user.name", "Test"]).current_dir(dir).output().await.unwrap();
        tokio::fs::write(dir.join("README.md"), b"hello").await.unwrap();
        tokio::process::Command::new("git").args(["add", "-A"]).current_dir(dir).output().await.unwrap();
        tokio::process::Command::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir).output().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_running_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let project_dir = tmp.path().join("proj1");
        tokio::fs::create_dir_all(&project_dir).await.unwrap();
        init_repo(&project_dir).await;

        let pool = crate::infrastructure::database::connect(":memory:", 1).await.unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));
        let orchestrator = Orchestrator::new(tmp.path().to_path_buf(), tmp.path().join("worktrees"), store);

        let snap1 = orchestrator.ensure_running("proj1").await.unwrap();
        let snap2 = orchestrator.ensure_running("proj1").await.unwrap();
        assert_eq!(snap1.total_done, snap2.total_done);
        assert_eq!(orchestrator.runners.read().await.len(), 1);
    }

    #[tokio::test]
    async fn get_status_on_unknown_project_errors() {
        let pool = crate::infrastructure::database::connect(":memory:", 1).await.unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));
        let orchestrator = Orchestrator::new(PathBuf::from("/tmp/nonexistent"), PathBuf::from("/tmp/nonexistent-wt"), store);
        assert!(orchestrator.get_status("ghost").await.is_err());
    }

    #[tokio::test]
    async fn live_output_empty_when_project_not_running() {
        let pool = crate::infrastructure::database::connect(":memory:", 1).await.unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));
        let orchestrator = Orchestrator::new(PathBuf::from("/tmp/nonexistent"), PathBuf::from("/tmp/nonexistent-wt"), store);
        assert_eq!(orchestrator.get_live_output("ghost", "t1").await, "");
    }
}
