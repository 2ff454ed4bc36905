//! RecoveryCoordinator: reconciles on-disk assignment records against live
//! processes at startup and on a fixed interval (`SPEC_FULL.md` §4.7).
//!
//! Three decisions per discovered assignment: reattach (pid alive, fresh
//! heartbeat, not already slotted), re-queue (pid dead or heartbeat
//! stale — preserve partial work, reopen the task), or clean (a worktree
//! with no assignment record and no running agent — prune it).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{info, instrument, warn};

use crate::config::Settings;
use crate::domain::models::{AssignmentRecord, Heartbeat, Phase, ResultDocument, ResultStatus, SessionMetadata, SessionOutcome, Slot};
use crate::domain::ports::TaskStore;
use crate::events::ExecuteEvent;
use crate::paths;

use super::git_queue::{GitJob, GitQueue};
use super::output_broker::OutputBroker;
use super::workspace::BranchManager;

fn process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
}

fn broadcast_quiet(tx: &broadcast::Sender<ExecuteEvent>, event: ExecuteEvent) {
    let _ = tx.send(event);
}

pub struct RecoveryCoordinator {
    project_id: String,
    repo_path: PathBuf,
    worktree_base: PathBuf,
    settings: Arc<Settings>,
    task_store: Arc<dyn TaskStore>,
    git_queue: Arc<GitQueue>,
    branch_manager: Arc<BranchManager>,
    output_broker: OutputBroker,
    events: broadcast::Sender<ExecuteEvent>,
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    nudge: Arc<Notify>,
}

impl RecoveryCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: impl Into<String>,
        repo_path: PathBuf,
        worktree_base: PathBuf,
        settings: Arc<Settings>,
        task_store: Arc<dyn TaskStore>,
        git_queue: Arc<GitQueue>,
        branch_manager: Arc<BranchManager>,
        output_broker: OutputBroker,
        events: broadcast::Sender<ExecuteEvent>,
        slots: Arc<RwLock<HashMap<String, Slot>>>,
        nudge: Arc<Notify>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            repo_path,
            worktree_base,
            settings,
            task_store,
            git_queue,
            branch_manager,
            output_broker,
            events,
            slots,
            nudge,
        }
    }

    /// Spawn the background 60s (configurable) recovery loop. Runs once
    /// immediately, then on the configured interval.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            self.run_once().await;
            let mut tick = tokio::time::interval(Duration::from_secs(self.settings.polling.recovery_interval_secs));
            tick.tick().await; // first tick fires immediately; consume it since run_once already ran
            loop {
                tick.tick().await;
                self.run_once().await;
            }
        });
    }

    #[instrument(skip(self), fields(project_id = %self.project_id))]
    pub async fn run_once(&self) {
        let mut workspace_roots = vec![self.repo_path.clone()];
        if let Ok(mut entries) = tokio::fs::read_dir(&self.worktree_base).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.path().is_dir() {
                    workspace_roots.push(entry.path());
                }
            }
        }

        let mut seen_task_ids = std::collections::HashSet::new();
        for root in &workspace_roots {
            for (active_dir, record) in scan_assignments(root).await {
                seen_task_ids.insert(record.task_id.clone());
                self.reconcile_assignment(root, &active_dir, record).await;
            }
        }

        self.clean_orphan_worktrees(&seen_task_ids).await;
    }

    async fn reconcile_assignment(&self, workspace_root: &Path, active_dir: &Path, record: AssignmentRecord) {
        if self.slots.read().await.contains_key(&record.task_id) {
            return; // already supervised by this process
        }

        let heartbeat = tokio::fs::read(active_dir.join("heartbeat.json"))
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Heartbeat>(&bytes).ok());

        let pid = heartbeat.as_ref().map(|h| h.pid).or(record.agent_pid);
        let interval = chrono::Duration::seconds(self.settings.polling.heartbeat_interval_secs as i64);
        let fresh = heartbeat.as_ref().is_some_and(|h| h.is_fresh(interval));
        let alive = pid.is_some_and(process_alive);

        if alive && fresh {
            info!(task_id = %record.task_id, pid, "reattaching to live agent");
            self.reattach(workspace_root, active_dir, record, pid.expect("checked above")).await;
        } else {
            info!(task_id = %record.task_id, alive, fresh, "agent missing or stale, re-queueing");
            self.requeue(workspace_root, active_dir, record).await;
        }
    }

    /// Reattach without owning the original `Child` handle: register a
    /// Slot so the task isn't double-admitted, then shadow-poll output,
    /// result, and heartbeat until the agent exits on its own. On exit,
    /// clear the assignment and reopen the task so the next `runLoop`
    /// pass starts a fresh, fully-supervised attempt.
    async fn reattach(&self, workspace_root: &Path, active_dir: &Path, record: AssignmentRecord, pid: u32) {
        let branch = record.branch_name.clone();
        let mut slot = Slot::new(
            record.task_id.clone(),
            record.task_id.clone(),
            branch.clone(),
            workspace_root.to_path_buf(),
            record.attempt,
        );
        slot.phase = Phase::from_assignment_str(&record.phase);
        slot.agent_pid = Some(pid);
        self.slots.write().await.insert(record.task_id.clone(), slot);
        broadcast_quiet(&self.events, ExecuteEvent::TaskUpdated { task_id: record.task_id.clone() });

        let task_id = record.task_id.clone();
        let active_dir = active_dir.to_path_buf();
        let workspace_root = workspace_root.to_path_buf();
        let poll_ms = self.settings.polling.result_poll_ms;
        let heartbeat_interval = self.settings.polling.heartbeat_interval_secs;
        let slots = self.slots.clone();
        let task_store = self.task_store.clone();
        let project_id = self.project_id.clone();
        let events = self.events.clone();
        let nudge = self.nudge.clone();
        let repo_path = self.repo_path.clone();
        let branch_manager = self.branch_manager.clone();
        let attempt = record.attempt;

        tokio::spawn(async move {
            let result_path = active_dir.join("result.json");
            let heartbeat_path = active_dir.join("heartbeat.json");
            let interval = chrono::Duration::seconds(heartbeat_interval as i64);
            let outcome = loop {
                if let Ok(bytes) = tokio::fs::read(&result_path).await {
                    if let Ok(doc) = serde_json::from_slice::<ResultDocument>(&bytes) {
                        break doc.status;
                    }
                }
                if !process_alive(pid) {
                    break ResultStatus::Failed;
                }
                let still_fresh = tokio::fs::read(&heartbeat_path)
                    .await
                    .ok()
                    .and_then(|b| serde_json::from_slice::<Heartbeat>(&b).ok())
                    .is_some_and(|h| h.is_fresh(interval));
                if !still_fresh {
                    break ResultStatus::Failed;
                }
                tokio::time::sleep(Duration::from_millis(poll_ms)).await;
            };

            let dir = paths::session_dir(&repo_path, &task_id, attempt);
            tokio::fs::create_dir_all(&dir).await.ok();
            if let Ok(diff) = branch_manager.capture_branch_diff(&branch).await {
                tokio::fs::write(dir.join("diff"), diff).await.ok();
            }
            let metadata = SessionMetadata {
                task_id: task_id.clone(),
                attempt,
                outcome: SessionOutcome::from(outcome),
                branch_name: branch,
                started_at: chrono::Utc::now(),
                archived_at: chrono::Utc::now(),
            };
            paths::write_json_atomic(&dir.join("metadata.json"), &metadata).await.ok();

            tokio::fs::remove_dir_all(&active_dir).await.ok();
            let _ = task_store
                .update(&project_id, &task_id, &|t| t.reopen())
                .await;
            slots.write().await.remove(&task_id);
            broadcast_quiet(&events, ExecuteEvent::TaskUpdated { task_id });
            nudge.notify_one();
            let _ = workspace_root;
        });
    }

    async fn requeue(&self, workspace_root: &Path, active_dir: &Path, record: AssignmentRecord) {
        if let Err(e) = self.branch_manager.commit_wip(workspace_root, &record.task_id).await {
            warn!(task_id = %record.task_id, error = %e, "failed to preserve partial work before re-queue");
        }

        let dir = paths::session_dir(&self.repo_path, &record.task_id, record.attempt);
        tokio::fs::create_dir_all(&dir).await.ok();
        if let Ok(bytes) = tokio::fs::read(active_dir.join("output.log")).await {
            tokio::fs::write(dir.join("output.log"), bytes).await.ok();
        }
        if let Ok(diff) = self.branch_manager.capture_branch_diff(&record.branch_name).await {
            tokio::fs::write(dir.join("diff"), diff).await.ok();
        }
        let metadata = SessionMetadata {
            task_id: record.task_id.clone(),
            attempt: record.attempt,
            outcome: SessionOutcome::Interrupted,
            branch_name: record.branch_name.clone(),
            started_at: record.created_at,
            archived_at: chrono::Utc::now(),
        };
        paths::write_json_atomic(&dir.join("metadata.json"), &metadata).await.ok();

        tokio::fs::remove_dir_all(active_dir).await.ok();
        if let Err(e) = self.task_store.update(&self.project_id, &record.task_id, &|t| t.reopen()).await {
            warn!(task_id = %record.task_id, error = %e, "failed to reopen re-queued task");
        }
        self.slots.write().await.remove(&record.task_id);
        broadcast_quiet(&self.events, ExecuteEvent::TaskUpdated { task_id: record.task_id.clone() });
        self.nudge.notify_one();
    }

    /// Prune worktrees left behind with no assignment record and no
    /// in-memory slot — the agent finished or died before teardown ran.
    async fn clean_orphan_worktrees(&self, seen_task_ids: &std::collections::HashSet<String>) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.worktree_base).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(task_id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if seen_task_ids.contains(&task_id) || self.slots.read().await.contains_key(&task_id) {
                continue;
            }
            info!(task_id, "pruning orphaned worktree with no assignment record");
            self.git_queue.enqueue(&self.repo_path.display().to_string(), GitJob::RemoveWorktree { task_id });
        }
    }
}

/// Read every `<workspace>/.opensprint/active/<taskId>/assignment.json`
/// under `root`.
async fn scan_assignments(root: &Path) -> Vec<(PathBuf, AssignmentRecord)> {
    let active_root = paths::opensprint_dir(root).join("active");
    let mut found = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(&active_root).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let dir = entry.path();
        let assignment_path = dir.join("assignment.json");
        if let Ok(bytes) = tokio::fs::read(&assignment_path).await {
            if let Ok(record) = serde_json::from_slice::<AssignmentRecord>(&bytes) {
                found.push((dir, record));
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AgentRole, Task, TaskStatus};
    use crate::infrastructure::database::{connect, SqliteTaskStore};

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            tokio::process::Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
        tokio::fs::write(dir.join("README.md"), b"hello").await.unwrap();
        tokio::process::Command::new("git").args(["add", "-A"]).current_dir(dir).output().await.unwrap();
        tokio::process::Command::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir).output().await.unwrap();
    }

    async fn coordinator(repo_path: PathBuf, worktree_base: PathBuf, task_store: Arc<dyn TaskStore>) -> RecoveryCoordinator {
        let settings = Arc::new(Settings::default());
        let branch_manager = Arc::new(BranchManager::new(repo_path.clone(), worktree_base.clone()));
        let git_queue = GitQueue::new(branch_manager.clone(), 30, 600, 10, 60);
        let (events_tx, _) = broadcast::channel(64);
        RecoveryCoordinator::new(
            "proj1",
            repo_path,
            worktree_base,
            settings,
            task_store,
            git_queue,
            branch_manager,
            OutputBroker::new(),
            events_tx,
            Arc::new(RwLock::new(HashMap::new())),
            Arc::new(Notify::new()),
        )
    }

    /// A stale assignment (no heartbeat, no live pid) with no slot is
    /// re-queued: the task reopens and the active dir is cleared. Running
    /// recovery a second time against the now-clean directory must reach
    /// the identical end state rather than erroring or double-reopening.
    #[tokio::test]
    async fn requeue_is_idempotent_across_repeated_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_path = tmp.path().join("proj1");
        init_repo(&repo_path).await;

        let pool = connect(":memory:", 1).await.unwrap();
        let store = SqliteTaskStore::new(pool);
        let mut task = Task::new("1.1", "Title", "Desc");
        task.mark_in_progress("agent-1");
        store.insert("proj1", &task).await.unwrap();

        let active_dir = paths::active_dir(&repo_path, "1.1");
        tokio::fs::create_dir_all(&active_dir).await.unwrap();
        let record = AssignmentRecord::new("1.1", Phase::Coding, "opensprint/1.1", repo_path.display().to_string(), 1, AgentRole::Coder);
        paths::write_json_atomic(&active_dir.join("assignment.json"), &record).await.unwrap();

        let task_store: Arc<dyn TaskStore> = Arc::new(store.clone());
        let coordinator = coordinator(repo_path.clone(), tmp.path().join("worktrees"), task_store).await;

        coordinator.run_once().await;
        let reopened = store.show("proj1", "1.1").await.unwrap();
        assert_eq!(reopened.status, TaskStatus::Open);
        assert!(reopened.assignee.is_none());
        assert!(!active_dir.exists());

        coordinator.run_once().await;
        let still_open = store.show("proj1", "1.1").await.unwrap();
        assert_eq!(still_open.status, TaskStatus::Open);
        assert_eq!(still_open.updated_at, reopened.updated_at);
    }

    /// A live pid with a fresh heartbeat is reattached rather than
    /// requeued: a Slot is registered and the task is left exactly as it
    /// was, not reopened, since its agent is presumed still running.
    #[tokio::test]
    async fn live_heartbeat_reattaches_instead_of_requeueing() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_path = tmp.path().join("proj1");
        init_repo(&repo_path).await;

        let pool = connect(":memory:", 1).await.unwrap();
        let store = SqliteTaskStore::new(pool);
        let mut task = Task::new("1.1", "Title", "Desc");
        task.mark_in_progress("agent-1");
        store.insert("proj1", &task).await.unwrap();

        let active_dir = paths::active_dir(&repo_path, "1.1");
        tokio::fs::create_dir_all(&active_dir).await.unwrap();
        let own_pid = std::process::id();
        let record = AssignmentRecord::new("1.1", Phase::Coding, "opensprint/1.1", repo_path.display().to_string(), 1, AgentRole::Coder);
        paths::write_json_atomic(&active_dir.join("assignment.json"), &record).await.unwrap();
        paths::write_json_atomic(&active_dir.join("heartbeat.json"), &Heartbeat::now(own_pid)).await.unwrap();

        let task_store: Arc<dyn TaskStore> = Arc::new(store.clone());
        let coordinator = coordinator(repo_path.clone(), tmp.path().join("worktrees"), task_store.clone()).await;
        let slots = coordinator.slots.clone();

        coordinator.run_once().await;

        assert!(slots.read().await.contains_key("1.1"), "live agent should be reattached into a slot");
        let still_in_progress = task_store.show("proj1", "1.1").await.unwrap();
        assert_eq!(still_in_progress.status, TaskStatus::InProgress, "reattachment must not disturb task state");
        assert!(active_dir.exists(), "the assignment is only cleared once the reattached watcher sees the agent exit");
    }
}
