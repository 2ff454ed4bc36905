//! GitQueue: serializes mutating git operations per repository
//! (`SPEC_FULL.md` §4.5). Reads (diff, branch --merged) may bypass it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{error, instrument, warn};

use crate::domain::errors::{ExecuteError, ExecuteResult};

use super::workspace::BranchManager;

/// One mutating git operation. Every merge, branch deletion, worktree
/// add/remove, and push is modeled as a job.
#[derive(Debug, Clone)]
pub enum GitJob {
    CreateWorktree { task_id: String },
    RemoveWorktree { task_id: String },
    CreateOrCheckoutBranch { branch: String },
    Merge { branch: String },
    DeleteBranch { branch: String },
    Push,
}

impl GitJob {
    fn label(&self) -> &'static str {
        match self {
            Self::CreateWorktree { .. } => "create_worktree",
            Self::RemoveWorktree { .. } => "remove_worktree",
            Self::CreateOrCheckoutBranch { .. } => "create_or_checkout_branch",
            Self::Merge { .. } => "merge",
            Self::DeleteBranch { .. } => "delete_branch",
            Self::Push => "push",
        }
    }

    fn timeout(&self, job_timeout_secs: u64, merge_timeout_secs: u64) -> Duration {
        match self {
            Self::Merge { .. } => Duration::from_secs(merge_timeout_secs),
            _ => Duration::from_secs(job_timeout_secs),
        }
    }
}

/// Result of running a [`GitJob`]; `Merge`/`CreateWorktree` populate
/// `path` with the resulting worktree path where relevant.
#[derive(Debug, Clone, Default)]
pub struct GitJobOutcome {
    pub path: Option<std::path::PathBuf>,
}

struct Entry {
    job: GitJob,
    reply: Option<oneshot::Sender<ExecuteResult<GitJobOutcome>>>,
}

struct RepoQueue {
    entries: Mutex<VecDeque<Entry>>,
    notify: Notify,
}

/// Per-repository FIFO serializer for mutating git operations. At most
/// one job runs per repository at a time.
pub struct GitQueue {
    branch_manager: Arc<BranchManager>,
    job_timeout_secs: u64,
    merge_timeout_secs: u64,
    lock_stale_secs: u64,
    lock_wait_cap_secs: u64,
    repos: Mutex<HashMap<String, Arc<RepoQueue>>>,
}

impl GitQueue {
    pub fn new(
        branch_manager: Arc<BranchManager>,
        job_timeout_secs: u64,
        merge_timeout_secs: u64,
        lock_stale_secs: u64,
        lock_wait_cap_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            branch_manager,
            job_timeout_secs,
            merge_timeout_secs,
            lock_stale_secs,
            lock_wait_cap_secs,
            repos: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the `RepoQueue` for `repo`, spawning its single long-lived
    /// worker the first time this repo is seen. The worker lives for the
    /// process's remaining lifetime, parked on `notify` whenever its
    /// queue is empty, so there is never more than one worker per repo
    /// to race on `.git/index.lock`.
    async fn repo_queue(self: &Arc<Self>, repo: &str) -> Arc<RepoQueue> {
        let mut repos = self.repos.lock().await;
        if let Some(queue) = repos.get(repo) {
            return queue.clone();
        }
        let queue = Arc::new(RepoQueue {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        repos.insert(repo.to_string(), queue.clone());
        let this = self.clone();
        let repo_owned = repo.to_string();
        let worker_queue = queue.clone();
        tokio::spawn(async move { this.drive(repo_owned, worker_queue).await });
        queue
    }

    /// Fire-and-forget enqueue; errors are logged, not surfaced.
    pub fn enqueue(self: &Arc<Self>, repo: &str, job: GitJob) {
        let this = self.clone();
        let repo = repo.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.enqueue_and_wait(&repo, job.clone()).await {
                error!(repo, job = job.label(), error = %e, "git queue job failed");
            }
        });
    }

    /// Resolves when the job completes, or rejects on error.
    pub async fn enqueue_and_wait(self: &Arc<Self>, repo: &str, job: GitJob) -> ExecuteResult<GitJobOutcome> {
        let queue = self.repo_queue(repo).await;
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = queue.entries.lock().await;
            entries.push_back(Entry {
                job,
                reply: Some(tx),
            });
        }
        queue.notify.notify_one();
        rx.await
            .map_err(|_| ExecuteError::StoreUnavailable("git queue worker dropped reply channel".to_string()))?
    }

    /// Await the current queue for `repo` draining to empty.
    pub async fn drain(self: &Arc<Self>, repo: &str) {
        let queue = self.repo_queue(repo).await;
        loop {
            if queue.entries.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// The one and only worker for `repo`: pops the next entry and runs
    /// it to completion before ever looking at another, parking on
    /// `queue.notify` while the queue is empty rather than exiting, so a
    /// concurrent `enqueue_and_wait` can never observe "no worker" and
    /// spawn a second one.
    #[instrument(skip(self, queue))]
    async fn drive(self: Arc<Self>, repo: String, queue: Arc<RepoQueue>) {
        loop {
            let entry = {
                let mut entries = queue.entries.lock().await;
                entries.pop_front()
            };
            let Some(mut entry) = entry else {
                queue.notify.notified().await;
                continue;
            };

            if let Err(e) = self
                .branch_manager
                .wait_for_git_ready(self.branch_manager.repo_path(), self.lock_stale_secs, self.lock_wait_cap_secs)
                .await
            {
                warn!(repo, error = %e, "proceeding despite git-ready wait failure");
            }

            let timeout = entry.job.timeout(self.job_timeout_secs, self.merge_timeout_secs);
            let result = tokio::time::timeout(timeout, self.run_job(&entry.job))
                .await
                .unwrap_or_else(|_| {
                    Err(ExecuteError::TransientGit {
                        repo: repo.clone(),
                        source: format!("{} timed out after {:?}", entry.job.label(), timeout),
                    })
                });

            if let Some(reply) = entry.reply.take() {
                let _ = reply.send(result);
            }
        }
    }

    async fn run_job(&self, job: &GitJob) -> ExecuteResult<GitJobOutcome> {
        match job {
            GitJob::CreateWorktree { task_id } => {
                let path = self.branch_manager.create_task_worktree(task_id).await?;
                self.branch_manager.symlink_node_modules(&path).await?;
                Ok(GitJobOutcome { path: Some(path) })
            }
            GitJob::RemoveWorktree { task_id } => {
                self.branch_manager.remove_task_worktree(task_id).await?;
                Ok(GitJobOutcome::default())
            }
            GitJob::CreateOrCheckoutBranch { branch } => {
                self.branch_manager.create_or_checkout_branch(branch).await?;
                self.branch_manager.ensure_repo_node_modules(self.branch_manager.repo_path()).await?;
                Ok(GitJobOutcome::default())
            }
            GitJob::Merge { branch } => {
                self.branch_manager.merge_to_main(branch).await?;
                if !self.branch_manager.verify_merge(branch).await? {
                    return Err(ExecuteError::MergeConflict {
                        branch: branch.clone(),
                        target: "main".to_string(),
                    });
                }
                Ok(GitJobOutcome::default())
            }
            GitJob::DeleteBranch { branch } => {
                self.branch_manager.delete_branch(branch).await?;
                Ok(GitJobOutcome::default())
            }
            GitJob::Push => {
                self.branch_manager.push_main().await?;
                Ok(GitJobOutcome::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn queue() -> Arc<GitQueue> {
        let branch_manager = Arc::new(BranchManager::new(PathBuf::from("/tmp/repo"), PathBuf::from("/tmp/worktrees")));
        GitQueue::new(branch_manager, 5, 5, 5, 5)
    }

    /// A repo's `RepoQueue` (and therefore its single worker) must be
    /// reused across an empty-queue gap, never re-created — this is what
    /// keeps "at most one job runs per repository at a time" true even
    /// after the queue has fully drained.
    #[tokio::test]
    async fn repo_queue_is_reused_across_an_empty_queue_gap() {
        let queue = queue();
        let repo = "/tmp/repo-a";

        let first = queue.repo_queue(repo).await;
        queue.drain(repo).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = queue.repo_queue(repo).await;

        assert!(Arc::ptr_eq(&first, &second), "the same RepoQueue must be reused, never re-spawned");
    }

    #[tokio::test]
    async fn distinct_repos_get_distinct_queues() {
        let queue = queue();
        let a = queue.repo_queue("/tmp/repo-a").await;
        let b = queue.repo_queue("/tmp/repo-b").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
