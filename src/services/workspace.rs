//! Workspace / BranchManager: the git operations the Execute core needs,
//! nothing more. Every mutating operation here must be invoked only from
//! inside a [`crate::services::git_queue::GitQueue`] job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use backoff::{future::retry, Error as BackoffError, ExponentialBackoff};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::domain::errors::{ExecuteError, ExecuteResult};

/// Abstraction over git providing exactly the operations the Execute core
/// needs (`SPEC_FULL.md` §4.6).
#[derive(Clone)]
pub struct BranchManager {
    /// Root of the repository's primary checkout.
    repo_path: PathBuf,
    /// Parent directory worktrees are created under, e.g.
    /// `<tmp>/opensprint-worktrees`.
    worktree_base: PathBuf,
}

async fn run_git(dir: &Path, args: &[&str]) -> ExecuteResult<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| ExecuteError::GitFailed {
            repo: dir.display().to_string(),
            source: e.to_string(),
        })
}

fn ok_or_git_failed(repo: &Path, output: &std::process::Output) -> ExecuteResult<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(ExecuteError::GitFailed {
            repo: repo.display().to_string(),
            source: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl BranchManager {
    pub fn new(repo_path: impl Into<PathBuf>, worktree_base: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            worktree_base: worktree_base.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn branch_name(task_id: &str) -> String {
        format!("opensprint/{task_id}")
    }

    fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.worktree_base.join(task_id)
    }

    /// Create (or reuse) a fresh worktree at `<worktree_base>/<taskId>`
    /// whose HEAD is the task branch, branched from main if new.
    #[instrument(skip(self))]
    pub async fn create_task_worktree(&self, task_id: &str) -> ExecuteResult<PathBuf> {
        let branch = Self::branch_name(task_id);
        let wt_path = self.worktree_path(task_id);

        if wt_path.join(".git").exists() {
            debug!(task_id, path = %wt_path.display(), "reusing existing worktree");
            return Ok(wt_path);
        }

        if let Some(parent) = wt_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let branch_exists = run_git(&self.repo_path, &["rev-parse", "--verify", &branch])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        let output = if branch_exists {
            run_git(
                &self.repo_path,
                &["worktree", "add", wt_path.to_str().unwrap_or_default(), &branch],
            )
            .await?
        } else {
            run_git(
                &self.repo_path,
                &[
                    "worktree",
                    "add",
                    "-b",
                    &branch,
                    wt_path.to_str().unwrap_or_default(),
                    "main",
                ],
            )
            .await?
        };
        ok_or_git_failed(&self.repo_path, &output)?;
        Ok(wt_path)
    }

    #[instrument(skip(self))]
    pub async fn remove_task_worktree(&self, task_id: &str) -> ExecuteResult<()> {
        let wt_path = self.worktree_path(task_id);
        if !wt_path.exists() {
            return Ok(());
        }
        let output = run_git(
            &self.repo_path,
            &["worktree", "remove", "--force", wt_path.to_str().unwrap_or_default()],
        )
        .await?;
        if !output.status.success() {
            warn!(task_id, "git worktree remove failed, pruning directory directly");
            tokio::fs::remove_dir_all(&wt_path).await.ok();
            run_git(&self.repo_path, &["worktree", "prune"]).await.ok();
        }
        Ok(())
    }

    /// `branches` mode: check out `branch` in the primary checkout,
    /// creating it from `main` if absent.
    #[instrument(skip(self))]
    pub async fn create_or_checkout_branch(&self, branch: &str) -> ExecuteResult<()> {
        let exists = run_git(&self.repo_path, &["rev-parse", "--verify", branch])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        let output = if exists {
            run_git(&self.repo_path, &["checkout", branch]).await?
        } else {
            run_git(&self.repo_path, &["checkout", "-b", branch, "main"]).await?
        };
        ok_or_git_failed(&self.repo_path, &output)
    }

    #[instrument(skip(self))]
    pub async fn ensure_on_main(&self, dir: &Path) -> ExecuteResult<()> {
        let status = run_git(dir, &["status", "--porcelain"]).await?;
        if !status.stdout.is_empty() {
            run_git(dir, &["reset", "--hard", "HEAD"]).await?;
        }
        let output = run_git(dir, &["checkout", "main"]).await?;
        ok_or_git_failed(dir, &output)
    }

    /// Commit any dirty working-copy state as `WIP: <taskId>`.
    #[instrument(skip(self))]
    pub async fn commit_wip(&self, dir: &Path, task_id: &str) -> ExecuteResult<bool> {
        let status = run_git(dir, &["status", "--porcelain"]).await?;
        if status.stdout.is_empty() {
            return Ok(false);
        }
        run_git(dir, &["add", "-A"]).await?;
        let message = format!("WIP: {task_id}");
        let output = run_git(dir, &["commit", "-m", &message]).await?;
        ok_or_git_failed(dir, &output)?;
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn merge_to_main(&self, branch: &str) -> ExecuteResult<()> {
        self.ensure_on_main(&self.repo_path).await?;
        let message = format!("Merge {branch} into main");
        let output = run_git(&self.repo_path, &["merge", "--no-ff", "-m", &message, "--", branch]).await?;
        if !output.status.success() {
            run_git(&self.repo_path, &["merge", "--abort"]).await.ok();
            return Err(ExecuteError::MergeConflict {
                branch: branch.to_string(),
                target: "main".to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn verify_merge(&self, branch: &str) -> ExecuteResult<bool> {
        let output = run_git(&self.repo_path, &["branch", "--merged", "main"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().any(|line| line.trim().trim_start_matches("* ") == branch))
    }

    #[instrument(skip(self))]
    pub async fn push_main(&self) -> ExecuteResult<()> {
        let output = run_git(&self.repo_path, &["push", "origin", "main"]).await?;
        if !output.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "push to origin failed, continuing best-effort"
            );
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_branch(&self, branch: &str) -> ExecuteResult<()> {
        run_git(&self.repo_path, &["branch", "-D", branch]).await.ok();
        run_git(&self.repo_path, &["push", "origin", "--delete", branch])
            .await
            .ok();
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn capture_branch_diff(&self, branch: &str) -> ExecuteResult<String> {
        let output = run_git(&self.repo_path, &["diff", "main...", branch]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    #[instrument(skip(self))]
    pub async fn get_changed_files(&self, branch: &str) -> ExecuteResult<Vec<String>> {
        let output = run_git(&self.repo_path, &["diff", "--name-only", "main...", branch]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn get_commit_count_ahead(&self, branch: &str) -> ExecuteResult<u32> {
        let output = run_git(&self.repo_path, &["rev-list", "--count", &format!("main..{branch}")]).await?;
        let count = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap_or(0);
        Ok(count)
    }

    /// Wait for `.git/index.lock` to clear, removing it if stale.
    #[instrument(skip(self))]
    pub async fn wait_for_git_ready(&self, dir: &Path, stale_secs: u64, wait_cap_secs: u64) -> ExecuteResult<()> {
        let lock_path = dir.join(".git").join("index.lock");
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(Duration::from_secs(wait_cap_secs)),
            ..Default::default()
        };

        retry(policy, || async {
            let Ok(metadata) = tokio::fs::metadata(&lock_path).await else {
                return Ok(());
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age.as_secs() >= stale_secs {
                warn!(lock = %lock_path.display(), age_secs = age.as_secs(), "removing stale git index.lock");
                tokio::fs::remove_file(&lock_path).await.ok();
                return Ok(());
            }
            Err(BackoffError::transient(ExecuteError::TransientGit {
                repo: dir.display().to_string(),
                source: "index.lock still held".to_string(),
            }))
        })
        .await
        .map_err(|_| ExecuteError::TransientGit {
            repo: dir.display().to_string(),
            source: "timed out waiting for index.lock to clear".to_string(),
        })
    }

    /// `branches` mode only: idempotent dependency install.
    #[instrument(skip(self))]
    pub async fn ensure_repo_node_modules(&self, repo: &Path) -> ExecuteResult<()> {
        if repo.join("package.json").is_file() && !repo.join("node_modules").is_dir() {
            let output = Command::new("npm")
                .arg("install")
                .current_dir(repo)
                .output()
                .await
                .map_err(|e| ExecuteError::GitFailed {
                    repo: repo.display().to_string(),
                    source: e.to_string(),
                })?;
            ok_or_git_failed(repo, &output)?;
        }
        Ok(())
    }

    /// `worktree` mode only, best-effort: symlink `node_modules` from the
    /// primary checkout into a fresh worktree to avoid a full reinstall.
    #[instrument(skip(self))]
    pub async fn symlink_node_modules(&self, worktree_path: &Path) -> ExecuteResult<()> {
        let source = self.repo_path.join("node_modules");
        let target = worktree_path.join("node_modules");
        if source.is_dir() && !target.exists() {
            #[cfg(unix)]
            {
                if let Err(e) = tokio::fs::symlink(&source, &target).await {
                    warn!(error = %e, "symlinking node_modules failed, continuing without it");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        run_git(dir, &["init", "-q", "-b", "main"]).await.unwrap();
        run_git(dir, &["config", "user.email", "test@example.com"]).await.unwrap();
        run_git(dir, &["config", "user.name", "Test"]).await.unwrap();
        tokio::fs::write(dir.join("README.md"), b"hello").await.unwrap();
        run_git(dir, &["add", "-A"]).await.unwrap();
        run_git(dir, &["commit", "-q", "-m", "init"]).await.unwrap();
    }

    #[tokio::test]
    async fn create_task_worktree_branches_from_main() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        init_repo(&repo_dir).await;

        let manager = BranchManager::new(&repo_dir, tmp.path().join("worktrees"));
        let wt_path = manager.create_task_worktree("1.1").await.unwrap();
        assert!(wt_path.join("README.md").is_file());

        let branch_out = run_git(&wt_path, &["rev-parse", "--abbrev-ref", "HEAD"]).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&branch_out.stdout).trim(), "opensprint/1.1");
    }

    #[tokio::test]
    async fn create_task_worktree_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        init_repo(&repo_dir).await;

        let manager = BranchManager::new(&repo_dir, tmp.path().join("worktrees"));
        let first = manager.create_task_worktree("1.1").await.unwrap();
        let second = manager.create_task_worktree("1.1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn remove_task_worktree_is_a_no_op_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        init_repo(&repo_dir).await;

        let manager = BranchManager::new(&repo_dir, tmp.path().join("worktrees"));
        assert!(manager.remove_task_worktree("never-created").await.is_ok());
    }

    #[tokio::test]
    async fn commit_wip_returns_false_on_clean_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        init_repo(&repo_dir).await;

        let manager = BranchManager::new(&repo_dir, tmp.path().join("worktrees"));
        assert!(!manager.commit_wip(&repo_dir, "1.1").await.unwrap());
    }

    #[tokio::test]
    async fn commit_wip_commits_dirty_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        init_repo(&repo_dir).await;
        tokio::fs::write(repo_dir.join("scratch.txt"), b"wip").await.unwrap();

        let manager = BranchManager::new(&repo_dir, tmp.path().join("worktrees"));
        assert!(manager.commit_wip(&repo_dir, "1.1").await.unwrap());
        assert!(!manager.commit_wip(&repo_dir, "1.1").await.unwrap());
    }

    #[tokio::test]
    async fn merge_to_main_then_verify_merge_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        init_repo(&repo_dir).await;

        let manager = BranchManager::new(&repo_dir, tmp.path().join("worktrees"));
        let wt_path = manager.create_task_worktree("1.1").await.unwrap();
        tokio::fs::write(wt_path.join("feature.txt"), b"new feature").await.unwrap();
        run_git(&wt_path, &["add", "-A"]).await.unwrap();
        run_git(&wt_path, &["commit", "-q", "-m", "add feature"]).await.unwrap();

        let branch = BranchManager::branch_name("1.1");
        manager.merge_to_main(&branch).await.unwrap();
        assert!(manager.verify_merge(&branch).await.unwrap());
        assert!(repo_dir.join("feature.txt").is_file());
    }

    #[tokio::test]
    async fn merge_to_main_aborts_cleanly_on_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        init_repo(&repo_dir).await;

        let manager = BranchManager::new(&repo_dir, tmp.path().join("worktrees"));
        let wt_path = manager.create_task_worktree("1.1").await.unwrap();
        tokio::fs::write(wt_path.join("README.md"), b"branch change").await.unwrap();
        run_git(&wt_path, &["add", "-A"]).await.unwrap();
        run_git(&wt_path, &["commit", "-q", "-m", "conflicting change"]).await.unwrap();

        tokio::fs::write(repo_dir.join("README.md"), b"main change").await.unwrap();
        run_git(&repo_dir, &["add", "-A"]).await.unwrap();
        run_git(&repo_dir, &["commit", "-q", "-m", "main change"]).await.unwrap();

        let branch = BranchManager::branch_name("1.1");
        let result = manager.merge_to_main(&branch).await;
        assert!(matches!(result, Err(ExecuteError::MergeConflict { .. })));

        let status = run_git(&repo_dir, &["status", "--porcelain"]).await.unwrap();
        assert!(status.stdout.is_empty(), "merge --abort should leave a clean tree");
    }

    #[tokio::test]
    async fn get_commit_count_ahead_reflects_new_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        init_repo(&repo_dir).await;

        let manager = BranchManager::new(&repo_dir, tmp.path().join("worktrees"));
        let wt_path = manager.create_task_worktree("1.1").await.unwrap();
        tokio::fs::write(wt_path.join("feature.txt"), b"x").await.unwrap();
        run_git(&wt_path, &["add", "-A"]).await.unwrap();
        run_git(&wt_path, &["commit", "-q", "-m", "one commit"]).await.unwrap();

        let branch = BranchManager::branch_name("1.1");
        assert_eq!(manager.get_commit_count_ahead(&branch).await.unwrap(), 1);
    }
}
