//! Persistent filesystem layout (`SPEC_FULL.md` §6). Stable; recovery
//! depends on it.
//!
//! ```text
//! <repo>/.opensprint/
//!   active/<taskId>/
//!     assignment.json, heartbeat.json, output.log, result.json,
//!     config.json, prompt.md, context/
//!   sessions/<taskId>-<attempt>/
//!     output.log, diff, result.json, metadata.json
//! <tmp>/opensprint-worktrees/<taskId>/   (worktree mode)
//! ```

use std::path::{Path, PathBuf};

pub fn opensprint_dir(workspace: &Path) -> PathBuf {
    workspace.join(".opensprint")
}

pub fn active_dir(workspace: &Path, task_id: &str) -> PathBuf {
    opensprint_dir(workspace).join("active").join(task_id)
}

pub fn assignment_path(workspace: &Path, task_id: &str) -> PathBuf {
    active_dir(workspace, task_id).join("assignment.json")
}

pub fn heartbeat_path(workspace: &Path, task_id: &str) -> PathBuf {
    active_dir(workspace, task_id).join("heartbeat.json")
}

pub fn output_log_path(workspace: &Path, task_id: &str) -> PathBuf {
    active_dir(workspace, task_id).join("output.log")
}

pub fn result_path(workspace: &Path, task_id: &str) -> PathBuf {
    active_dir(workspace, task_id).join("result.json")
}

pub fn config_json_path(workspace: &Path, task_id: &str) -> PathBuf {
    active_dir(workspace, task_id).join("config.json")
}

pub fn prompt_path(workspace: &Path, task_id: &str) -> PathBuf {
    active_dir(workspace, task_id).join("prompt.md")
}

pub fn context_dir(workspace: &Path, task_id: &str) -> PathBuf {
    active_dir(workspace, task_id).join("context")
}

/// Sessions always archive under the repo's primary `.opensprint`, not
/// the per-task worktree, since a worktree may be removed on teardown.
pub fn session_dir(repo: &Path, task_id: &str, attempt: u32) -> PathBuf {
    opensprint_dir(repo).join("sessions").join(format!("{task_id}-{attempt}"))
}

pub fn worktree_base(tmp_dir: &Path) -> PathBuf {
    tmp_dir.join("opensprint-worktrees")
}

/// Atomically write `contents` to `path` via write-to-tmp + rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
    ));
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

pub async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    write_atomic(path, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sub").join("file.json");
        write_atomic(&path, b"{}").await.expect("write");
        let contents = tokio::fs::read(&path).await.expect("read");
        assert_eq!(contents, b"{}");
    }
}
