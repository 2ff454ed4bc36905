//! Error taxonomy for the Execute core.
//!
//! Mirrors the error handling design in `SPEC_FULL.md` §7: each variant
//! corresponds to one bucket of the taxonomy (transient git, spawn
//! failure, invalid agent result, merge conflict, credential/rate-limit,
//! task-store outage, catastrophic invariant violation) rather than to a
//! particular call site.

use thiserror::Error;

/// Errors surfaced by the Execute core.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("transient git failure on {repo}: {0}", repo = .repo)]
    TransientGit { repo: String, source: String },

    #[error("git operation failed on {repo}: {0}", repo = .repo)]
    GitFailed { repo: String, source: String },

    #[error("agent spawn failed for task {task_id}: {reason}")]
    SpawnFailure { task_id: String, reason: String },

    #[error("agent credential or rate limit hit for task {task_id}: {hint}")]
    CredentialOrRateLimit { task_id: String, hint: String },

    #[error("agent produced an invalid or missing result for task {task_id}")]
    InvalidResult { task_id: String },

    #[error("merge conflict merging {branch} into {target}")]
    MergeConflict { branch: String, target: String },

    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("project not running: {0}")]
    ProjectNotRunning(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),
}

pub type ExecuteResult<T> = Result<T, ExecuteError>;

impl From<sqlx::Error> for ExecuteError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ExecuteError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ExecuteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ExecuteError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
