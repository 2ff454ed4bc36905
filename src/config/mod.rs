//! Project-scoped settings for the Execute core.
//!
//! Layered configuration: programmatic defaults, then project YAML, then
//! local YAML overrides, then environment variables — assembled by
//! [`loader::ConfigLoader`].

mod loader;

pub use loader::{ConfigError, ConfigLoader};

use serde::{Deserialize, Serialize};

/// Git workspace strategy (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitWorkingMode {
    Worktree,
    Branches,
}

impl Default for GitWorkingMode {
    fn default() -> Self {
        Self::Worktree
    }
}

/// Gate controlling whether the review phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    Never,
    Always,
    ComplexOnly,
}

impl Default for ReviewMode {
    fn default() -> Self {
        Self::ComplexOnly
    }
}

/// Deployment-trigger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub auto_deploy_on_epic_completion: bool,
    pub auto_resolve_feedback_on_task_completion: bool,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            auto_deploy_on_epic_completion: false,
            auto_resolve_feedback_on_task_completion: true,
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".opensprint/execute.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Logging sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: ".opensprint/logs".to_string(),
        }
    }
}

/// Polling cadence for the AgentProcess supervisor and RecoveryCoordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub output_poll_ms: u64,
    pub result_poll_ms: u64,
    pub recovery_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub agent_kill_grace_secs: u64,
    pub inactivity_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            output_poll_ms: 150,
            result_poll_ms: 2_000,
            recovery_interval_secs: 60,
            heartbeat_interval_secs: 30,
            agent_kill_grace_secs: 15,
            inactivity_timeout_secs: 1_200,
        }
    }
}

/// GitQueue timeout and lock-wait settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitQueueConfig {
    pub job_timeout_secs: u64,
    pub merge_timeout_secs: u64,
    pub lock_stale_secs: u64,
    pub lock_wait_cap_secs: u64,
}

impl Default for GitQueueConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 30,
            merge_timeout_secs: 600,
            lock_stale_secs: 30,
            lock_wait_cap_secs: 15,
        }
    }
}

/// Identity of an agent executable by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    ClaudeApi,
    ClaudeCli,
    Cursor,
    Custom,
}

impl Default for AgentKind {
    fn default() -> Self {
        Self::ClaudeCli
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub kind: AgentKind,
    pub executable: String,
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: AgentKind::ClaudeCli,
            executable: "claude".to_string(),
            args: Vec::new(),
        }
    }
}

/// Per-project settings recognized by the Execute core (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_concurrent_coders: u32,
    pub git_working_mode: GitWorkingMode,
    pub review_mode: ReviewMode,
    pub test_framework: Option<String>,
    pub test_command: Option<String>,
    pub simple_complexity_agent: AgentConfig,
    pub complex_complexity_agent: AgentConfig,
    pub max_coding_attempts: u32,
    pub max_review_attempts: u32,
    pub push_best_effort: bool,
    pub deployment: DeploymentConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub polling: PollingConfig,
    pub git_queue: GitQueueConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_coders: 2,
            git_working_mode: GitWorkingMode::default(),
            review_mode: ReviewMode::default(),
            test_framework: None,
            test_command: None,
            simple_complexity_agent: AgentConfig::default(),
            complex_complexity_agent: AgentConfig::default(),
            max_coding_attempts: 3,
            max_review_attempts: 3,
            push_best_effort: true,
            deployment: DeploymentConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            polling: PollingConfig::default(),
            git_queue: GitQueueConfig::default(),
        }
    }
}

impl Settings {
    /// Effective slot cap: forced to 1 in `branches` mode since a single
    /// checkout cannot host two concurrent working copies.
    pub fn effective_max_slots(&self) -> u32 {
        match self.git_working_mode {
            GitWorkingMode::Branches => 1,
            GitWorkingMode::Worktree => self.max_concurrent_coders,
        }
    }
}
