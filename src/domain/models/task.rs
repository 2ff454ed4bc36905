//! Task domain model.
//!
//! A task is the unit of work the Execute core admits, runs, reviews, and
//! merges. Tasks are persisted in the task store and are the authoritative
//! source of truth for what must happen next (`SPEC_FULL.md` §3).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task in the Execute lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Blocked => "blocked",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s).ok_or_else(|| format!("invalid task status: {s}"))
    }
}

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    Feature,
    Task,
    Epic,
    Chore,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Chore => "chore",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bug" => Some(Self::Bug),
            "feature" => Some(Self::Feature),
            "task" => Some(Self::Task),
            "epic" => Some(Self::Epic),
            "chore" => Some(Self::Chore),
            _ => None,
        }
    }
}

/// Resolved or estimated complexity, used to gate `reviewMode: complex-only`
/// and to pick between `simpleComplexityAgent`/`complexComplexityAgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Complex,
}

/// Kind of dependency edge between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    Blocks,
    ParentChild,
    DiscoveredFrom,
    Related,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::ParentChild => "parent-child",
            Self::DiscoveredFrom => "discovered-from",
            Self::Related => "related",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(Self::Blocks),
            "parent-child" => Some(Self::ParentChild),
            "discovered-from" => Some(Self::DiscoveredFrom),
            "related" => Some(Self::Related),
            _ => None,
        }
    }
}

/// One dependency edge from a task to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub depends_on: String,
    pub kind: DependencyKind,
}

/// A discrete unit of work admitted and driven by the Execute core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable ID of the form `<epic>.<n>`.
    pub id: String,
    pub title: String,
    pub description: String,
    /// 0 (highest) through 4 (lowest).
    pub priority: u8,
    pub issue_type: IssueType,
    pub status: TaskStatus,
    pub close_reason: Option<String>,
    pub assignee: Option<String>,
    pub labels: BTreeSet<String>,
    pub dependencies: Vec<DependencyEdge>,
    pub complexity: Option<Complexity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

/// Prefix for the single-valued attempts counter label.
pub const ATTEMPTS_LABEL_PREFIX: &str = "attempts:";
/// Prefix for the single-valued review-attempts counter label.
pub const REVIEW_ATTEMPTS_LABEL_PREFIX: &str = "review-attempts:";

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            priority: 2,
            issue_type: IssueType::Task,
            status: TaskStatus::Open,
            close_reason: None,
            assignee: None,
            labels: BTreeSet::new(),
            dependencies: Vec::new(),
            complexity: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 1,
        }
    }

    /// Validate the struct-level invariants from `spec.md` §3.
    ///
    /// `status=blocked ⇒ blockReason ≠ null`; `status=closed ⇒
    /// completedAt ≠ null`; `assignee ≠ null ⇒ status ∈ {in_progress,
    /// closed}`; at most one `attempts:*` label is present at a time.
    pub fn validate(&self) -> Result<(), String> {
        if self.status == TaskStatus::Blocked && self.close_reason.is_none() {
            return Err(format!("task {} is blocked but has no close_reason", self.id));
        }
        if self.status == TaskStatus::Closed && self.completed_at.is_none() {
            return Err(format!("task {} is closed but has no completed_at", self.id));
        }
        if self.assignee.is_some()
            && !matches!(self.status, TaskStatus::InProgress | TaskStatus::Closed)
        {
            return Err(format!(
                "task {} has an assignee but status {:?} is neither in_progress nor closed",
                self.id, self.status
            ));
        }
        let attempt_labels = self
            .labels
            .iter()
            .filter(|l| l.starts_with(ATTEMPTS_LABEL_PREFIX))
            .count();
        if attempt_labels > 1 {
            return Err(format!("task {} has more than one attempts:* label", self.id));
        }
        Ok(())
    }

    fn counter_label(&self, prefix: &str) -> Option<u32> {
        self.labels
            .iter()
            .find_map(|l| l.strip_prefix(prefix).and_then(|n| n.parse::<u32>().ok()))
    }

    /// Current value of the `attempts:<n>` label, or 0 if absent.
    pub fn attempts(&self) -> u32 {
        self.counter_label(ATTEMPTS_LABEL_PREFIX).unwrap_or(0)
    }

    /// Current value of the `review-attempts:<n>` label, or 0 if absent.
    pub fn review_attempts(&self) -> u32 {
        self.counter_label(REVIEW_ATTEMPTS_LABEL_PREFIX).unwrap_or(0)
    }

    /// Replace the single-valued counter label matching `prefix` with `n`.
    fn set_counter_label(&mut self, prefix: &str, n: u32) {
        self.labels.retain(|l| !l.starts_with(prefix));
        self.labels.insert(format!("{prefix}{n}"));
    }

    pub fn set_attempts(&mut self, n: u32) {
        self.set_counter_label(ATTEMPTS_LABEL_PREFIX, n);
    }

    pub fn set_review_attempts(&mut self, n: u32) {
        self.set_counter_label(REVIEW_ATTEMPTS_LABEL_PREFIX, n);
    }

    pub fn increment_attempts(&mut self) -> u32 {
        let next = self.attempts() + 1;
        self.set_attempts(next);
        next
    }

    pub fn increment_review_attempts(&mut self) -> u32 {
        let next = self.review_attempts() + 1;
        self.set_review_attempts(next);
        next
    }

    /// Dependency IDs of kind `blocks`.
    pub fn blockers(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Blocks)
            .map(|d| d.depends_on.as_str())
    }

    pub fn mark_in_progress(&mut self, assignee: impl Into<String>) {
        self.status = TaskStatus::InProgress;
        self.assignee = Some(assignee.into());
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.updated_at = Utc::now();
    }

    pub fn close(&mut self) {
        self.status = TaskStatus::Closed;
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Blocked;
        self.close_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    /// Clear the assignee and return to `open` so the next `runLoop`
    /// pass can re-admit the task, e.g. after a re-queued recovery.
    pub fn reopen(&mut self) {
        self.status = TaskStatus::Open;
        self.assignee = None;
        self.updated_at = Utc::now();
    }

    /// Whether this task's synthetic assignee marks it as unassigned or
    /// placeholder-assigned (empty, or an `agent-N` placeholder), which is
    /// one of the two conditions the ready set admits on.
    pub fn has_admittable_assignee(&self) -> bool {
        match &self.assignee {
            None => true,
            Some(a) => is_agent_placeholder(a),
        }
    }
}

/// Whether `assignee` is a synthetic `agent-<n>` placeholder rather than a
/// real human/assignee identity.
pub fn is_agent_placeholder(assignee: &str) -> bool {
    assignee
        .strip_prefix("agent-")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}
