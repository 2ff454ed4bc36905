//! PhaseExecutor: drives one Slot through the coding→review→merge→teardown
//! lifecycle (`SPEC_FULL.md` §4.3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, Notify, RwLock};
use tracing::{info, instrument, warn};

use crate::config::{AgentConfig, ReviewMode, Settings};
use crate::domain::models::assignment::{AgentRole as AssignmentAgentRole, AssignmentRecord};
use crate::domain::models::{Complexity, DependencyKind, Phase, ResultDocument, ResultStatus, SessionMetadata, SessionOutcome, Slot};
use crate::domain::ports::TaskStore;
use crate::events::{ActiveTaskSummary, ExecuteEvent};
use crate::paths;

use super::agent_process::{AgentProcess, AgentRole, ExitReason};
use super::git_queue::{GitJob, GitQueue};
use super::output_broker::OutputBroker;
use super::workspace::BranchManager;

/// Everything one run of the state machine needs; owned by the
/// background task spawned from `ProjectRunner::admit`.
pub struct PhaseContext {
    pub project_id: String,
    pub task_id: String,
    pub title: String,
    pub repo_path: PathBuf,
    pub settings: Arc<Settings>,
    pub task_store: Arc<dyn TaskStore>,
    pub git_queue: Arc<GitQueue>,
    pub branch_manager: Arc<BranchManager>,
    pub output_broker: OutputBroker,
    pub events: broadcast::Sender<ExecuteEvent>,
    pub slots: Arc<RwLock<HashMap<String, Slot>>>,
    pub nudge: Arc<Notify>,
    pub cancelled: Arc<AtomicBool>,
    pub attempt: u32,
    /// Shared with the owning `ProjectRunner`'s status snapshot counters.
    pub total_done: Arc<AtomicU64>,
    pub total_failed: Arc<AtomicU64>,
    /// Opaque excerpt text from the spec-editor/planning collaborators
    /// (out of scope for the core itself); folded into `prompt.md`
    /// verbatim when present (`SPEC_FULL.md` §4.3).
    pub product_spec_excerpt: Option<String>,
    pub plan_excerpt: Option<String>,
}

fn broadcast_quiet(tx: &broadcast::Sender<ExecuteEvent>, event: ExecuteEvent) {
    let _ = tx.send(event);
}

/// Run the full coding→review→merge→teardown lifecycle for one task.
/// Returns once the task reaches a terminal state (closed or blocked)
/// or is cancelled.
#[instrument(skip(ctx), fields(task_id = %ctx.task_id))]
pub async fn execute_coding_phase(mut ctx: PhaseContext) {
    let branch = Slot::branch_for(&ctx.task_id);
    let worktree_path = match provision_workspace(&ctx, &branch).await {
        Ok(path) => path,
        Err(reason) => {
            block_task(&ctx, &reason).await;
            teardown(&ctx, &branch, None, SessionOutcome::Failed).await;
            return;
        }
    };

    register_slot(&ctx, &branch, &worktree_path).await;
    mark_in_progress(&ctx).await;

    'coding: loop {
        if ctx.cancelled.load(Ordering::SeqCst) {
            close_cancelled(&ctx, &worktree_path).await;
            teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Cancelled).await;
            return;
        }

        let outcome = run_coding_attempt(&ctx, &worktree_path, &branch, None).await;
        archive_session(&ctx, &worktree_path, &branch, outcome.into()).await;
        ctx.attempt += 1;

        match outcome {
            ResultStatus::Success => {
                match post_coding_gate(&ctx, &branch).await {
                    Ok(true) => {}
                    Ok(false) => {
                        if !retry_or_block(&ctx, "Coding Failure").await {
                            teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Failed).await;
                            return;
                        }
                        continue 'coding;
                    }
                    Err(_) => {
                        if !retry_or_block(&ctx, "Coding Failure").await {
                            teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Failed).await;
                            return;
                        }
                        continue 'coding;
                    }
                }
                break;
            }
            ResultStatus::Failed | ResultStatus::Rejected | ResultStatus::Approved => {
                if !retry_or_block(&ctx, "Coding Failure").await {
                    teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Failed).await;
                    return;
                }
                continue 'coding;
            }
        }
    }

    let complexity = resolve_complexity(&ctx).await;
    let needs_review = match ctx.settings.review_mode {
        ReviewMode::Never => false,
        ReviewMode::Always => true,
        ReviewMode::ComplexOnly => complexity == Some(Complexity::Complex),
    };

    if needs_review {
        loop {
            let decision = run_review_attempt(&ctx, &worktree_path, &branch).await;
            archive_session(&ctx, &worktree_path, &branch, decision.into()).await;
            ctx.attempt += 1;
            match decision {
                ResultStatus::Approved => break,
                ResultStatus::Rejected => {
                    if !retry_review_or_block(&ctx).await {
                        teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Failed).await;
                        return;
                    }
                    let feedback = read_result_doc(&worktree_path, &ctx.task_id).as_ref().map(format_review_feedback);
                    let outcome = run_coding_attempt(&ctx, &worktree_path, &branch, feedback.as_deref()).await;
                    archive_session(&ctx, &worktree_path, &branch, outcome.into()).await;
                    ctx.attempt += 1;
                    if outcome != ResultStatus::Success {
                        if !retry_or_block(&ctx, "Coding Failure").await {
                            teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Failed).await;
                            return;
                        }
                    }
                }
                ResultStatus::Success | ResultStatus::Failed => {
                    warn!("reviewer produced a non-review status, treating as rejected");
                    if !retry_review_or_block(&ctx).await {
                        teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Failed).await;
                        return;
                    }
                }
            }
        }
    }

    if !run_merge_with_rebase(&mut ctx, &worktree_path, &branch).await {
        teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Failed).await;
        return;
    }

    close_success(&ctx).await;
    teardown(&ctx, &branch, Some(&worktree_path), SessionOutcome::Success).await;
}

async fn provision_workspace(ctx: &PhaseContext, branch: &str) -> Result<PathBuf, String> {
    use crate::config::GitWorkingMode;
    match ctx.settings.git_working_mode {
        GitWorkingMode::Worktree => {
            let outcome = ctx
                .git_queue
                .enqueue_and_wait(&ctx.repo_path.display().to_string(), GitJob::CreateWorktree {
                    task_id: ctx.task_id.clone(),
                })
                .await
                .map_err(|e| format!("failed to provision worktree: {e}"))?;
            outcome.path.ok_or_else(|| "git queue returned no worktree path".to_string())
        }
        GitWorkingMode::Branches => {
            ctx.git_queue
                .enqueue_and_wait(&ctx.repo_path.display().to_string(), GitJob::CreateOrCheckoutBranch {
                    branch: branch.to_string(),
                })
                .await
                .map_err(|e| format!("failed to checkout branch: {e}"))?;
            Ok(ctx.repo_path.clone())
        }
    }
}

/// Update the placeholder [`Slot`] `ProjectRunner::admit` inserted
/// synchronously, now that the workspace is provisioned, rather than
/// inserting a fresh one. Admission already holds the slot so that a
/// same-pass re-admission attempt sees it as taken even while
/// provisioning is still in flight.
async fn register_slot(ctx: &PhaseContext, branch: &str, worktree_path: &PathBuf) {
    let mut slots = ctx.slots.write().await;
    match slots.get_mut(&ctx.task_id) {
        Some(slot) => {
            slot.worktree_path = worktree_path.clone();
            slot.branch_name = branch.to_string();
            slot.phase = Phase::Coding;
        }
        None => {
            let mut slot = Slot::new(ctx.task_id.clone(), ctx.title.clone(), branch.to_string(), worktree_path.clone(), ctx.attempt);
            slot.phase = Phase::Coding;
            slots.insert(ctx.task_id.clone(), slot);
        }
    }
}

async fn mark_in_progress(ctx: &PhaseContext) {
    let agent_label = format!("agent-{}", ctx.attempt);
    let result = ctx
        .task_store
        .update(&ctx.project_id, &ctx.task_id, &|task| task.mark_in_progress(agent_label.clone()))
        .await;
    if let Err(e) = result {
        warn!(error = %e, "failed to mark task in_progress");
    }
    broadcast_quiet(&ctx.events, ExecuteEvent::TaskUpdated { task_id: ctx.task_id.clone() });
    broadcast_status(ctx).await;
}

/// Compose an `execute.status` event from the live slot map and the
/// task store's ready set, mirroring `ProjectRunner::status` (`SPEC_FULL.md`
/// §4.3 step 6: admission and teardown both broadcast the project's
/// current status).
async fn broadcast_status(ctx: &PhaseContext) {
    let slots = ctx.slots.read().await;
    let active_tasks = slots
        .values()
        .map(|slot| ActiveTaskSummary {
            task_id: slot.task_id.clone(),
            title: slot.title.clone(),
            phase: slot.phase.as_str().to_string(),
            attempt: slot.attempt,
        })
        .collect();
    let queue_depth = ctx
        .task_store
        .ready(&ctx.project_id)
        .await
        .map(|tasks| tasks.into_iter().filter(|t| !slots.contains_key(&t.id)).count() as u32)
        .unwrap_or(0);
    drop(slots);

    broadcast_quiet(&ctx.events, ExecuteEvent::Status {
        active_tasks,
        queue_depth,
        total_done: ctx.total_done.load(Ordering::SeqCst),
        total_failed: ctx.total_failed.load(Ordering::SeqCst),
    });
}

/// A task without its own `complexity` inherits the owning plan's
/// estimate (`SPEC_FULL.md` §3); the epic id is the task id with its
/// last `.N` segment dropped.
async fn resolve_complexity(ctx: &PhaseContext) -> Option<Complexity> {
    let task = ctx.task_store.show(&ctx.project_id, &ctx.task_id).await.ok()?;
    let epic_id = epic_id_for(&ctx.task_id);
    let plan = ctx.task_store.get_plan(&ctx.project_id, epic_id).await.ok().flatten();
    match plan {
        Some(plan) => plan.resolve_complexity(task.complexity),
        None => task.complexity,
    }
}

fn epic_id_for(task_id: &str) -> &str {
    task_id.rsplit_once('.').map(|(epic, _)| epic).unwrap_or(task_id)
}

fn agent_config_for(ctx: &PhaseContext, complexity: Option<Complexity>) -> AgentConfig {
    match complexity {
        Some(Complexity::Complex) => ctx.settings.complex_complexity_agent.clone(),
        _ => ctx.settings.simple_complexity_agent.clone(),
    }
}

async fn run_agent(
    ctx: &PhaseContext,
    worktree_path: &PathBuf,
    role: AgentRole,
    config: &AgentConfig,
) -> ResultStatus {
    let active_dir = paths::active_dir(worktree_path, &ctx.task_id);
    let assignment = AssignmentRecord::new(
        ctx.task_id.clone(),
        match role {
            AgentRole::Coder => Phase::Coding,
            AgentRole::Reviewer => Phase::Review,
        },
        Slot::branch_for(&ctx.task_id),
        worktree_path.display().to_string(),
        ctx.attempt,
        match role {
            AgentRole::Coder => AssignmentAgentRole::Coder,
            AgentRole::Reviewer => AssignmentAgentRole::Reviewer,
        },
    );
    if let Err(e) = paths::write_json_atomic(&paths::assignment_path(worktree_path, &ctx.task_id), &assignment).await {
        warn!(error = %e, "failed to persist assignment record");
    }

    let agent = Arc::new(AgentProcess::new(ctx.task_id.clone(), active_dir));
    let (tx, rx) = oneshot::channel();
    let broker = ctx.output_broker.clone();
    let polling = &ctx.settings.polling;

    let run_result = agent
        .run(
            config,
            worktree_path,
            broker,
            polling.output_poll_ms,
            polling.result_poll_ms,
            polling.heartbeat_interval_secs,
            polling.agent_kill_grace_secs,
            polling.inactivity_timeout_secs,
            move |reason| {
                let _ = tx.send(reason);
            },
        )
        .await;

    if let Err(e) = run_result {
        warn!(error = %e, "agent process supervision errored");
        return ResultStatus::Failed;
    }

    let status = match rx.await {
        Ok(ExitReason::Result(status)) => status,
        Ok(ExitReason::NaturalExit(0)) => result_or_default(worktree_path, &ctx.task_id, ResultStatus::Success),
        _ => ResultStatus::Failed,
    };

    let test_results_passed = read_result_doc(worktree_path, &ctx.task_id).and_then(|doc| doc.test_results).map(|t| t.passed);
    broadcast_quiet(&ctx.events, ExecuteEvent::AgentCompleted {
        task_id: ctx.task_id.clone(),
        status,
        test_results_passed,
    });

    status
}

fn result_or_default(worktree_path: &PathBuf, task_id: &str, default: ResultStatus) -> ResultStatus {
    let result_path = paths::result_path(worktree_path, task_id);
    std::fs::read(result_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<crate::domain::models::ResultDocument>(&bytes).ok())
        .map(|doc| doc.status)
        .unwrap_or(default)
}

/// Write `config.json`, `prompt.md`, and per-dependency diff excerpts
/// under `<worktree>/.opensprint/active/<taskId>/` so the agent has
/// everything it needs without talking to the task store itself
/// (`SPEC_FULL.md` §4.3). `feedback` carries the previous reviewer's
/// (or merge conflict's) notes into the next coding prompt.
async fn write_context(ctx: &PhaseContext, worktree_path: &PathBuf, feedback: Option<&str>) {
    let task = match ctx.task_store.show(&ctx.project_id, &ctx.task_id).await {
        Ok(task) => task,
        Err(e) => {
            warn!(error = %e, "failed to load task for context assembly");
            return;
        }
    };

    let config = serde_json::json!({
        "taskId": task.id,
        "title": task.title,
        "issueType": task.issue_type.as_str(),
        "priority": task.priority,
        "attempt": ctx.attempt,
        "testFramework": ctx.settings.test_framework,
        "testCommand": ctx.settings.test_command,
    });
    if let Err(e) = paths::write_json_atomic(&paths::config_json_path(worktree_path, &ctx.task_id), &config).await {
        warn!(error = %e, "failed to write config.json");
    }

    let mut prompt = format!("# {}: {}\n\n{}\n", task.id, task.title, task.description);
    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\n## Feedback from the previous attempt\n\n{feedback}\n"));
    }
    if let Some(excerpt) = &ctx.product_spec_excerpt {
        prompt.push_str(&format!("\n## Product spec excerpt\n\n{excerpt}\n"));
    }
    if let Some(excerpt) = &ctx.plan_excerpt {
        prompt.push_str(&format!("\n## Plan excerpt\n\n{excerpt}\n"));
    }
    if let Err(e) = paths::write_atomic(&paths::prompt_path(worktree_path, &ctx.task_id), prompt.as_bytes()).await {
        warn!(error = %e, "failed to write prompt.md");
    }

    let context_dir = paths::context_dir(worktree_path, &ctx.task_id);
    if let Err(e) = tokio::fs::create_dir_all(&context_dir).await {
        warn!(error = %e, "failed to create context directory");
        return;
    }
    for dep in task
        .dependencies
        .iter()
        .filter(|d| matches!(d.kind, DependencyKind::Blocks | DependencyKind::ParentChild))
    {
        let branch = Slot::branch_for(&dep.depends_on);
        if let Ok(diff) = ctx.branch_manager.capture_branch_diff(&branch).await {
            if !diff.trim().is_empty() {
                tokio::fs::write(context_dir.join(format!("{}.diff", dep.depends_on)), diff).await.ok();
            }
        }
    }
}

fn format_review_feedback(doc: &ResultDocument) -> String {
    let mut text = doc.summary.clone();
    if let Some(issues) = &doc.issues {
        if !issues.is_empty() {
            text.push_str("\n\nIssues raised:\n");
            for issue in issues {
                text.push_str(&format!("- {issue}\n"));
            }
        }
    }
    text
}

fn read_result_doc(worktree_path: &PathBuf, task_id: &str) -> Option<ResultDocument> {
    let bytes = std::fs::read(paths::result_path(worktree_path, task_id)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn run_coding_attempt(ctx: &PhaseContext, worktree_path: &PathBuf, _branch: &str, feedback: Option<&str>) -> ResultStatus {
    let complexity = resolve_complexity(ctx).await;
    let config = agent_config_for(ctx, complexity);
    info!(attempt = ctx.attempt, "starting coding attempt");
    write_context(ctx, worktree_path, feedback).await;
    run_agent(ctx, worktree_path, AgentRole::Coder, &config).await
}

async fn run_review_attempt(ctx: &PhaseContext, worktree_path: &PathBuf, _branch: &str) -> ResultStatus {
    let config = ctx.settings.complex_complexity_agent.clone();
    info!("starting review attempt");
    write_context(ctx, worktree_path, None).await;
    run_agent(ctx, worktree_path, AgentRole::Reviewer, &config).await
}

async fn post_coding_gate(ctx: &PhaseContext, branch: &str) -> Result<bool, ()> {
    ctx.branch_manager.get_commit_count_ahead(branch).await.map(|n| n > 0).map_err(|_| ())
}

/// Increment `attempts:n`; if the cap is exceeded, close the task
/// `blocked` with `reason` and return `false`. Otherwise keep the slot
/// and return `true` so the caller re-enters coding.
async fn retry_or_block(ctx: &PhaseContext, reason: &str) -> bool {
    let next = ctx
        .task_store
        .update(&ctx.project_id, &ctx.task_id, &|task| {
            task.increment_attempts();
        })
        .await
        .map(|t| t.attempts())
        .unwrap_or(u32::MAX);

    if next >= ctx.settings.max_coding_attempts {
        block_task(ctx, reason).await;
        false
    } else {
        true
    }
}

async fn retry_review_or_block(ctx: &PhaseContext) -> bool {
    let next = ctx
        .task_store
        .update(&ctx.project_id, &ctx.task_id, &|task| {
            task.increment_review_attempts();
        })
        .await
        .map(|t| t.review_attempts())
        .unwrap_or(u32::MAX);

    if next >= ctx.settings.max_review_attempts {
        block_task(ctx, "Review Failure").await;
        false
    } else {
        true
    }
}

async fn block_task(ctx: &PhaseContext, reason: &str) {
    if let Err(e) = ctx.task_store.block(&ctx.project_id, &ctx.task_id, reason).await {
        warn!(error = %e, "failed to mark task blocked");
    }
    ctx.total_failed.fetch_add(1, Ordering::SeqCst);
    broadcast_quiet(&ctx.events, ExecuteEvent::TaskUpdated { task_id: ctx.task_id.clone() });
}

async fn close_success(ctx: &PhaseContext) {
    if let Err(e) = ctx.task_store.close(&ctx.project_id, &ctx.task_id, "Completed").await {
        warn!(error = %e, "failed to mark task closed");
    }
    ctx.total_done.fetch_add(1, Ordering::SeqCst);
    broadcast_quiet(&ctx.events, ExecuteEvent::TaskUpdated { task_id: ctx.task_id.clone() });
}

async fn close_cancelled(ctx: &PhaseContext, worktree_path: &PathBuf) {
    ctx.branch_manager.commit_wip(worktree_path, &ctx.task_id).await.ok();
    block_task(ctx, "Cancelled").await;
}

/// Enqueue a single merge job; on conflict, run a rebase sub-phase
/// (coding-style agent with a merge-conflict prompt) before retrying,
/// up to `max_coding_attempts`. Repeated failures escalate to blocked.
async fn run_merge_with_rebase(ctx: &mut PhaseContext, worktree_path: &PathBuf, branch: &str) -> bool {
    for _ in 0..ctx.settings.max_coding_attempts {
        let repo = ctx.repo_path.display().to_string();
        let result = ctx.git_queue.enqueue_and_wait(&repo, GitJob::Merge { branch: branch.to_string() }).await;
        match result {
            Ok(_) => {
                if ctx.settings.push_best_effort {
                    ctx.git_queue.enqueue(&repo, GitJob::Push);
                } else {
                    ctx.git_queue.enqueue_and_wait(&repo, GitJob::Push).await.ok();
                }
                ctx.git_queue.enqueue(&repo, GitJob::DeleteBranch { branch: branch.to_string() });
                return true;
            }
            Err(crate::domain::errors::ExecuteError::MergeConflict { .. }) => {
                warn!(branch, "merge conflict, entering rebase sub-phase");
                let config = agent_config_for(ctx, resolve_complexity(ctx).await);
                let feedback = format!(
                    "Merging `{branch}` into `main` produced conflicts. Rebase onto the latest \
                     `main` and resolve them, then leave the working tree clean and committed."
                );
                write_context(ctx, worktree_path, Some(&feedback)).await;
                let outcome = run_agent(ctx, worktree_path, AgentRole::Coder, &config).await;
                archive_session(ctx, worktree_path, branch, outcome.into()).await;
                ctx.attempt += 1;
                if outcome != ResultStatus::Success {
                    continue;
                }
            }
            Err(e) => {
                warn!(error = %e, "merge job failed for a non-conflict reason");
                return false;
            }
        }
    }
    block_task(ctx, "Merge Failure").await;
    false
}

async fn archive_session(ctx: &PhaseContext, worktree_path: &PathBuf, branch: &str, outcome: SessionOutcome) {
    let dir = paths::session_dir(&ctx.repo_path, &ctx.task_id, ctx.attempt);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(error = %e, "failed to create session archive directory");
        return;
    }

    let output_log = paths::output_log_path(worktree_path, &ctx.task_id);
    if let Ok(bytes) = tokio::fs::read(&output_log).await {
        tokio::fs::write(dir.join("output.log"), bytes).await.ok();
    }
    if let Ok(diff) = ctx.branch_manager.capture_branch_diff(branch).await {
        tokio::fs::write(dir.join("diff"), diff).await.ok();
    }
    let result_path = paths::result_path(worktree_path, &ctx.task_id);
    if let Ok(bytes) = tokio::fs::read(&result_path).await {
        tokio::fs::write(dir.join("result.json"), bytes).await.ok();
    }

    let metadata = SessionMetadata {
        task_id: ctx.task_id.clone(),
        attempt: ctx.attempt,
        outcome,
        branch_name: branch.to_string(),
        started_at: chrono::Utc::now(),
        archived_at: chrono::Utc::now(),
    };
    paths::write_json_atomic(&dir.join("metadata.json"), &metadata).await.ok();
}

/// Archive the session, clean the active directory, delete the
/// assignment/heartbeat, free the slot, broadcast, and nudge the next
/// runLoop pass.
async fn teardown(ctx: &PhaseContext, branch: &str, worktree_path: Option<&PathBuf>, _outcome: SessionOutcome) {
    if let Some(worktree_path) = worktree_path {
        let active = paths::active_dir(worktree_path, &ctx.task_id);
        tokio::fs::remove_dir_all(&active).await.ok();

        use crate::config::GitWorkingMode;
        if ctx.settings.git_working_mode == GitWorkingMode::Worktree {
            ctx.git_queue.enqueue(
                &ctx.repo_path.display().to_string(),
                GitJob::RemoveWorktree { task_id: ctx.task_id.clone() },
            );
        }
    }
    let _ = branch;

    ctx.slots.write().await.remove(&ctx.task_id);
    broadcast_quiet(&ctx.events, ExecuteEvent::TaskUpdated { task_id: ctx.task_id.clone() });
    broadcast_status(ctx).await;
    ctx.nudge.notify_one();
}
