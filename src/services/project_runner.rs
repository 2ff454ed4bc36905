//! ProjectRunner: for one project, admits work and manages slots
//! (`SPEC_FULL.md` §4.2).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{info, instrument, warn};

use crate::config::Settings;
use crate::domain::models::Slot;
use crate::domain::ports::TaskStore;
use crate::events::{ActiveTaskSummary, ExecuteEvent};

use super::git_queue::GitQueue;
use super::output_broker::OutputBroker;
use super::phase_executor::{self, PhaseContext};
use super::workspace::BranchManager;

/// How long a single `runLoop` pass may run before the stuck-loop guard
/// clears the single-flight flag and re-nudges.
const STUCK_LOOP_GUARD: Duration = Duration::from_secs(5 * 60);

pub struct StatusSnapshot {
    pub active_tasks: Vec<ActiveTaskSummary>,
    pub queue_depth: u32,
    pub total_done: u64,
    pub total_failed: u64,
}

/// Owns a bounded set of [`Slot`]s for one project and admits ready
/// tasks into them.
pub struct ProjectRunner {
    project_id: String,
    repo_path: PathBuf,
    settings: Arc<Settings>,
    task_store: Arc<dyn TaskStore>,
    git_queue: Arc<GitQueue>,
    branch_manager: Arc<BranchManager>,
    output_broker: OutputBroker,
    events: broadcast::Sender<ExecuteEvent>,
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    nudge_signal: Arc<Notify>,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    total_done: Arc<AtomicU64>,
    total_failed: Arc<AtomicU64>,
}

impl ProjectRunner {
    pub fn new(
        project_id: impl Into<String>,
        repo_path: PathBuf,
        settings: Arc<Settings>,
        task_store: Arc<dyn TaskStore>,
        git_queue: Arc<GitQueue>,
        branch_manager: Arc<BranchManager>,
        output_broker: OutputBroker,
        events: broadcast::Sender<ExecuteEvent>,
    ) -> Arc<Self> {
        let runner = Arc::new(Self {
            project_id: project_id.into(),
            repo_path,
            settings,
            task_store,
            git_queue,
            branch_manager,
            output_broker,
            events,
            slots: Arc::new(RwLock::new(HashMap::new())),
            nudge_signal: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(true)),
            in_flight: Arc::new(AtomicBool::new(false)),
            total_done: Arc::new(AtomicU64::new(0)),
            total_failed: Arc::new(AtomicU64::new(0)),
        });
        runner.clone().spawn_loop_driver();
        runner
    }

    fn spawn_loop_driver(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                self.nudge_signal.notified().await;
                if !self.running.load(Ordering::SeqCst) {
                    continue;
                }
                if self.in_flight.swap(true, Ordering::SeqCst) {
                    // a pass is already in flight; this nudge is coalesced
                    // into the one currently running.
                    continue;
                }
                let this = self.clone();
                let guard_flag = self.in_flight.clone();
                let pass = tokio::spawn(async move { this.run_loop_pass().await });
                match tokio::time::timeout(STUCK_LOOP_GUARD, pass).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "runLoop pass panicked"),
                    Err(_) => warn!("runLoop pass exceeded the stuck-loop guard, clearing and re-nudging"),
                }
                guard_flag.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Single-shot signal that a new runLoop pass should occur soon;
    /// multiple calls within an epoch coalesce into one pass.
    pub fn nudge(&self) {
        self.nudge_signal.notify_one();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    #[instrument(skip(self), fields(project_id = %self.project_id))]
    async fn run_loop_pass(&self) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let free_slots = {
                let slots = self.slots.read().await;
                self.settings.effective_max_slots().saturating_sub(slots.len() as u32)
            };
            if free_slots == 0 {
                return;
            }

            let ready = match self.task_store.ready(&self.project_id).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(error = %e, "failed to query ready set, backing off until next nudge");
                    return;
                }
            };

            let slotted: std::collections::HashSet<String> = self.slots.read().await.keys().cloned().collect();
            let mut admitted_any = false;
            for task in ready.into_iter().filter(|t| !slotted.contains(&t.id)).take(free_slots as usize) {
                self.admit(task).await;
                admitted_any = true;
            }
            if !admitted_any {
                return;
            }
        }
    }

    async fn admit(&self, task: crate::domain::models::Task) {
        let attempt = task.attempts() + 1;
        info!(task_id = %task.id, attempt, "admitting task");

        // Insert the Slot synchronously, before spawning the background
        // PhaseExecutor, so a repeated runLoop iteration within the same
        // pass (whose `ready()`/slot-map snapshots may otherwise still be
        // stale because workspace provisioning hasn't finished) can never
        // admit the same task twice.
        let branch = Slot::branch_for(&task.id);
        let placeholder = Slot::new(task.id.clone(), task.title.clone(), branch, self.repo_path.clone(), attempt);
        self.slots.write().await.insert(task.id.clone(), placeholder);

        let ctx = PhaseContext {
            project_id: self.project_id.clone(),
            task_id: task.id.clone(),
            title: task.title.clone(),
            repo_path: self.repo_path.clone(),
            settings: self.settings.clone(),
            task_store: self.task_store.clone(),
            git_queue: self.git_queue.clone(),
            branch_manager: self.branch_manager.clone(),
            output_broker: self.output_broker.clone(),
            events: self.events.clone(),
            slots: self.slots.clone(),
            nudge: self.nudge_signal.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
            attempt,
            total_done: self.total_done.clone(),
            total_failed: self.total_failed.clone(),
            product_spec_excerpt: None,
            plan_excerpt: None,
        };
        tokio::spawn(phase_executor::execute_coding_phase(ctx));
    }

    /// Compose a status snapshot, reconciling the Slot set against the
    /// task store. An *empty* `list_all` never removes slots (guards
    /// against a wrong-database read); a *non-empty* result that omits a
    /// slot's task means the task was archived elsewhere.
    pub async fn status(&self) -> StatusSnapshot {
        let all = self.task_store.list_all(&self.project_id).await.unwrap_or_default();
        if !all.is_empty() {
            let known: std::collections::HashSet<_> = all.iter().map(|t| t.id.clone()).collect();
            let mut slots = self.slots.write().await;
            slots.retain(|task_id, _| known.contains(task_id));
        }

        let slots = self.slots.read().await;
        let active_tasks = slots
            .values()
            .map(|slot| ActiveTaskSummary {
                task_id: slot.task_id.clone(),
                title: slot.title.clone(),
                phase: slot.phase.as_str().to_string(),
                attempt: slot.attempt,
            })
            .collect();
        let queue_depth = self
            .task_store
            .ready(&self.project_id)
            .await
            .map(|tasks| tasks.into_iter().filter(|t| !slots.contains_key(&t.id)).count() as u32)
            .unwrap_or(0);

        StatusSnapshot {
            active_tasks,
            queue_depth,
            total_done: self.total_done.load(Ordering::SeqCst),
            total_failed: self.total_failed.load(Ordering::SeqCst),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// The shared slots map, handed to a [`crate::services::recovery::RecoveryCoordinator`]
    /// constructed for the same project so reattachment and admission
    /// observe a single source of truth.
    pub fn slots_handle(&self) -> Arc<RwLock<HashMap<String, Slot>>> {
        self.slots.clone()
    }

    /// The shared nudge signal, so recovery can wake `runLoop` after
    /// reattaching or re-queuing a task.
    pub fn nudge_handle(&self) -> Arc<Notify> {
        self.nudge_signal.clone()
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }
}
