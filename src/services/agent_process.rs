//! AgentProcess: spawns, observes, and terminates one agent subprocess,
//! translating its exit and `result.json` writes into a single `onExit`
//! callback fired exactly once (`SPEC_FULL.md` §4.4).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{info, instrument, warn};

use crate::config::AgentConfig;
use crate::domain::errors::ExecuteResult;
use crate::domain::models::{Heartbeat, ResultDocument, ResultStatus};
use crate::paths;

use super::output_broker::OutputBroker;

/// Role an agent plays in the current phase, used only to pick config
/// and label output; the supervision logic is identical either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Coder,
    Reviewer,
}

/// Outcome handed to the caller-supplied `on_exit` callback, fired
/// exactly once per spawned process.
#[derive(Debug, Clone, Copy)]
pub enum ExitReason {
    /// Derived from a terminal `result.json` status.
    Result(ResultStatus),
    /// The OS reported the child exited and no result was ever observed.
    NaturalExit(i32),
    /// `kill()` was called explicitly (cancellation).
    Cancelled,
    /// No output growth for the configured inactivity window.
    Inactivity,
    /// The executable could not be spawned at all.
    SpawnFailure(String),
}

impl ExitReason {
    pub fn as_exit_code(&self) -> i32 {
        match self {
            Self::Result(status) => status.as_exit_code(),
            Self::NaturalExit(code) => *code,
            Self::Cancelled => -1,
            Self::Inactivity => -2,
            Self::SpawnFailure(_) => 1,
        }
    }
}

/// Supervises one subprocess for the lifetime of a task attempt.
pub struct AgentProcess {
    task_id: String,
    active_dir: PathBuf,
    output_log: PathBuf,
    result_path: PathBuf,
    heartbeat_path: PathBuf,
    pid: Mutex<Option<u32>>,
    exit_notified: AtomicBool,
    killed: AtomicBool,
}

impl AgentProcess {
    pub fn new(task_id: impl Into<String>, active_dir: PathBuf) -> Self {
        let task_id = task_id.into();
        let output_log = active_dir.join("output.log");
        let result_path = active_dir.join("result.json");
        let heartbeat_path = active_dir.join("heartbeat.json");
        Self {
            task_id,
            active_dir,
            output_log,
            result_path,
            heartbeat_path,
            pid: Mutex::new(None),
            exit_notified: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        *self.pid.lock().await
    }

    /// Spawn the configured executable in its own process group with
    /// stdout/stderr redirected to `output.log`, and drive it to
    /// completion, invoking `on_exit` exactly once.
    #[instrument(skip(self, config, broker, on_exit))]
    pub async fn run(
        self: Arc<Self>,
        config: &AgentConfig,
        cwd: &Path,
        broker: OutputBroker,
        output_poll_ms: u64,
        result_poll_ms: u64,
        heartbeat_interval_secs: u64,
        kill_grace_secs: u64,
        inactivity_timeout_secs: u64,
        on_exit: impl FnOnce(ExitReason) + Send + 'static,
    ) -> ExecuteResult<()> {
        tokio::fs::create_dir_all(&self.active_dir).await?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_log)?;
        let log_file_err = log_file.try_clone()?;

        let mut command = Command::new(&config.executable);
        command
            .args(&config.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));

        // Put the child in its own process group (pgid == its pid) so a
        // signal to the group reaches any descendants it spawns without
        // reaching us. `process_group(0)` asks the kernel to use the
        // child's own pid as the group id.
        #[cfg(unix)]
        command.process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("[Agent error: failed to spawn {}: {e}]\n", config.executable);
                tokio::fs::write(&self.output_log, &message).await.ok();
                broker.publish(&self.task_id, message.as_bytes()).await;
                on_exit(ExitReason::SpawnFailure(e.to_string()));
                return Ok(());
            }
        };

        let pid = child.id();
        *self.pid.lock().await = pid;
        if let Some(pid) = pid {
            self.write_heartbeat(pid).await;
        }

        self.supervise(
            child,
            broker,
            output_poll_ms,
            result_poll_ms,
            heartbeat_interval_secs,
            kill_grace_secs,
            inactivity_timeout_secs,
            on_exit,
        )
        .await
    }

    async fn write_heartbeat(&self, pid: u32) {
        if let Err(e) = paths::write_json_atomic(&self.heartbeat_path, &Heartbeat::now(pid)).await {
            warn!(error = %e, "failed to write heartbeat");
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut child: Child,
        broker: OutputBroker,
        output_poll_ms: u64,
        result_poll_ms: u64,
        heartbeat_interval_secs: u64,
        kill_grace_secs: u64,
        inactivity_timeout_secs: u64,
        on_exit: impl FnOnce(ExitReason) + Send + 'static,
    ) -> ExecuteResult<()> {
        let mut output_offset: u64 = 0;
        let mut output_interval = interval(Duration::from_millis(output_poll_ms));
        let mut result_interval = interval(Duration::from_millis(result_poll_ms));
        let mut heartbeat_interval = interval(Duration::from_secs(heartbeat_interval_secs.max(1)));
        let mut last_growth = tokio::time::Instant::now();
        let inactivity_timeout = Duration::from_secs(inactivity_timeout_secs);

        let reason = loop {
            tokio::select! {
                _ = output_interval.tick() => {
                    if self.poll_output(&mut output_offset, &broker).await.unwrap_or(false) {
                        last_growth = tokio::time::Instant::now();
                    } else if last_growth.elapsed() >= inactivity_timeout {
                        break ExitReason::Inactivity;
                    }
                }
                _ = result_interval.tick() => {
                    if let Some(status) = self.poll_result().await {
                        break ExitReason::Result(status);
                    }
                }
                _ = heartbeat_interval.tick() => {
                    if let Some(pid) = *self.pid.lock().await {
                        self.write_heartbeat(pid).await;
                    }
                }
                status = child.wait() => {
                    if !self.exit_notified.load(Ordering::SeqCst) {
                        self.poll_output(&mut output_offset, &broker).await.ok();
                        let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                        break ExitReason::NaturalExit(code);
                    }
                }
            }
        };

        if !self.exit_notified.swap(true, Ordering::SeqCst) {
            broker.close(&self.task_id).await;
            if !matches!(reason, ExitReason::NaturalExit(_) | ExitReason::SpawnFailure(_)) {
                self.terminate(&mut child, kill_grace_secs).await;
            }
            on_exit(reason);
        }
        Ok(())
    }

    async fn poll_output(&self, offset: &mut u64, broker: &OutputBroker) -> ExecuteResult<bool> {
        let Ok(mut file) = File::open(&self.output_log).await else {
            return Ok(false);
        };
        let metadata = file.metadata().await?;
        if metadata.len() <= *offset {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(*offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        *offset += buf.len() as u64;
        if !buf.is_empty() {
            broker.publish(&self.task_id, &buf).await;
        }
        Ok(!buf.is_empty())
    }

    async fn poll_result(&self) -> Option<ResultStatus> {
        let bytes = tokio::fs::read(&self.result_path).await.ok()?;
        let doc: ResultDocument = serde_json::from_slice(&bytes).ok()?;
        Some(doc.status)
    }

    /// Public `kill()`: SIGTERM to the process group, then SIGKILL after
    /// `kill_grace_secs`.
    pub async fn kill(&self, kill_grace_secs: u64) {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(pid) = *self.pid.lock().await {
            signal_group(pid, Signal::SIGTERM);
            tokio::time::sleep(Duration::from_secs(kill_grace_secs)).await;
            signal_group(pid, Signal::SIGKILL);
        }
    }

    async fn terminate(&self, child: &mut Child, kill_grace_secs: u64) {
        if let Some(pid) = child.id() {
            signal_group(pid, Signal::SIGTERM);
            let deadline = Duration::from_secs(kill_grace_secs);
            if tokio::time::timeout(deadline, child.wait()).await.is_err() {
                warn!(pid, "agent did not exit after SIGTERM, escalating to SIGKILL");
                signal_group(pid, Signal::SIGKILL);
                let _ = child.wait().await;
            }
        }
    }
}

fn signal_group(pid: u32, sig: Signal) {
    let pgid = Pid::from_raw(-(pid as i32));
    if let Err(e) = signal::kill(pgid, sig) {
        info!(pid, signal = ?sig, error = %e, "signal delivery to process group failed (likely already exited)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, AgentKind};
    use std::sync::atomic::AtomicU32;

    fn process_alive(pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
    }

    async fn write_script(path: &Path, body: &str) {
        tokio::fs::write(path, format!("#!/bin/sh\n{body}\n")).await.unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms).await.unwrap();
    }

    /// A result written before the process self-terminates (`spec.md`
    /// §8 scenario 4): `supervise` must fire `on_exit` from the result
    /// poll, then escalate SIGTERM/SIGKILL to actually stop the still-
    /// running child, and must never invoke `on_exit` a second time for
    /// the natural exit that follows.
    #[tokio::test]
    async fn result_before_exit_terminates_process_and_notifies_once() {
        let tmp = tempfile::tempdir().unwrap();
        let active_dir = tmp.path().join("active").join("t1");
        let script = tmp.path().join("agent.sh");
        write_script(&script, "printf '{\"status\":\"success\"}' > \"$1\"/result.json\nsleep 30\n").await;

        let config = AgentConfig {
            kind: AgentKind::Custom,
            executable: script.display().to_string(),
            args: vec![active_dir.display().to_string()],
        };

        let agent = Arc::new(AgentProcess::new("t1", active_dir.clone()));
        let notify_count = Arc::new(AtomicU32::new(0));
        let notify_count_cb = notify_count.clone();

        agent
            .clone()
            .run(
                &config,
                tmp.path(),
                OutputBroker::new(),
                20,
                30,
                30,
                1,
                1200,
                move |reason| {
                    notify_count_cb.fetch_add(1, Ordering::SeqCst);
                    assert!(matches!(reason, ExitReason::Result(ResultStatus::Success)));
                },
            )
            .await
            .unwrap();

        assert_eq!(notify_count.load(Ordering::SeqCst), 1, "on_exit must fire exactly once");
        let pid = agent.pid().await.expect("pid recorded");
        assert!(!process_alive(pid), "the still-running script must be killed after the result arrives");
    }
}
