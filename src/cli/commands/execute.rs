//! `opensprint execute ...` — drives the `Orchestrator` (`SPEC_FULL.md` §6).

use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, ContentArrangement, Table};
use serde::Serialize;

use crate::cli::output::{print, CommandOutput};
use crate::services::{Orchestrator, StatusSnapshot};

#[derive(Serialize)]
struct StatusView {
    project: String,
    active_tasks: Vec<ActiveTaskView>,
    queue_depth: u32,
    total_done: u64,
    total_failed: u64,
}

#[derive(Serialize)]
struct ActiveTaskView {
    task_id: String,
    title: String,
    phase: String,
    attempt: u32,
}

impl From<(&str, StatusSnapshot)> for StatusView {
    fn from((project, snapshot): (&str, StatusSnapshot)) -> Self {
        Self {
            project: project.to_string(),
            active_tasks: snapshot
                .active_tasks
                .into_iter()
                .map(|t| ActiveTaskView {
                    task_id: t.task_id,
                    title: t.title,
                    phase: t.phase,
                    attempt: t.attempt,
                })
                .collect(),
            queue_depth: snapshot.queue_depth,
            total_done: snapshot.total_done,
            total_failed: snapshot.total_failed,
        }
    }
}

impl CommandOutput for StatusView {
    fn to_human(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(presets::NOTHING)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("TASK"),
                Cell::new("TITLE"),
                Cell::new("PHASE"),
                Cell::new("ATTEMPT"),
            ]);
        for task in &self.active_tasks {
            table.add_row(vec![
                task.task_id.clone(),
                task.title.clone(),
                task.phase.clone(),
                task.attempt.to_string(),
            ]);
        }
        format!(
            "project {} — queue_depth={} total_done={} total_failed={}\n{}",
            self.project, self.queue_depth, self.total_done, self.total_failed, table
        )
    }
}

pub async fn handle_start(orchestrator: &Arc<Orchestrator>, project: &str, watch: bool, json: bool) -> Result<()> {
    let snapshot = orchestrator
        .ensure_running(project)
        .await
        .with_context(|| format!("failed to start project {project}"))?;
    print(&StatusView::from((project, snapshot)), json);

    if watch {
        let Some(mut events) = orchestrator.subscribe_events(project).await else {
            return Ok(());
        };
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => println!("{}", serde_json::to_string(&event).unwrap_or_default()),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            eprintln!("[dropped {n} events, subscriber lagged]");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }
    Ok(())
}

pub async fn handle_stop(orchestrator: &Arc<Orchestrator>, project: &str) -> Result<()> {
    orchestrator
        .stop_project(project)
        .await
        .with_context(|| format!("failed to stop project {project}"))?;
    println!("stopping {project}; draining active slots");
    Ok(())
}

pub async fn handle_status(orchestrator: &Arc<Orchestrator>, project: &str, json: bool) -> Result<()> {
    let snapshot = orchestrator
        .get_status(project)
        .await
        .with_context(|| format!("project {project} is not running"))?;
    print(&StatusView::from((project, snapshot)), json);
    Ok(())
}

pub async fn handle_output(orchestrator: &Arc<Orchestrator>, project: &str, task_id: &str) -> Result<()> {
    let content = orchestrator.get_live_output(project, task_id).await;
    print!("{content}");
    Ok(())
}
