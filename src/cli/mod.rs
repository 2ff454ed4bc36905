//! CLI front door (`SPEC_FULL.md` §6): `opensprint execute ...` drives the
//! `Orchestrator`; `opensprint task ...` operates directly on the
//! `TaskStore` for local testing without a running orchestrator.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "opensprint")]
#[command(about = "OpenSprint Execute core: admits work, runs agents, merges code", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output machine-readable JSON instead of a table.
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Root directory containing one subdirectory per project (each a
    /// git repository). Defaults to the current directory's parent.
    #[arg(long, global = true, default_value = ".")]
    pub projects_root: std::path::PathBuf,

    /// Path to the shared SQLite task store.
    #[arg(long, global = true, default_value = ".opensprint/execute.db")]
    pub database: std::path::PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Orchestrator lifecycle for one project.
    #[command(subcommand)]
    Execute(ExecuteCommands),

    /// Task-store inspection and authoring, independent of the
    /// orchestrator.
    #[command(subcommand)]
    Task(TaskCommands),
}

#[derive(Subcommand)]
pub enum ExecuteCommands {
    /// Admit `<project>` into the orchestrator (idempotent).
    Start {
        project: String,
        /// Stream `agent.output`/`execute.status` events to stdout as
        /// newline-delimited JSON until interrupted.
        #[arg(long)]
        watch: bool,
    },
    /// Stop accepting new work for `<project>`; running slots drain.
    Stop { project: String },
    /// Print the current `StatusSnapshot` for `<project>`.
    Status { project: String },
    /// Print the current `OutputLog` content for one task.
    Output { project: String, task_id: String },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task directly in the store.
    Submit {
        project: String,
        id: String,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 2)]
        priority: u8,
        #[arg(long, default_value = "task")]
        issue_type: String,
    },
    /// List every task for a project.
    List { project: String },
    /// Show one task.
    Show { project: String, id: String },
}
