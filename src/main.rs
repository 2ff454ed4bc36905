//! OpenSprint CLI entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use opensprint_execute::cli::commands::{execute, task};
use opensprint_execute::cli::{Cli, Commands, ExecuteCommands, TaskCommands};
use opensprint_execute::config::ConfigLoader;
use opensprint_execute::domain::ports::TaskStore;
use opensprint_execute::infrastructure::database::{self, SqliteTaskStore};
use opensprint_execute::{logging, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = ConfigLoader::load(&cli.projects_root).context("failed to load configuration")?;
    let _logger_guard = logging::init(&settings.logging).context("failed to initialize logging")?;

    let database_path = cli
        .database
        .to_str()
        .context("database path must be valid UTF-8")?
        .to_string();
    let pool = database::connect(&database_path, settings.database.max_connections)
        .await
        .context("failed to connect to the task database")?;
    let sqlite_store = SqliteTaskStore::new(pool);
    let task_store: Arc<dyn TaskStore> = Arc::new(sqlite_store.clone());

    let worktree_root = cli.projects_root.join(".opensprint/worktrees");
    let orchestrator = Orchestrator::new(cli.projects_root.clone(), worktree_root, task_store);

    match cli.command {
        Commands::Execute(execute_cmd) => match execute_cmd {
            ExecuteCommands::Start { project, watch } => {
                execute::handle_start(&orchestrator, &project, watch, cli.json).await?;
            }
            ExecuteCommands::Stop { project } => {
                execute::handle_stop(&orchestrator, &project).await?;
            }
            ExecuteCommands::Status { project } => {
                execute::handle_status(&orchestrator, &project, cli.json).await?;
            }
            ExecuteCommands::Output { project, task_id } => {
                execute::handle_output(&orchestrator, &project, &task_id).await?;
            }
        },
        Commands::Task(task_cmd) => match task_cmd {
            TaskCommands::Submit { project, id, title, description, priority, issue_type } => {
                task::handle_submit(&sqlite_store, &project, &id, &title, &description, priority, &issue_type, cli.json)
                    .await?;
            }
            TaskCommands::List { project } => {
                task::handle_list(&sqlite_store, &project, cli.json).await?;
            }
            TaskCommands::Show { project, id } => {
                task::handle_show(&sqlite_store, &project, &id, cli.json).await?;
            }
        },
    }

    Ok(())
}
