use clap::Parser;
use opensprint_execute::cli::{Cli, Commands, ExecuteCommands, TaskCommands};

#[test]
fn parse_execute_start() {
    let cli = Cli::try_parse_from(["opensprint", "execute", "start", "proj1"]).unwrap();
    match cli.command {
        Commands::Execute(ExecuteCommands::Start { project, watch }) => {
            assert_eq!(project, "proj1");
            assert!(!watch);
        }
        _ => panic!("wrong command"),
    }
}

#[test]
fn parse_execute_start_with_watch() {
    let cli = Cli::try_parse_from(["opensprint", "execute", "start", "proj1", "--watch"]).unwrap();
    match cli.command {
        Commands::Execute(ExecuteCommands::Start { watch, .. }) => assert!(watch),
        _ => panic!("wrong command"),
    }
}

#[test]
fn parse_execute_status() {
    let cli = Cli::try_parse_from(["opensprint", "execute", "status", "proj1"]).unwrap();
    match cli.command {
        Commands::Execute(ExecuteCommands::Status { project }) => assert_eq!(project, "proj1"),
        _ => panic!("wrong command"),
    }
}

#[test]
fn parse_task_submit_defaults() {
    let cli = Cli::try_parse_from(["opensprint", "task", "submit", "proj1", "1.1", "Do the thing"]).unwrap();
    match cli.command {
        Commands::Task(TaskCommands::Submit { project, id, title, description, priority, issue_type }) => {
            assert_eq!(project, "proj1");
            assert_eq!(id, "1.1");
            assert_eq!(title, "Do the thing");
            assert_eq!(description, "");
            assert_eq!(priority, 2);
            assert_eq!(issue_type, "task");
        }
        _ => panic!("wrong command"),
    }
}

#[test]
fn parse_task_submit_with_flags() {
    let cli = Cli::try_parse_from([
        "opensprint", "task", "submit", "proj1", "1.2", "Fix the bug",
        "--description", "stack trace attached",
        "--priority", "0",
        "--issue-type", "bug",
    ])
    .unwrap();
    match cli.command {
        Commands::Task(TaskCommands::Submit { description, priority, issue_type, .. }) => {
            assert_eq!(description, "stack trace attached");
            assert_eq!(priority, 0);
            assert_eq!(issue_type, "bug");
        }
        _ => panic!("wrong command"),
    }
}

#[test]
fn parse_global_json_flag() {
    let cli = Cli::try_parse_from(["opensprint", "--json", "task", "list", "proj1"]).unwrap();
    assert!(cli.json);
}

#[test]
fn missing_project_argument_errors() {
    let result = Cli::try_parse_from(["opensprint", "execute", "start"]);
    assert!(result.is_err());
}

#[test]
fn unknown_subcommand_errors() {
    let result = Cli::try_parse_from(["opensprint", "frobnicate"]);
    assert!(result.is_err());
}
