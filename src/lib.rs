//! OpenSprint Execute core: a project-scoped orchestrator that turns
//! ready work items into committed, reviewed code (`SPEC_FULL.md` §1-2).
//!
//! The public surface is deliberately small: [`config`] loads
//! project-scoped settings, [`infrastructure`] provides the SQLite-backed
//! [`domain::ports::TaskStore`] implementation, and [`services::Orchestrator`]
//! is the single entry point the CLI (or any external caller) drives.

pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod infrastructure;
pub mod logging;
pub mod paths;
pub mod services;

pub use domain::errors::{ExecuteError, ExecuteResult};
pub use events::ExecuteEvent;
pub use services::Orchestrator;
