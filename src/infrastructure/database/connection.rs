use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::domain::errors::ExecuteResult;

use super::migrations::{all_embedded_migrations, Migrator};

/// Open (creating if absent) the SQLite database at `path`, apply pending
/// migrations, and hand back a connection pool. Pass the literal string
/// `:memory:` for an ephemeral in-memory database (used by tests).
pub async fn connect(path: impl AsRef<str>, max_connections: u32) -> ExecuteResult<SqlitePool> {
    let raw = path.as_ref();

    let options = if raw == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")
    } else {
        let p = Path::new(raw);
        if let Some(parent) = p.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        SqliteConnectOptions::from_str(&format!("sqlite://{raw}")).map(|o| o.create_if_missing(true))
    }
    .map_err(|e| crate::domain::errors::ExecuteError::StoreUnavailable(e.to_string()))?
    .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(pool.clone());
    let applied = migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    tracing::info!(applied, "database migrations applied");

    Ok(pool)
}
