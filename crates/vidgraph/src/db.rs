//! SQLite connection management.
//!
//! One pool serves both the graph tables and the job table. WAL mode lets
//! readers (graph queries, status lookups) proceed while a pipeline holds the
//! write lock; `busy_timeout` makes a second writer wait for the lock before
//! SQLite reports `SQLITE_BUSY`, which the stores surface as a transaction
//! conflict.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Lock wait before a write reports `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a connection pool to the configured SQLite database.
///
/// Creates the database file and its parent directories if missing,
/// enables WAL and foreign keys, and caps the pool at
/// `db.max_connections`.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}
