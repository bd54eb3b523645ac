//! SQLite pool creation and migrations.
//!
//! File databases run in WAL mode so readers never wait on the writer.
//! In-memory databases live inside a single connection, which is kept open
//! for the lifetime of the pool.

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;

/// Embedded migrations from `client/migrations`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open a pool and bring the schema up to date.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let in_memory = database_url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
    }

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?
    };
    debug!(in_memory, "local store pool opened");

    MIGRATOR.run(&pool).await?;
    info!(database_url, "local store ready");

    Ok(pool)
}
