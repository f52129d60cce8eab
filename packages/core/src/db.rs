//! SQLite pool construction.
//!
//! [`create_pool`] opens (or creates) the database and applies the
//! embedded migrations under `migrations/`, so every caller gets a
//! ready-to-use schema.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open a pool for `database_url` and run all pending migrations.
///
/// In-memory URLs are pinned to a single connection: every SQLite
/// connection to `:memory:` would otherwise see its own empty database.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|err| sqlx::Error::Migrate(Box::new(err)))?;

    tracing::debug!("Database ready at {}", database_url);
    Ok(pool)
}
