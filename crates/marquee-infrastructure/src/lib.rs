// SPDX-License-Identifier: GPL-3.0-or-later
pub mod memory;
pub mod repositories;
pub mod sqlite_adapters;

pub use memory::{InMemoryScheduledTaskRepository, InMemoryTaskRepository};
pub use repositories::{ScheduledTaskRepository, TaskFilter, TaskRepository};
pub use sqlite_adapters::{SqliteScheduledTaskRepository, SqliteTaskRepository};

use anyhow::Result;
use marquee_config::AppConfig;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// Turn a configured `sqlite://` URL into one SQLite can open and create.
///
/// Relative paths are resolved against the working directory and the parent
/// directory is created if missing. In-memory URLs pass through untouched.
fn normalize_sqlite_url(url: &str) -> Result<String> {
    if !url.starts_with("sqlite://") || url.starts_with("sqlite://:memory:") {
        return Ok(url.to_string());
    }

    let db_path = url.trim_start_matches("sqlite://");
    let path = Path::new(db_path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
            info!(target: "infrastructure", path = %parent.display(), "created database directory");
        }
    }

    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    // Forward slashes work for SQLite on every platform
    let path_str = absolute_path.to_string_lossy().replace('\\', "/");

    Ok(format!("sqlite://{}?mode=rwc", path_str))
}

/// Connect to the configured database and apply pending migrations.
pub async fn init_database(config: &AppConfig) -> Result<SqlitePool> {
    info!(target: "infrastructure", "initializing database");

    let db_url = normalize_sqlite_url(&config.database.url)?;
    info!(target: "infrastructure", db_url = %db_url, "connecting to database");

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.pool_max_size)
        .connect(&db_url)
        .await?;

    info!(target: "infrastructure", db_url = %config.database.url, "running migrations");
    sqlx::migrate!("../../migrations").run(&pool).await?;

    info!(target: "infrastructure", "database initialized successfully");
    Ok(pool)
}
