//! Database setup and schema initialization.

use std::path::Path;

use anyhow::Result;
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions};

/// Opens (creating if necessary) a `SQLite` database at `db_path` and
/// ensures the `download_records` schema exists.
pub async fn setup_database(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true),
    )
    .await?;

    create_download_schema(&pool).await?;

    Ok(pool)
}

/// Opens an in-memory `SQLite` database with the schema already applied,
/// for tests.
pub async fn setup_test_database() -> Result<SqlitePool> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    create_download_schema(&pool).await?;
    Ok(pool)
}

pub(crate) async fn create_download_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS download_records (
            id TEXT PRIMARY KEY NOT NULL,
            kind TEXT NOT NULL,
            uri TEXT NOT NULL,
            cache_key TEXT,
            stream_keys TEXT NOT NULL DEFAULT '[]',
            custom_metadata TEXT NOT NULL DEFAULT '',
            state TEXT NOT NULL DEFAULT 'queued',
            failure_reason TEXT NOT NULL DEFAULT 'none',
            not_met_requirements INTEGER NOT NULL DEFAULT 0,
            manual_stop_reason INTEGER NOT NULL DEFAULT 0,
            start_time_ms INTEGER NOT NULL,
            update_time_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_download_records_state ON download_records(state)")
        .execute(pool)
        .await?;

    Ok(())
}
