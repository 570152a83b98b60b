use sqlx::SqlitePool;
use std::path::Path;

use crate::db;
use crate::error::StoreError;

/// Archive of records removed by a merge commit. Removed rows are copied
/// here inside the commit transaction before they are deleted.
pub(crate) const CREATE_ARCHIVE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS memory_archive (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        original_id TEXT NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB,
        metadata TEXT,
        timestamp REAL,
        archived_at REAL NOT NULL
    )
"#;

/// Create an empty memory store at `path` (used by `memdefrag init`).
/// Idempotent: existing tables and rows are left alone.
pub async fn run_migrations(path: &Path) -> Result<(), StoreError> {
    let pool = db::connect(path, true).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn create_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            embedding TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            timestamp REAL NOT NULL,
            content_hash TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memories_timestamp ON memories(timestamp)")
        .execute(pool)
        .await?;

    sqlx::query(CREATE_ARCHIVE_TABLE).execute(pool).await?;

    Ok(())
}
