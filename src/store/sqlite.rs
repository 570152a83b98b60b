//! SQLite memory store.
//!
//! Reads whichever of the supported tables the file has (`memories`,
//! `memory` or `knowledge_graph`) and commits merges in a single
//! transaction: survivors are updated, removed rows are copied into
//! `memory_archive` and then deleted. Any failure rolls the whole
//! transaction back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::db;
use crate::error::StoreError;
use crate::migrate::CREATE_ARCHIVE_TABLE;
use crate::models::Record;
use crate::similarity::blob_to_vec;

use super::{
    metadata_from_json, timestamp_from_secs, timestamp_to_secs, ApplyOptions, ChangeSet,
    CommitCapability, Store, StoreKind,
};

/// Tables a memory store may keep its records in, in lookup order.
pub const SUPPORTED_TABLES: &[&str] = &["memories", "memory", "knowledge_graph"];

const REQUIRED_COLUMNS: &[&str] = &["id", "content", "embedding"];

pub struct SqliteStore {
    path: PathBuf,
    pool: Option<SqlitePool>,
    table: String,
    has_metadata: bool,
    has_timestamp: bool,
    has_hash: bool,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: None,
            table: String::new(),
            has_metadata: false,
            has_timestamp: false,
            has_hash: false,
        }
    }

    /// Construct and connect in one step.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self::new(path);
        store.connect().await?;
        Ok(store)
    }

    /// Name of the table records are read from. Empty until connected.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn pool(&self) -> Result<&SqlitePool, StoreError> {
        self.pool.as_ref().ok_or(StoreError::NotConnected)
    }

    async fn verify_schema(&mut self, pool: &SqlitePool) -> Result<(), StoreError> {
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(pool)
                .await?;

        // SQLite identifiers are case-insensitive, so `Memories` is a match.
        let table = SUPPORTED_TABLES
            .iter()
            .find_map(|candidate| {
                tables
                    .iter()
                    .find(|name| name.eq_ignore_ascii_case(candidate))
            })
            .cloned()
            .ok_or_else(|| {
                StoreError::IncompatibleSchema(format!(
                    "no memory table found (expected one of {}; found: {})",
                    SUPPORTED_TABLES.join(", "),
                    if tables.is_empty() {
                        "none".to_string()
                    } else {
                        tables.join(", ")
                    }
                ))
            })?;

        let columns: Vec<String> = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        for required in REQUIRED_COLUMNS {
            if !columns.iter().any(|c| c.eq_ignore_ascii_case(required)) {
                return Err(StoreError::MissingColumn(format!("{}.{}", table, required)));
            }
        }

        let has = |wanted: &str| columns.iter().any(|c| c.eq_ignore_ascii_case(wanted));
        self.has_metadata = has("metadata");
        self.has_timestamp = has("timestamp");
        self.has_hash = has("content_hash");
        self.table = table;
        Ok(())
    }

    fn select_sql(&self) -> String {
        let optional = |present: bool, expr: &str, alias: &str| {
            if present {
                format!("{} AS {}", expr, alias)
            } else {
                format!("NULL AS {}", alias)
            }
        };
        format!(
            "SELECT CAST(id AS TEXT) AS id, CAST(content AS TEXT) AS content, \
             CAST(embedding AS BLOB) AS embedding, {}, {}, {} FROM {}{}",
            optional(self.has_metadata, "CAST(metadata AS TEXT)", "metadata"),
            optional(self.has_timestamp, "CAST(timestamp AS REAL)", "timestamp"),
            optional(self.has_hash, "CAST(content_hash AS TEXT)", "content_hash"),
            self.table,
            if self.has_timestamp {
                " ORDER BY timestamp DESC"
            } else {
                ""
            }
        )
    }

    async fn write_changes(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        changes: &ChangeSet,
        options: &ApplyOptions,
    ) -> Result<(), StoreError> {
        let update_sql = if self.has_metadata {
            format!("UPDATE {} SET content = ?, metadata = ? WHERE id = ?", self.table)
        } else {
            format!("UPDATE {} SET content = ? WHERE id = ?", self.table)
        };

        for record in &changes.updates {
            let mut query = sqlx::query(&update_sql).bind(&record.content);
            if self.has_metadata {
                query = query.bind(serde_json::to_string(&record.metadata)?);
            }
            let result = query.bind(&record.id).execute(&mut **tx).await?;
            if result.rows_affected() != 1 {
                return Err(StoreError::WriteFailed(format!(
                    "update of record {} matched {} rows",
                    record.id,
                    result.rows_affected()
                )));
            }
        }

        if changes.removals.is_empty() {
            return Ok(());
        }

        if options.archive_removals {
            sqlx::query(CREATE_ARCHIVE_TABLE).execute(&mut **tx).await?;
            let archived_at = timestamp_to_secs(&options.archived_at);
            for record in &changes.removals {
                sqlx::query(
                    "INSERT INTO memory_archive \
                     (original_id, content, embedding, metadata, timestamp, archived_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&record.id)
                .bind(&record.content)
                .bind(serde_json::to_vec(&record.embedding)?)
                .bind(serde_json::to_string(&record.metadata)?)
                .bind(timestamp_to_secs(&record.timestamp))
                .bind(archived_at)
                .execute(&mut **tx)
                .await?;
            }
        }

        let delete_sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        for record in &changes.removals {
            sqlx::query(&delete_sql)
                .bind(&record.id)
                .execute(&mut **tx)
                .await?;
        }

        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record, StoreError> {
    let id: String = row.try_get::<Option<String>, _>("id")?.unwrap_or_default();
    let content: String = row
        .try_get::<Option<String>, _>("content")?
        .unwrap_or_default();
    let embedding = row
        .try_get::<Option<Vec<u8>>, _>("embedding")?
        .map(|bytes| parse_embedding(&bytes))
        .unwrap_or_default();
    let metadata = row
        .try_get::<Option<String>, _>("metadata")?
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .map(metadata_from_json)
        .unwrap_or_default();
    let timestamp = timestamp_from_secs(row.try_get::<Option<f64>, _>("timestamp")?.unwrap_or(0.0));
    let content_hash = row
        .try_get::<Option<String>, _>("content_hash")?
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| id.clone());

    Ok(Record {
        id,
        content,
        embedding,
        metadata,
        timestamp,
        content_hash,
    })
}

/// Embeddings are stored either as JSON array text or as packed
/// little-endian `f32`s. Unreadable values decode to an empty vector.
fn parse_embedding(bytes: &[u8]) -> Vec<f32> {
    if let Ok(values) = serde_json::from_slice::<Vec<f32>>(bytes) {
        return values;
    }
    if bytes.len() % 4 == 0 {
        blob_to_vec(bytes)
    } else {
        Vec::new()
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }

    fn capability(&self) -> CommitCapability {
        CommitCapability::PartialUpdate
    }

    fn location(&self) -> &Path {
        &self.path
    }

    async fn connect(&mut self) -> Result<(), StoreError> {
        if self.pool.is_some() {
            return Ok(());
        }
        if !self.path.is_file() {
            return Err(StoreError::Connection {
                path: self.path.clone(),
                message: "no database file at this path".to_string(),
            });
        }

        let pool = db::connect(&self.path, false)
            .await
            .map_err(|e| StoreError::Connection {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        if let Err(e) = self.verify_schema(&pool).await {
            pool.close().await;
            return Err(e);
        }

        debug!(path = %self.path.display(), table = %self.table, "sqlite store connected");
        self.pool = Some(pool);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }

    async fn load_all(&self) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(&self.select_sql())
            .fetch_all(self.pool()?)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(self.pool()?)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn apply_change_set(
        &self,
        changes: &ChangeSet,
        options: &ApplyOptions,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool()?.begin().await?;

        match self.write_changes(&mut tx, changes, options).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| StoreError::WriteFailed(format!("commit failed: {}", e)))?;
                info!(
                    updated = changes.updates.len(),
                    removed = changes.removals.len(),
                    "sqlite change set committed"
                );
                Ok(())
            }
            Err(write) => match tx.rollback().await {
                Ok(()) => Err(StoreError::WriteFailed(write.to_string())),
                Err(rollback) => Err(StoreError::RollbackFailed {
                    write: write.to_string(),
                    rollback: rollback.to_string(),
                }),
            },
        }
    }

    async fn perform_maintenance(&self) -> Result<(), StoreError> {
        let pool = self.pool()?;
        sqlx::query("REINDEX").execute(pool).await?;
        sqlx::query("VACUUM").execute(pool).await?;
        Ok(())
    }

    async fn integrity_check(&self) -> Result<(), StoreError> {
        let results: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_all(self.pool()?)
            .await?;
        if results.len() == 1 && results[0] == "ok" {
            Ok(())
        } else {
            Err(StoreError::Integrity(results.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::similarity::vec_to_blob;
    use tempfile::TempDir;

    async fn seeded(tmp: &TempDir) -> SqliteStore {
        let path = tmp.path().join("memory.db");
        migrate::run_migrations(&path).await.unwrap();
        let pool = db::connect(&path, false).await.unwrap();
        for (id, content, ts) in [
            ("m1", "User prefers Python", 100.0),
            ("m2", "Python for data", 200.0),
            ("m3", "Swift for iOS", 300.0),
        ] {
            sqlx::query(
                "INSERT INTO memories (id, content, embedding, metadata, timestamp, content_hash) \
                 VALUES (?, ?, '[1.0, 0.0]', '{\"category\":\"lang\",\"weight\":2}', ?, NULL)",
            )
            .bind(id)
            .bind(content)
            .bind(ts)
            .execute(&pool)
            .await
            .unwrap();
        }
        pool.close().await;
        SqliteStore::open(&path).await.unwrap()
    }

    #[tokio::test]
    async fn loads_newest_first_with_parsed_fields() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let records = store.load_all().await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m2", "m1"]);
        assert_eq!(records[0].embedding, vec![1.0, 0.0]);
        assert_eq!(records[0].metadata["weight"], "2");
        // Missing hash falls back to the id.
        assert_eq!(records[0].content_hash, "m3");
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn blob_embeddings_decode() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        sqlx::query("UPDATE memories SET embedding = ? WHERE id = 'm1'")
            .bind(vec_to_blob(&[0.25, -1.5, 2.0]))
            .execute(store.pool().unwrap())
            .await
            .unwrap();
        let records = store.load_all().await.unwrap();
        let m1 = records.iter().find(|r| r.id == "m1").unwrap();
        assert_eq!(m1.embedding, vec![0.25, -1.5, 2.0]);
    }

    #[tokio::test]
    async fn missing_file_is_connection_error() {
        let tmp = TempDir::new().unwrap();
        let err = SqliteStore::open(tmp.path().join("absent.db"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Connection { .. }));
    }

    #[tokio::test]
    async fn foreign_schema_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("other.db");
        let pool = db::connect(&path, true).await.unwrap();
        sqlx::query("CREATE TABLE notes (id TEXT, body TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
        let err = SqliteStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StoreError::IncompatibleSchema(_)));

        let path = tmp.path().join("partial.db");
        let pool = db::connect(&path, true).await.unwrap();
        sqlx::query("CREATE TABLE memory (id TEXT, content TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
        let err = SqliteStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StoreError::MissingColumn(ref c) if c == "memory.embedding"));
    }

    #[tokio::test]
    async fn table_name_matches_case_insensitively() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mixed.db");
        let pool = db::connect(&path, true).await.unwrap();
        sqlx::query("CREATE TABLE Memories (ID TEXT PRIMARY KEY, Content TEXT, Embedding TEXT, Timestamp REAL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO Memories VALUES ('a', 'Lives in Geneva', '[0.0, 1.0]', 10.0)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.table(), "Memories");
        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "Lives in Geneva");
        assert_eq!(records[0].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn change_set_updates_archives_and_deletes() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let records = store.load_all().await.unwrap();
        let mut survivor = records.iter().find(|r| r.id == "m1").unwrap().clone();
        survivor.content = "User prefers Python for data".into();
        let removed = records.iter().find(|r| r.id == "m2").unwrap().clone();

        let changes = ChangeSet {
            records: Vec::new(),
            updates: vec![survivor],
            removals: vec![removed],
        };
        store
            .apply_change_set(&changes, &ApplyOptions::default())
            .await
            .unwrap();

        let after = store.load_all().await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(
            after.iter().find(|r| r.id == "m1").unwrap().content,
            "User prefers Python for data"
        );
        let archived: Vec<String> = sqlx::query_scalar("SELECT original_id FROM memory_archive")
            .fetch_all(store.pool().unwrap())
            .await
            .unwrap();
        assert_eq!(archived, vec!["m2".to_string()]);
        store.integrity_check().await.unwrap();
        store.perform_maintenance().await.unwrap();
    }

    #[tokio::test]
    async fn failed_delete_rolls_back_everything() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        sqlx::query(
            "CREATE TRIGGER block_m3 BEFORE DELETE ON memories WHEN OLD.id = 'm3' \
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .execute(store.pool().unwrap())
        .await
        .unwrap();

        let before = store.load_all().await.unwrap();
        let mut survivor = before.iter().find(|r| r.id == "m1").unwrap().clone();
        survivor.content = "merged".into();
        let changes = ChangeSet {
            records: Vec::new(),
            updates: vec![survivor],
            removals: before.iter().filter(|r| r.id != "m1").cloned().collect(),
        };

        let err = store
            .apply_change_set(&changes, &ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed(_)), "{err}");
        assert_eq!(store.load_all().await.unwrap(), before);
        let archived: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_archive")
            .fetch_one(store.pool().unwrap())
            .await
            .unwrap();
        assert_eq!(archived, 0);
    }
}
