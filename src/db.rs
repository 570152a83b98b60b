use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open a pool on the SQLite file at `path`.
///
/// The pool holds a single connection: the adapter is the store's only
/// writer and every statement is serialized through it. Rollback journal
/// mode keeps the whole database in the main file, so a plain file copy
/// is a complete snapshot.
pub async fn connect(path: &Path, create: bool) -> Result<SqlitePool, sqlx::Error> {
    if create {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Delete);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}
