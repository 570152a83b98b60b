//! Store adapter boundary.
//!
//! The [`Store`] trait is the only way the rest of the crate reads or
//! writes records. Backends differ in how much of a write they can undo,
//! and say so through [`CommitCapability`] rather than through their
//! identity:
//!
//! | Backend | Module | Capability |
//! |---------|--------|------------|
//! | SQLite file | [`sqlite`] | [`PartialUpdate`](CommitCapability::PartialUpdate) |
//! | Collection directory | [`collection`] | [`ReplaceOnly`](CommitCapability::ReplaceOnly) |
//! | In-memory | [`memory`] | [`PartialUpdate`](CommitCapability::PartialUpdate) |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod collection;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bridge::ProcessBridge;
use crate::config::BridgeConfig;
use crate::error::StoreError;
use crate::models::Record;

use collection::{CollectionStore, JsonFileBridge, COLLECTION_FILE};
use sqlite::SqliteStore;

/// Marker files that identify a ChromaDB persistence directory.
pub const CHROMA_MARKERS: &[&str] = &[
    "chroma.sqlite3",
    "chroma-collections.parquet",
    "chroma-embeddings.parquet",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite,
    Collection,
    /// Process-local store; never detected from a path.
    Memory,
}

impl StoreKind {
    /// Classify the store at `path`. Directories holding a collection
    /// marker are collections; everything else is treated as SQLite.
    pub fn detect(path: &Path) -> StoreKind {
        if path.is_dir()
            && CHROMA_MARKERS
                .iter()
                .chain(std::iter::once(&COLLECTION_FILE))
                .any(|marker| path.join(marker).exists())
        {
            StoreKind::Collection
        } else {
            StoreKind::Sqlite
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreKind::Sqlite => "sqlite",
            StoreKind::Collection => "collection",
            StoreKind::Memory => "memory",
        })
    }
}

/// How a backend can apply a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitCapability {
    /// Updates and deletes apply in one transaction the backend can roll back.
    PartialUpdate,
    /// The whole collection is replaced; undo means restoring a backup.
    ReplaceOnly,
}

/// Everything a commit changes, in both shapes a backend may want.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// The complete post-commit collection, in load order.
    pub records: Vec<Record>,
    /// Survivors carrying merged content and metadata.
    pub updates: Vec<Record>,
    /// Records deleted by the commit.
    pub removals: Vec<Record>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.removals.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Copy removed records into the backend's archive before deleting,
    /// where the backend has one.
    pub archive_removals: bool,
    pub archived_at: DateTime<Utc>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            archive_removals: true,
            archived_at: Utc::now(),
        }
    }
}

/// Abstract memory store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`connect`](Store::connect) | Open the backend and verify it is usable |
/// | [`load_all`](Store::load_all) | Read every record |
/// | [`count`](Store::count) | Number of records |
/// | [`apply_change_set`](Store::apply_change_set) | Commit a merge, all or nothing where the capability allows |
/// | [`perform_maintenance`](Store::perform_maintenance) | Reclaim space after a commit |
/// | [`integrity_check`](Store::integrity_check) | Backend consistency check |
#[async_trait]
pub trait Store: Send + Sync {
    fn kind(&self) -> StoreKind;

    fn capability(&self) -> CommitCapability;

    /// Filesystem location backups are taken from.
    fn location(&self) -> &Path;

    async fn connect(&mut self) -> Result<(), StoreError>;

    async fn disconnect(&mut self);

    async fn load_all(&self) -> Result<Vec<Record>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Apply `changes`. A [`PartialUpdate`](CommitCapability::PartialUpdate)
    /// backend either applies everything or returns
    /// [`StoreError::WriteFailed`] with nothing applied; if it cannot undo
    /// a partial write it returns [`StoreError::RollbackFailed`].
    async fn apply_change_set(
        &self,
        changes: &ChangeSet,
        options: &ApplyOptions,
    ) -> Result<(), StoreError>;

    async fn perform_maintenance(&self) -> Result<(), StoreError>;

    async fn integrity_check(&self) -> Result<(), StoreError>;
}

/// Build the right adapter for `path` and connect it.
pub async fn open_store(path: &Path, bridge: &BridgeConfig) -> Result<Box<dyn Store>, StoreError> {
    let mut store: Box<dyn Store> = if StoreKind::detect(path) != StoreKind::Collection {
        Box::new(SqliteStore::new(path))
    } else if path.join(COLLECTION_FILE).exists() {
        Box::new(CollectionStore::new(path, Box::new(JsonFileBridge)))
    } else {
        let command = bridge.command.clone().ok_or_else(|| StoreError::Connection {
            path: path.to_path_buf(),
            message: "collection store needs a [bridge] command to read it".to_string(),
        })?;
        Box::new(CollectionStore::new(
            path,
            Box::new(ProcessBridge::new(command, bridge.timeout())),
        ))
    };
    store.connect().await?;
    Ok(store)
}

/// Counts the records held at a path. Backup uses it to record how many
/// records a snapshot holds, and restore to verify the swapped-in store.
#[async_trait]
pub trait RecordCounter: Send + Sync {
    async fn count_records(&self, path: &Path) -> Result<u64, StoreError>;
}

/// [`RecordCounter`] that opens the path as a store, counts and disconnects.
pub struct StoreOpener {
    bridge: BridgeConfig,
}

impl StoreOpener {
    pub fn new(bridge: BridgeConfig) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl RecordCounter for StoreOpener {
    async fn count_records(&self, path: &Path) -> Result<u64, StoreError> {
        let mut store = open_store(path, &self.bridge).await?;
        let count = store.count().await;
        store.disconnect().await;
        count
    }
}

/// Flatten a JSON metadata object into string pairs. Non-string values
/// keep their JSON text; anything that is not an object yields no pairs.
pub(crate) fn metadata_from_json(value: serde_json::Value) -> BTreeMap<String, String> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Unix seconds (fractional) to a UTC timestamp. Out-of-range values
/// collapse to the epoch.
pub(crate) fn timestamp_from_secs(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() {
        return DateTime::<Utc>::UNIX_EPOCH;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn timestamp_to_secs(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) / 1e9
}
