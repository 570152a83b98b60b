//! Replace-only collection store.
//!
//! A collection lives in a directory and is only ever read or written
//! whole, through a [`CollectionBridge`]. There is no transaction to roll
//! back, so a failed replace is undone by restoring a backup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::bridge::{decode_records, encode_records};
use crate::error::StoreError;
use crate::models::Record;

use super::{ApplyOptions, ChangeSet, CommitCapability, Store, StoreKind};

/// File holding a plain JSON collection.
pub const COLLECTION_FILE: &str = "collection.json";

/// Whole-collection read and replace.
#[async_trait]
pub trait CollectionBridge: Send + Sync {
    fn name(&self) -> &'static str;

    async fn export(&self, dir: &Path) -> Result<Vec<Record>, StoreError>;

    /// Replace the collection in `dir` with exactly `records`.
    async fn import(&self, dir: &Path, records: &[Record]) -> Result<(), StoreError>;
}

/// Collection kept as a JSON array in [`COLLECTION_FILE`], replaced by
/// writing a temp file and renaming it over the original.
pub struct JsonFileBridge;

#[async_trait]
impl CollectionBridge for JsonFileBridge {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn export(&self, dir: &Path) -> Result<Vec<Record>, StoreError> {
        let bytes = tokio::fs::read(dir.join(COLLECTION_FILE)).await?;
        let entries: Vec<serde_json::Value> = serde_json::from_slice(&bytes)?;
        Ok(decode_records(entries))
    }

    async fn import(&self, dir: &Path, records: &[Record]) -> Result<(), StoreError> {
        let target = dir.join(COLLECTION_FILE);
        let tmp = dir.join(format!("{}.tmp", COLLECTION_FILE));
        let json = serde_json::to_vec_pretty(&encode_records(records))?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}

pub struct CollectionStore {
    dir: PathBuf,
    bridge: Box<dyn CollectionBridge>,
    connected: bool,
}

impl CollectionStore {
    pub fn new(dir: impl Into<PathBuf>, bridge: Box<dyn CollectionBridge>) -> Self {
        Self {
            dir: dir.into(),
            bridge,
            connected: false,
        }
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }
}

#[async_trait]
impl Store for CollectionStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Collection
    }

    fn capability(&self) -> CommitCapability {
        CommitCapability::ReplaceOnly
    }

    fn location(&self) -> &Path {
        &self.dir
    }

    async fn connect(&mut self) -> Result<(), StoreError> {
        if !self.dir.is_dir() {
            return Err(StoreError::Connection {
                path: self.dir.clone(),
                message: "collection directory does not exist".to_string(),
            });
        }
        debug!(path = %self.dir.display(), bridge = self.bridge.name(), "collection store connected");
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn load_all(&self) -> Result<Vec<Record>, StoreError> {
        self.ensure_connected()?;
        self.bridge.export(&self.dir).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.load_all().await?.len() as u64)
    }

    async fn apply_change_set(
        &self,
        changes: &ChangeSet,
        _options: &ApplyOptions,
    ) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.bridge.import(&self.dir, &changes.records).await
    }

    async fn perform_maintenance(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn integrity_check(&self) -> Result<(), StoreError> {
        let records = self
            .load_all()
            .await
            .map_err(|e| StoreError::Integrity(format!("collection is unreadable: {}", e)))?;
        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(record.id.as_str()) {
                return Err(StoreError::Integrity(format!("duplicate id {}", record.id)));
            }
        }
        Ok(())
    }
}
