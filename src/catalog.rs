//! Persistent catalog of backups.
//!
//! `backups.json` inside the backup directory holds a pretty-printed JSON
//! array of [`BackupRecord`]s in creation order. Every mutation rewrites
//! the whole file through a temp file and a rename, so a crash mid-write
//! leaves the previous catalog intact.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;
use crate::models::BackupRecord;

pub const CATALOG_FILE: &str = "backups.json";

#[derive(Debug, Clone)]
pub struct BackupCatalog {
    path: PathBuf,
}

impl BackupCatalog {
    pub fn new(backup_dir: &Path) -> Self {
        Self {
            path: backup_dir.join(CATALOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every cataloged entry, including ones whose file has gone missing.
    /// A missing catalog is an empty one.
    pub fn load(&self) -> Result<Vec<BackupRecord>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, records: &[BackupRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn append(&self, record: BackupRecord) -> Result<()> {
        let mut records = self.load()?;
        records.push(record);
        self.save(&records)
    }

    pub fn find(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    /// Drop the entry for `id`. Returns the removed entry, if any.
    pub fn remove(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        let mut records = self.load()?;
        let Some(pos) = records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        let removed = records.remove(pos);
        self.save(&records)?;
        Ok(Some(removed))
    }
}
