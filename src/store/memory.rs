//! In-memory [`Store`] implementation for tests and embedding.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`. Change sets are
//! applied in place and undone from a snapshot on failure, which makes
//! this a [`PartialUpdate`](CommitCapability::PartialUpdate) backend. Two
//! fault injectors exercise the failure paths of a commit.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::Record;

use super::{ApplyOptions, ChangeSet, CommitCapability, Store, StoreKind};

#[derive(Default)]
struct Faults {
    /// Removing this id fails the write part-way.
    fail_on_removal: Option<String>,
    /// Undoing a failed write fails too, leaving the partial write behind.
    fail_rollback: bool,
}

pub struct InMemoryStore {
    location: PathBuf,
    records: RwLock<Vec<Record>>,
    archive: RwLock<Vec<Record>>,
    faults: RwLock<Faults>,
}

impl InMemoryStore {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            location: PathBuf::from(":memory:"),
            records: RwLock::new(records),
            archive: RwLock::new(Vec::new()),
            faults: RwLock::new(Faults::default()),
        }
    }

    /// Make the removal of `id` fail during the next change sets.
    pub fn fail_on_removal(&self, id: impl Into<String>) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_removal = Some(id.into());
    }

    /// Make rollback after a failed write fail as well.
    pub fn fail_rollback(&self) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_rollback = true;
    }

    /// Records archived by committed change sets.
    pub fn archived(&self) -> Vec<Record> {
        self.archive
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> Vec<Record> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn apply_in_place(
    records: &mut Vec<Record>,
    changes: &ChangeSet,
    fail_on_removal: Option<&str>,
) -> Result<(), String> {
    for update in &changes.updates {
        let slot = records
            .iter_mut()
            .find(|r| r.id == update.id)
            .ok_or_else(|| format!("update target {} not found", update.id))?;
        *slot = update.clone();
    }
    for removal in &changes.removals {
        if fail_on_removal == Some(removal.id.as_str()) {
            return Err(format!("injected failure removing {}", removal.id));
        }
        let before = records.len();
        records.retain(|r| r.id != removal.id);
        if records.len() == before {
            return Err(format!("removal target {} not found", removal.id));
        }
    }
    Ok(())
}

#[async_trait]
impl Store for InMemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn capability(&self) -> CommitCapability {
        CommitCapability::PartialUpdate
    }

    fn location(&self) -> &Path {
        &self.location
    }

    async fn connect(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn disconnect(&mut self) {}

    async fn load_all(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.snapshot())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64)
    }

    async fn apply_change_set(
        &self,
        changes: &ChangeSet,
        options: &ApplyOptions,
    ) -> Result<(), StoreError> {
        let faults = self.faults.read().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = records.clone();

        if let Err(write) = apply_in_place(&mut records, changes, faults.fail_on_removal.as_deref())
        {
            if faults.fail_rollback {
                return Err(StoreError::RollbackFailed {
                    write,
                    rollback: "injected rollback failure".to_string(),
                });
            }
            *records = snapshot;
            return Err(StoreError::WriteFailed(write));
        }

        if options.archive_removals {
            self.archive
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(changes.removals.iter().cloned());
        }
        Ok(())
    }

    async fn perform_maintenance(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn integrity_check(&self) -> Result<(), StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(StoreError::Integrity(format!("duplicate id {}", pair[0])));
        }
        Ok(())
    }
}
