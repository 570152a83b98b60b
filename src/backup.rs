//! Backups, restores and integrity checks for memory stores.
//!
//! # Layout
//!
//! ```text
//! <backup dir>/
//!   backups.json                                  catalog
//!   memory_backup_20250611T080000.123Z_1a2b3c4d.db.gz   SQLite file store
//!   memory_backup_20250611T090000.456Z_5e6f7a8b.zip     directory store
//! ```
//!
//! A backup is a verbatim copy of the store, compressed with gzip (single
//! file) or zip/deflate (directory). The SHA-256 in the catalog covers the
//! compressed bytes on disk, so [`BackupManager::verify_backup`] needs no
//! decompression.
//!
//! # Restore
//!
//! 1. Verify the checksum. A mismatch aborts before the live store is touched.
//! 2. Decompress next to the live store.
//! 3. Move the live store aside as a rollback copy.
//! 4. Move the restored copy into place and count its records.
//! 5. Drop the rollback copy, or put it back if any step failed.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::catalog::BackupCatalog;
use crate::error::{DefragError, Result};
use crate::models::BackupRecord;
use crate::store::RecordCounter;

/// Reports the free bytes on the volume holding a path.
pub type SpaceProbe = fn(&Path) -> io::Result<u64>;

/// Backups need strictly more free space than this multiple of the store size.
const SPACE_FACTOR: u64 = 2;

const FILE_SUFFIX: &str = ".db.gz";
const DIR_SUFFIX: &str = ".zip";

fn disk_space(path: &Path) -> io::Result<u64> {
    fs2::available_space(path)
}

pub struct BackupManager {
    dir: PathBuf,
    catalog: BackupCatalog,
    counter: Arc<dyn RecordCounter>,
    space_probe: SpaceProbe,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, counter: Arc<dyn RecordCounter>) -> Self {
        let dir = dir.into();
        Self {
            catalog: BackupCatalog::new(&dir),
            dir,
            counter,
            space_probe: disk_space,
        }
    }

    pub fn with_space_probe(mut self, probe: SpaceProbe) -> Self {
        self.space_probe = probe;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    /// Snapshot the store at `store_path` and catalog it.
    pub async fn create_backup(&self, store_path: &Path) -> Result<BackupRecord> {
        let store_size = path_size(store_path)?;
        std::fs::create_dir_all(&self.dir)?;

        let required = store_size.saturating_mul(SPACE_FACTOR);
        let available = (self.space_probe)(&self.dir)?;
        if available <= required {
            return Err(DefragError::Resource {
                required,
                available,
            });
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let stem = format!(
            "memory_backup_{}_{}",
            created_at.format("%Y%m%dT%H%M%S%.3fZ"),
            &id.simple().to_string()[..8]
        );
        let staging = self.dir.join(&stem);
        let is_dir = store_path.is_dir();
        let archive = self
            .dir
            .join(format!("{}{}", stem, if is_dir { DIR_SUFFIX } else { FILE_SUFFIX }));

        let result = self
            .build_archive(store_path, &staging, &archive, is_dir)
            .await;
        remove_path(&staging);
        remove_sqlite_sidecars(&staging);
        let record_count = match result {
            Ok(count) => count,
            Err(e) => {
                remove_path(&archive);
                return Err(e);
            }
        };

        let archive_path = archive.clone();
        let checksum = tokio::task::spawn_blocking(move || sha256_file(&archive_path)).await??;
        let size_bytes = std::fs::metadata(&archive)?.len();

        let record = BackupRecord {
            id,
            created_at,
            source_path: store_path.display().to_string(),
            backup_path: archive.display().to_string(),
            checksum,
            record_count,
            size_bytes,
        };
        self.catalog.append(record.clone())?;

        info!(
            backup = %record.id,
            records = record.record_count,
            bytes = record.size_bytes,
            path = %record.backup_path,
            "backup created"
        );
        Ok(record)
    }

    /// Copy, count and compress. Returns the record count of the copy.
    async fn build_archive(
        &self,
        store_path: &Path,
        staging: &Path,
        archive: &Path,
        is_dir: bool,
    ) -> Result<u64> {
        let (src, dst) = (store_path.to_path_buf(), staging.to_path_buf());
        tokio::task::spawn_blocking(move || {
            if is_dir {
                copy_dir(&src, &dst)
            } else {
                std::fs::copy(&src, &dst).map(|_| ())
            }
        })
        .await??;

        let record_count = self.counter.count_records(staging).await?;
        // Opening the copy may leave sidecar files behind.
        remove_sqlite_sidecars(staging);

        let (src, dst) = (staging.to_path_buf(), archive.to_path_buf());
        tokio::task::spawn_blocking(move || {
            if is_dir {
                zip_dir(&src, &dst)
            } else {
                gzip_file(&src, &dst).map_err(DefragError::from)
            }
        })
        .await??;

        Ok(record_count)
    }

    /// Restore backup `id` over the store it was taken from.
    pub async fn restore_backup(&self, id: Uuid) -> Result<BackupRecord> {
        let record = self.lookup(id)?;
        let target = PathBuf::from(&record.source_path);
        self.restore_record(record, &target).await
    }

    /// Restore backup `id` to `target` instead of its original location.
    pub async fn restore_backup_to(&self, id: Uuid, target: &Path) -> Result<BackupRecord> {
        let record = self.lookup(id)?;
        self.restore_record(record, target).await
    }

    async fn restore_record(&self, record: BackupRecord, target: &Path) -> Result<BackupRecord> {
        self.check_checksum(&record).await?;

        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = target
            .file_name()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot restore to {}", target.display()),
                )
            })?
            .to_string_lossy()
            .into_owned();
        let tag = &record.id.simple().to_string()[..8];
        let staging = parent.join(format!(".{}.restore-{}", name, tag));
        let rollback = parent.join(format!("{}.rollback-{}", name, tag));
        remove_path(&staging);

        let (src, dst) = (PathBuf::from(&record.backup_path), staging.clone());
        let unpacked = tokio::task::spawn_blocking(move || {
            if src.to_string_lossy().ends_with(DIR_SUFFIX) {
                unzip_dir(&src, &dst)
            } else {
                gunzip_file(&src, &dst).map_err(DefragError::from)
            }
        })
        .await?;
        if let Err(e) = unpacked {
            remove_path(&staging);
            return Err(e);
        }

        let had_live = target.exists();
        if had_live {
            if let Err(e) = std::fs::rename(target, &rollback) {
                remove_path(&staging);
                return Err(e.into());
            }
        }

        match self.swap_in(&staging, target, record.record_count).await {
            Ok(()) => {
                if had_live {
                    remove_path(&rollback);
                }
                info!(backup = %record.id, target = %target.display(), "backup restored");
                Ok(record)
            }
            Err(e) => {
                warn!(backup = %record.id, error = %e, "restore failed, reinstating previous store");
                remove_path(&staging);
                remove_path(target);
                remove_sqlite_sidecars(target);
                if had_live {
                    if let Err(reinstate) = std::fs::rename(&rollback, target) {
                        error!(
                            backup = %record.id,
                            error = %reinstate,
                            rollback = %rollback.display(),
                            "could not reinstate previous store"
                        );
                        return Err(DefragError::IndeterminateState {
                            write: e.to_string(),
                            rollback: format!(
                                "reinstating {} from {}: {}",
                                target.display(),
                                rollback.display(),
                                reinstate
                            ),
                            backup_id: record.id,
                        });
                    }
                }
                Err(e)
            }
        }
    }

    async fn swap_in(&self, staging: &Path, target: &Path, expected: u64) -> Result<()> {
        std::fs::rename(staging, target)?;
        let restored = self.counter.count_records(target).await?;
        remove_sqlite_sidecars(target);
        if restored != expected {
            return Err(DefragError::Integrity(format!(
                "restored store holds {} records, backup cataloged {}",
                restored, expected
            )));
        }
        Ok(())
    }

    /// Recompute the checksum of backup `id` and compare it to the catalog.
    pub async fn verify_backup(&self, id: Uuid) -> Result<BackupRecord> {
        let record = self.lookup(id)?;
        self.check_checksum(&record).await?;
        Ok(record)
    }

    async fn check_checksum(&self, record: &BackupRecord) -> Result<()> {
        let path = PathBuf::from(&record.backup_path);
        if !path.is_file() {
            return Err(DefragError::BackupNotFound(record.id));
        }
        let actual = tokio::task::spawn_blocking(move || sha256_file(&path)).await??;
        if actual != record.checksum {
            return Err(DefragError::Integrity(format!(
                "checksum mismatch for backup {}: cataloged {}, found {}",
                record.id, record.checksum, actual
            )));
        }
        debug!(backup = %record.id, "checksum verified");
        Ok(())
    }

    fn lookup(&self, id: Uuid) -> Result<BackupRecord> {
        self.catalog
            .find(id)?
            .ok_or(DefragError::BackupNotFound(id))
    }

    /// Cataloged backups whose file still exists, oldest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self
            .catalog
            .load()?
            .into_iter()
            .filter(|r| Path::new(&r.backup_path).is_file())
            .collect())
    }

    /// Delete backup `id`: file first, then its catalog entry.
    pub fn delete_backup(&self, id: Uuid) -> Result<BackupRecord> {
        let record = self.lookup(id)?;
        remove_file_if_present(Path::new(&record.backup_path))?;
        self.catalog.remove(id)?;
        info!(backup = %id, "backup deleted");
        Ok(record)
    }

    /// Keep the `keep_last` newest backups and delete the rest. Returns the
    /// deleted entries.
    pub fn cleanup_old_backups(&self, keep_last: usize) -> Result<Vec<BackupRecord>> {
        let records = self.catalog.load()?;
        let mut order: Vec<usize> = (0..records.len()).collect();
        // Newest first; for equal timestamps the later catalog entry is newer.
        order.sort_by(|&a, &b| {
            records[b]
                .created_at
                .cmp(&records[a].created_at)
                .then(b.cmp(&a))
        });

        let mut doomed = vec![false; records.len()];
        for &idx in order.iter().skip(keep_last) {
            doomed[idx] = true;
        }
        if !doomed.iter().any(|d| *d) {
            return Ok(Vec::new());
        }

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for (record, doomed) in records.into_iter().zip(doomed) {
            if doomed {
                remove_file_if_present(Path::new(&record.backup_path))?;
                removed.push(record);
            } else {
                kept.push(record);
            }
        }
        self.catalog.save(&kept)?;
        info!(removed = removed.len(), kept = kept.len(), "old backups cleaned up");
        Ok(removed)
    }
}

/// Bytes used by a store: the file length, or the sum over a directory.
pub fn path_size(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&out)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &out)?;
        }
    }
    Ok(())
}

fn gzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut input = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dst)?), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    let mut out = encoder.finish()?;
    io::Write::flush(&mut out)?;
    out.get_ref().sync_all()
}

fn gunzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut out = BufWriter::new(File::create(dst)?);
    io::copy(&mut decoder, &mut out)?;
    io::Write::flush(&mut out)
}

fn zip_dir(src: &Path, dst: &Path) -> Result<()> {
    let mut writer = zip::ZipWriter::new(BufWriter::new(File::create(dst)?));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            io::copy(&mut File::open(entry.path())?, &mut writer)?;
        }
    }

    let mut out = writer.finish()?;
    io::Write::flush(&mut out)?;
    Ok(())
}

fn unzip_dir(src: &Path, dst: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(BufReader::new(File::open(src)?))?;
    std::fs::create_dir_all(dst)?;
    archive.extract(dst)?;
    Ok(())
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Best-effort removal of a file or directory tree.
fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove temporary path");
        }
    }
}

fn remove_sqlite_sidecars(path: &Path) {
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}
