//! Session driver: one open store and the operations run against it.
//!
//! A [`Session`] owns the store handle behind a `tokio::sync::Mutex`, so
//! every store call is exclusive. Two flags keep analysis and optimization
//! from re-entering; a second caller gets [`DefragError::Busy`] instead of
//! waiting. Analysis progress can be polled through [`Session::progress`]
//! while an analysis runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::backup::{path_size, BackupManager};
use crate::cluster::ClusterEngine;
use crate::config::Config;
use crate::error::{DefragError, Result};
use crate::models::{AnalysisResult, BackupRecord, OptimizationRequest};
use crate::optimize::{self, OptimizationPreview, OptimizationReport};
use crate::progress::{ProgressEvent, ProgressReporter, ProgressSnapshot, ProgressState, Tracked};
use crate::stats::{compute_statistics, StoreStatistics};
use crate::store::{open_store, Store, StoreKind, StoreOpener};

/// Holds an in-progress flag for as long as it lives.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool, operation: &'static str) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(DefragError::Busy(operation));
        }
        Ok(Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Session {
    store: Mutex<Box<dyn Store>>,
    backups: BackupManager,
    engine: ClusterEngine,
    progress: ProgressState,
    analyzing: AtomicBool,
    optimizing: AtomicBool,
}

impl Session {
    pub fn new(store: Box<dyn Store>, backups: BackupManager, engine: ClusterEngine) -> Self {
        Self {
            store: Mutex::new(store),
            backups,
            engine,
            progress: ProgressState::default(),
            analyzing: AtomicBool::new(false),
            optimizing: AtomicBool::new(false),
        }
    }

    /// Open and connect the store named by `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = open_store(&config.store.path, &config.bridge).await?;
        let backups = BackupManager::new(
            config.backup.directory.clone(),
            Arc::new(StoreOpener::new(config.bridge.clone())),
        );
        let engine = ClusterEngine::new(config.analysis.cluster_settings());
        info!(
            path = %config.store.path.display(),
            kind = %store.kind(),
            "store opened"
        );
        Ok(Self::new(store, backups, engine))
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub async fn kind(&self) -> StoreKind {
        self.store.lock().await.kind()
    }

    /// Latest analysis progress.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Load every record fresh and cluster them.
    pub async fn analyze(&self, reporter: &dyn ProgressReporter) -> Result<AnalysisResult> {
        let _busy = FlagGuard::acquire(&self.analyzing, "analysis")?;
        self.progress.reset();
        let tracked = Tracked {
            state: &self.progress,
            reporter,
        };

        tracked.report(ProgressEvent::Loading);
        let records = self.store.lock().await.load_all().await?;
        self.engine.analyze(records, &tracked).await
    }

    pub fn preview(
        &self,
        analysis: &AnalysisResult,
        request: &OptimizationRequest,
    ) -> Result<OptimizationPreview> {
        Ok(optimize::preview(analysis, request)?)
    }

    /// Validate, back up and commit `request`. Single-flight per session.
    pub async fn optimize(
        &self,
        analysis: &AnalysisResult,
        request: &OptimizationRequest,
    ) -> Result<OptimizationReport> {
        let _busy = FlagGuard::acquire(&self.optimizing, "optimization")?;
        let mut store = self.store.lock().await;
        optimize::optimize(&mut **store, &self.backups, analysis, request).await
    }

    /// Replace the live store with backup `id`, then reconnect to it.
    pub async fn restore(&self, id: Uuid) -> Result<BackupRecord> {
        let _busy = FlagGuard::acquire(&self.optimizing, "optimization")?;
        let mut store = self.store.lock().await;
        let location = store.location().to_path_buf();
        store.disconnect().await;
        let restored = self.backups.restore_backup_to(id, &location).await;
        let reconnected = store.connect().await;
        let record = restored?;
        reconnected?;
        Ok(record)
    }

    /// Take a backup of the live store outside of an optimization.
    pub async fn backup(&self) -> Result<BackupRecord> {
        let store = self.store.lock().await;
        self.backups.create_backup(store.location()).await
    }

    pub async fn integrity_check(&self) -> Result<()> {
        Ok(self.store.lock().await.integrity_check().await?)
    }

    pub async fn statistics(&self) -> Result<StoreStatistics> {
        let store = self.store.lock().await;
        let records = store.load_all().await?;
        let size = path_size(store.location()).unwrap_or(0);
        Ok(compute_statistics(&records, size))
    }

    pub async fn close(self) {
        self.store.into_inner().disconnect().await;
    }
}
