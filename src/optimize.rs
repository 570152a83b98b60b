//! Optimization transaction manager.
//!
//! Turns approved clusters into a committed merge:
//!
//! 1. **Validate** the approval set against the analysis and the current
//!    records. Nothing is touched when validation fails.
//! 2. **Plan** a [`ChangeSet`]: the oldest member of each cluster survives
//!    with the merged content, the rest are removed.
//! 3. **Back up** the store.
//! 4. **Commit** according to the store's [`CommitCapability`]:
//!    - `PartialUpdate` stores roll back their own transaction;
//!    - `ReplaceOnly` stores are restored from the backup taken in step 3.
//! 5. **Maintain** the store (reindex, vacuum). Failures here are reported
//!    but never undo the commit.
//!
//! A dry run stops after step 2 and reports what would change.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::BackupManager;
use crate::error::{DefragError, Result, StoreError, ValidationError};
use crate::models::{AnalysisResult, BackupRecord, Cluster, OptimizationRequest, Record};
use crate::store::{ApplyOptions, ChangeSet, CommitCapability, Store};
use crate::synthesize::{CONSOLIDATED_COUNT_KEY, CONSOLIDATED_DATE_KEY};

/// Extracts the terms a merge must not lose.
pub type KeyTermExtractor = fn(&str) -> Vec<String>;

const MAX_KEY_TERMS: usize = 20;

pub const OPTIMIZATION_DATE_KEY: &str = "optimization_date";
pub const MERGED_COUNT_KEY: &str = "merged_count";
pub const MERGED_IDS_KEY: &str = "merged_ids";
pub const ORIGINAL_HASH_KEY: &str = "original_content_hash";

/// Capitalized words and words containing digits, longer than two
/// characters, in text order. At most 20.
///
/// Tuned for Latin-script text; other scripts yield few or no terms.
pub fn extract_key_terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|word| word.chars().count() > 2)
        .filter(|word| {
            word.chars().next().is_some_and(char::is_uppercase)
                || word.chars().any(|c| c.is_ascii_digit())
        })
        .take(MAX_KEY_TERMS)
        .map(str::to_string)
        .collect()
}

/// Terms from the members' contents that the merged text lacks
/// (case-insensitive), together with the number of terms checked.
fn missing_terms(cluster: &Cluster, extract: KeyTermExtractor) -> (Vec<String>, usize) {
    let all_content = cluster
        .members
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let terms = extract(&all_content);
    let merged = cluster.synthesized_content.to_lowercase();
    let missing = terms
        .iter()
        .filter(|term| !merged.contains(&term.to_lowercase()))
        .cloned()
        .collect();
    (missing, terms.len())
}

/// Approved clusters in analysis order.
fn approved_clusters<'a>(
    analysis: &'a AnalysisResult,
    request: &OptimizationRequest,
) -> std::result::Result<Vec<&'a Cluster>, ValidationError> {
    if request.approved_cluster_ids.is_empty() {
        return Err(ValidationError::NoApprovedClusters);
    }
    let known: HashSet<Uuid> = analysis.clusters.iter().map(|c| c.id).collect();
    let mut unknown: Vec<Uuid> = request
        .approved_cluster_ids
        .iter()
        .filter(|id| !known.contains(id))
        .copied()
        .collect();
    unknown.sort();
    if let Some(id) = unknown.first() {
        return Err(ValidationError::UnknownCluster(*id));
    }
    Ok(analysis
        .clusters
        .iter()
        .filter(|c| request.approved_cluster_ids.contains(&c.id))
        .collect())
}

/// Check an approval set before anything is written.
pub fn validate(
    analysis: &AnalysisResult,
    request: &OptimizationRequest,
    current: &[Record],
) -> std::result::Result<(), ValidationError> {
    validate_with(analysis, request, current, extract_key_terms)
}

/// [`validate`] with a custom key-term extractor.
pub fn validate_with(
    analysis: &AnalysisResult,
    request: &OptimizationRequest,
    current: &[Record],
    extract: KeyTermExtractor,
) -> std::result::Result<(), ValidationError> {
    let clusters = approved_clusters(analysis, request)?;
    let present: HashSet<&str> = current.iter().map(|r| r.id.as_str()).collect();

    for cluster in clusters {
        if cluster.members.len() < 2 {
            return Err(ValidationError::InvalidClusterSize {
                id: cluster.id,
                size: cluster.members.len(),
            });
        }
        if cluster.synthesized_content.trim().is_empty() {
            return Err(ValidationError::EmptySynthesis(cluster.id));
        }

        let (missing, checked) = missing_terms(cluster, extract);
        if missing.len() * 3 > checked {
            return Err(ValidationError::PotentialDataLoss {
                cluster: cluster.id,
                missing,
            });
        }

        if let Some(stale) = cluster
            .members
            .iter()
            .find(|m| !present.contains(m.id.as_str()))
        {
            return Err(ValidationError::StaleCluster {
                cluster: cluster.id,
                record_id: stale.id.clone(),
            });
        }
    }
    Ok(())
}

/// Build the change set for `clusters` over the current `records`.
///
/// The survivor of each cluster is its oldest member. It keeps its id,
/// hash, timestamp and embedding; content and metadata come from the
/// merge. Records outside the clusters pass through unchanged, in order.
pub fn plan_change_set(
    records: &[Record],
    clusters: &[&Cluster],
    request: &OptimizationRequest,
    now: DateTime<Utc>,
) -> ChangeSet {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut replacements: HashMap<&str, Record> = HashMap::new();
    let mut removed: HashSet<&str> = HashSet::new();
    let mut removals = Vec::new();

    for cluster in clusters {
        let Some((survivor, others)) = cluster.members.split_first() else {
            continue;
        };

        let mut merged = survivor.clone();
        merged.content = cluster.synthesized_content.clone();
        merged.metadata = if request.preserve_metadata {
            cluster.merged_metadata.clone()
        } else {
            let mut own = survivor.metadata.clone();
            for key in [CONSOLIDATED_COUNT_KEY, CONSOLIDATED_DATE_KEY] {
                if let Some(value) = cluster.merged_metadata.get(key) {
                    own.insert(key.to_string(), value.clone());
                }
            }
            own
        };

        if request.create_audit_trail {
            merged
                .metadata
                .insert(OPTIMIZATION_DATE_KEY.to_string(), stamp.clone());
            merged.metadata.insert(
                MERGED_COUNT_KEY.to_string(),
                cluster.members.len().to_string(),
            );
            merged.metadata.insert(
                MERGED_IDS_KEY.to_string(),
                others
                    .iter()
                    .map(|r| r.id.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            );
            merged
                .metadata
                .insert(ORIGINAL_HASH_KEY.to_string(), survivor.content_hash.clone());
        }

        replacements.insert(survivor.id.as_str(), merged);
        for other in others {
            removed.insert(other.id.as_str());
            removals.push(other.clone());
        }
    }

    let mut updates = Vec::with_capacity(replacements.len());
    let mut result = Vec::with_capacity(records.len().saturating_sub(removals.len()));
    for record in records {
        if removed.contains(record.id.as_str()) {
            continue;
        }
        match replacements.get(record.id.as_str()) {
            Some(merged) => {
                updates.push(merged.clone());
                result.push(merged.clone());
            }
            None => result.push(record.clone()),
        }
    }

    ChangeSet {
        records: result,
        updates,
        removals,
    }
}

/// What one approved cluster would become.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    pub cluster_id: Uuid,
    pub records_before: usize,
    pub records_after: usize,
    pub old_contents: Vec<String>,
    pub new_content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationPreview {
    pub records_before: usize,
    pub records_after: usize,
    pub savings_percent: u32,
    pub changes: Vec<PlannedChange>,
}

/// Summarize what approving `request` would do. Reads nothing from the store.
pub fn preview(
    analysis: &AnalysisResult,
    request: &OptimizationRequest,
) -> std::result::Result<OptimizationPreview, ValidationError> {
    let clusters = approved_clusters(analysis, request)?;
    let records_before: usize = clusters.iter().map(|c| c.members.len()).sum();
    let records_after = clusters.len();
    let savings_percent = if records_before > 0 {
        ((records_before - records_after) as f64 / records_before as f64 * 100.0) as u32
    } else {
        0
    };
    let changes = clusters
        .iter()
        .map(|c| PlannedChange {
            cluster_id: c.id,
            records_before: c.members.len(),
            records_after: 1,
            old_contents: c.members.iter().map(|m| m.content.clone()).collect(),
            new_content: c.synthesized_content.clone(),
        })
        .collect();

    Ok(OptimizationPreview {
        records_before,
        records_after,
        savings_percent,
        changes,
    })
}

/// Outcome of an optimize call.
#[derive(Debug, Clone)]
pub struct OptimizationReport {
    pub dry_run: bool,
    pub clusters_merged: usize,
    pub records_before: usize,
    pub records_after: usize,
    pub records_removed: usize,
    /// Backup taken before the commit. `None` for dry runs.
    pub backup: Option<BackupRecord>,
    /// Set when post-commit maintenance failed. The commit itself stands.
    pub maintenance_error: Option<String>,
}

/// Validate, back up and commit `request` against `store`.
///
/// The caller must hold exclusive access to `store` for the whole call.
pub async fn optimize(
    store: &mut dyn Store,
    backups: &BackupManager,
    analysis: &AnalysisResult,
    request: &OptimizationRequest,
) -> Result<OptimizationReport> {
    let records = store.load_all().await?;
    validate(analysis, request, &records)?;

    let clusters = approved_clusters(analysis, request)?;
    let now = Utc::now();
    let changes = plan_change_set(&records, &clusters, request, now);
    let mut report = OptimizationReport {
        dry_run: request.dry_run,
        clusters_merged: clusters.len(),
        records_before: records.len(),
        records_after: changes.records.len(),
        records_removed: changes.removals.len(),
        backup: None,
        maintenance_error: None,
    };

    if request.dry_run {
        info!(
            clusters = report.clusters_merged,
            removed = report.records_removed,
            "dry run, store left untouched"
        );
        return Ok(report);
    }

    let backup = backups.create_backup(store.location()).await?;
    let options = ApplyOptions {
        archive_removals: true,
        archived_at: now,
    };
    commit(store, &changes, &options, &backup, backups).await?;
    info!(
        clusters = report.clusters_merged,
        removed = report.records_removed,
        backup = %backup.id,
        "optimization committed"
    );
    report.backup = Some(backup);

    if let Err(e) = store.perform_maintenance().await {
        warn!(error = %e, "post-commit maintenance failed");
        report.maintenance_error = Some(e.to_string());
    }
    Ok(report)
}

/// Apply `changes` all or nothing, using `backup` to undo replace-only writes.
pub async fn commit(
    store: &mut dyn Store,
    changes: &ChangeSet,
    options: &ApplyOptions,
    backup: &BackupRecord,
    backups: &BackupManager,
) -> Result<()> {
    let write = match store.apply_change_set(changes, options).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    match store.capability() {
        CommitCapability::PartialUpdate => match write {
            StoreError::RollbackFailed { write, rollback } => {
                error!(%write, %rollback, backup = %backup.id, "commit and rollback both failed");
                Err(DefragError::IndeterminateState {
                    write,
                    rollback,
                    backup_id: backup.id,
                })
            }
            other => {
                warn!(error = %other, "commit failed and was rolled back");
                Err(DefragError::Transaction(other.to_string()))
            }
        },
        CommitCapability::ReplaceOnly => {
            warn!(error = %write, backup = %backup.id, "replace failed, restoring backup");
            let location = store.location().to_path_buf();
            store.disconnect().await;
            if let Err(rollback) = backups.restore_backup_to(backup.id, &location).await {
                error!(%write, %rollback, backup = %backup.id, "replace failed and backup restore failed");
                return Err(DefragError::IndeterminateState {
                    write: write.to_string(),
                    rollback: rollback.to_string(),
                    backup_id: backup.id,
                });
            }
            if let Err(e) = store.connect().await {
                error!(error = %e, backup = %backup.id, "store restored but reconnect failed");
                return Err(DefragError::Connection(format!(
                    "commit failed ({}); store restored from backup {} but could not be reopened, \
                     reopen the session: {}",
                    write, backup.id, e
                )));
            }
            Err(DefragError::Transaction(write.to_string()))
        }
    }
}
