//! Core data models used throughout Memory Defrag.
//!
//! These types represent the records loaded from a store, the clusters the
//! analysis builds from them, and the requests and backups that flow
//! through the optimization pipeline.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A stored entry: text content, its embedding, and string metadata.
///
/// Identity is `id`. Records are values: optimization produces new
/// records instead of mutating loaded ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
}

/// SHA-256 hex digest of a record's content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A group of at least two near-duplicate records.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub id: Uuid,
    /// Sorted by timestamp, oldest first.
    pub members: Vec<Record>,
    /// Mean pairwise cosine similarity, in `[0, 1]`.
    pub similarity: f32,
    pub synthesized_content: String,
    pub merged_metadata: BTreeMap<String, String>,
}

impl Cluster {
    pub fn oldest(&self) -> Option<&Record> {
        self.members.first()
    }

    pub fn newest(&self) -> Option<&Record> {
        self.members.last()
    }

    /// Share of this cluster's records that a merge removes.
    pub fn savings_percent(&self) -> u32 {
        let n = self.members.len();
        if n == 0 {
            return 0;
        }
        (((n - 1) as f64 / n as f64) * 100.0) as u32
    }

    /// `"exact"` above 0.9 mean similarity, `"similar"` otherwise.
    pub fn label(&self) -> &'static str {
        if self.similarity > 0.9 {
            "exact"
        } else {
            "similar"
        }
    }
}

/// What a recommendation asks the user to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationKind {
    Merge,
    Archive,
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    High,
    Medium,
    Low,
}

/// Advisory notice derived from aggregate cluster statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub title: String,
    pub description: String,
    pub impact: Impact,
}

/// Snapshot produced by one analysis run. Superseded wholesale by the next.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub total_records: usize,
    /// Largest first.
    pub clusters: Vec<Cluster>,
    pub potential_savings_percent: u32,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn empty() -> Self {
        Self {
            total_records: 0,
            clusters: Vec::new(),
            potential_savings_percent: 0,
            recommendations: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    /// Records a full merge of every cluster would remove.
    pub fn total_duplicates(&self) -> usize {
        self.clusters.iter().map(|c| c.members.len() - 1).sum()
    }

    pub fn cluster(&self, id: Uuid) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }
}

/// Caller-held approval plus commit options.
#[derive(Debug, Clone)]
pub struct OptimizationRequest {
    pub approved_cluster_ids: HashSet<Uuid>,
    pub preserve_metadata: bool,
    pub create_audit_trail: bool,
    pub dry_run: bool,
}

impl OptimizationRequest {
    pub fn approve<I: IntoIterator<Item = Uuid>>(ids: I) -> Self {
        Self {
            approved_cluster_ids: ids.into_iter().collect(),
            preserve_metadata: true,
            create_audit_trail: true,
            dry_run: false,
        }
    }
}

/// Catalog entry for one compressed store snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub source_path: String,
    pub backup_path: String,
    /// SHA-256 of the compressed bytes on disk, lowercase hex.
    pub checksum: String,
    pub record_count: u64,
    pub size_bytes: u64,
}
