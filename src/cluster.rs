//! Similarity clustering engine.
//!
//! Groups near-duplicate records by embedding similarity using a single
//! seed-growth pass:
//!
//! 1. Walk records in load order, skipping ones already in a cluster.
//! 2. Compare the seed with every other unclustered record (cosine).
//! 3. Everything at or above the threshold joins the seed's group.
//! 4. Groups of two or more become clusters; lone seeds are dropped.
//! 5. Each cluster reports the **mean pairwise** similarity of its members
//!    and orders them oldest first.
//!
//! Admission only checks similarity to the seed, so two members of the same
//! cluster may be below the threshold relative to each other. The reported
//! similarity reflects that.
//!
//! # Scaling
//!
//! The pass is O(n²) comparisons in the worst case. Large candidate scans
//! are split into chunks and run on tokio's blocking pool, at most
//! `max_concurrency` chunks at a time. `batch_size` only controls how often
//! progress is reported. There is no approximate index.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{AnalysisResult, Cluster, Record};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::recommend::generate_recommendations;
use crate::similarity::{cosine_similarity, mean_pairwise_similarity};
use crate::synthesize::{merge_metadata, synthesize_content};

/// Tuning for one analysis run.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Minimum similarity to the seed for a record to join its cluster.
    pub similarity_threshold: f32,
    /// Seeds processed between progress reports.
    pub batch_size: usize,
    /// Upper bound on comparison chunks in flight at once.
    pub max_concurrency: usize,
    /// Candidates per comparison chunk. Scans no larger than this run inline.
    pub comparison_chunk: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            batch_size: 100,
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            comparison_chunk: 256,
        }
    }
}

pub struct ClusterEngine {
    settings: ClusterSettings,
}

impl ClusterEngine {
    pub fn new(settings: ClusterSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Cluster `records` and wrap the result with savings and recommendations.
    pub async fn analyze(
        &self,
        records: Vec<Record>,
        progress: &dyn ProgressReporter,
    ) -> Result<AnalysisResult> {
        if records.is_empty() {
            progress.report(ProgressEvent::Done { clusters: 0 });
            return Ok(AnalysisResult::empty());
        }

        let started = std::time::Instant::now();
        let total = records.len();
        let clusters = self.find_clusters(Arc::new(records), progress).await?;

        let duplicates: usize = clusters.iter().map(|c| c.members.len() - 1).sum();
        let potential_savings_percent = (duplicates as f64 / total as f64 * 100.0) as u32;
        let generated_at = Utc::now();
        let recommendations = generate_recommendations(&clusters, total, generated_at);

        info!(
            records = total,
            clusters = clusters.len(),
            duplicates,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis complete"
        );
        progress.report(ProgressEvent::Done {
            clusters: clusters.len() as u64,
        });

        Ok(AnalysisResult {
            total_records: total,
            clusters,
            potential_savings_percent,
            recommendations,
            generated_at,
        })
    }

    /// Run the seed-growth pass. Clusters come back largest first.
    pub async fn find_clusters(
        &self,
        records: Arc<Vec<Record>>,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<Cluster>> {
        let n = records.len();
        let batch = self.settings.batch_size.max(1);
        let mut processed = vec![false; n];
        let mut groups: Vec<Vec<usize>> = Vec::new();

        for start in (0..n).step_by(batch) {
            let end = (start + batch).min(n);
            for seed in start..end {
                if processed[seed] {
                    continue;
                }
                let candidates: Vec<usize> =
                    (0..n).filter(|&j| j != seed && !processed[j]).collect();
                let matches = self.scan_seed(&records, seed, candidates).await?;
                if matches.is_empty() {
                    continue;
                }

                processed[seed] = true;
                for &j in &matches {
                    processed[j] = true;
                }
                let mut group = Vec::with_capacity(matches.len() + 1);
                group.push(seed);
                group.extend(matches);
                groups.push(group);
            }
            progress.report(ProgressEvent::Comparing {
                n: end as u64,
                total: n as u64,
            });
        }

        progress.report(ProgressEvent::Synthesizing {
            clusters: groups.len() as u64,
        });
        let now = Utc::now();
        let mut clusters: Vec<Cluster> = groups
            .into_iter()
            .map(|group| build_cluster(&records, group, now))
            .collect();
        clusters.sort_by(|a, b| b.members.len().cmp(&a.members.len()));
        Ok(clusters)
    }

    /// Indices of `candidates` similar enough to `seed`, ascending.
    async fn scan_seed(
        &self,
        records: &Arc<Vec<Record>>,
        seed: usize,
        candidates: Vec<usize>,
    ) -> Result<Vec<usize>> {
        let threshold = self.settings.similarity_threshold;
        let chunk_size = self.settings.comparison_chunk.max(1);

        if candidates.len() <= chunk_size {
            return Ok(matching(records, seed, &candidates, threshold));
        }

        let max_in_flight = self.settings.max_concurrency.max(1);
        let mut in_flight = JoinSet::new();
        let mut matches = Vec::new();

        for chunk in candidates.chunks(chunk_size) {
            if in_flight.len() >= max_in_flight {
                if let Some(done) = in_flight.join_next().await {
                    matches.extend(done?);
                }
            }
            let records = Arc::clone(records);
            let chunk = chunk.to_vec();
            in_flight.spawn_blocking(move || matching(&records, seed, &chunk, threshold));
        }
        while let Some(done) = in_flight.join_next().await {
            matches.extend(done?);
        }

        // Completion order is arbitrary.
        matches.sort_unstable();
        Ok(matches)
    }
}

fn matching(records: &[Record], seed: usize, candidates: &[usize], threshold: f32) -> Vec<usize> {
    let seed_vec = &records[seed].embedding;
    candidates
        .iter()
        .copied()
        .filter(|&j| cosine_similarity(seed_vec, &records[j].embedding) >= threshold)
        .collect()
}

fn build_cluster(records: &[Record], mut group: Vec<usize>, now: DateTime<Utc>) -> Cluster {
    group.sort_unstable();
    let mut members: Vec<Record> = group.iter().map(|&i| records[i].clone()).collect();
    members.sort_by_key(|r| r.timestamp);

    let similarity = mean_pairwise_similarity(&members);
    let synthesized_content = synthesize_content(&members);
    let merged_metadata = merge_metadata(&members, now);

    let cluster = Cluster {
        id: Uuid::new_v4(),
        members,
        similarity,
        synthesized_content,
        merged_metadata,
    };
    debug!(
        cluster = %cluster.id,
        size = cluster.members.len(),
        similarity = cluster.similarity,
        "cluster formed"
    );
    cluster
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use chrono::{Duration, TimeZone};
    use std::collections::{BTreeMap, HashSet};

    fn rec(id: &str, content: &str, embedding: Vec<f32>, day: i64) -> Record {
        Record {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata: BTreeMap::new(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(day),
            content_hash: format!("hash-{}", id),
        }
    }

    fn engine() -> ClusterEngine {
        ClusterEngine::new(ClusterSettings::default())
    }

    fn membership(clusters: &[Cluster]) -> Vec<HashSet<String>> {
        let mut sets: Vec<HashSet<String>> = clusters
            .iter()
            .map(|c| c.members.iter().map(|m| m.id.clone()).collect())
            .collect();
        sets.sort_by_key(|s| {
            let mut ids: Vec<_> = s.iter().cloned().collect();
            ids.sort();
            ids
        });
        sets
    }

    /// Two obvious groups plus two loners, in the shape of a real memory store.
    fn fixture() -> Vec<Record> {
        vec![
            rec("mem-009", "User lives in Geneva", vec![0.7, 0.1, 0.1, 0.1, 0.0], 8),
            rec("mem-001", "User prefers Python", vec![0.1, 0.2, 0.3, 0.4, 0.5], 0),
            rec("mem-004", "User is learning Swift", vec![0.5, 0.4, 0.3, 0.2, 0.1], 3),
            rec("mem-002", "Likes Python for data", vec![0.11, 0.21, 0.31, 0.41, 0.51], 1),
            rec("mem-005", "Builds iOS apps in Swift", vec![0.51, 0.41, 0.31, 0.21, 0.11], 4),
            rec("mem-003", "Python for data science", vec![0.12, 0.22, 0.32, 0.42, 0.52], 2),
            rec("mem-010", "Has Mauritian heritage", vec![0.0, 0.0, 0.0, 0.1, 0.9], 9),
        ]
    }

    #[tokio::test]
    async fn three_identical_embeddings_form_one_cluster() {
        let records = vec![
            rec("a", "A. B.", vec![1.0, 0.0, 0.0], 0),
            rec("b", "B. C.", vec![1.0, 0.0, 0.0], 1),
            rec("c", "A. C.", vec![1.0, 0.0, 0.0], 2),
        ];
        let result = engine().analyze(records, &NoProgress).await.unwrap();
        assert_eq!(result.clusters.len(), 1);
        let cluster = &result.clusters[0];
        assert_eq!(cluster.members.len(), 3);
        assert!((cluster.similarity - 1.0).abs() < 1e-5);
        assert_eq!(cluster.merged_metadata["consolidated_count"], "3");
        for segment in ["A.", "B.", "C."] {
            assert_eq!(cluster.synthesized_content.matches(segment).count(), 1);
        }
        assert_eq!(result.potential_savings_percent, 66);
    }

    #[tokio::test]
    async fn loners_are_omitted_and_members_ordered_by_time() {
        let clusters = engine()
            .find_clusters(Arc::new(fixture()), &NoProgress)
            .await
            .unwrap();
        assert_eq!(clusters.len(), 2);
        // Largest first.
        assert_eq!(clusters[0].members.len(), 3);
        let ids: Vec<_> = clusters[0].members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["mem-001", "mem-002", "mem-003"]);
        assert!(clusters
            .iter()
            .flat_map(|c| &c.members)
            .all(|m| m.id != "mem-009" && m.id != "mem-010"));
    }

    #[tokio::test]
    async fn clustering_is_idempotent() {
        let first = engine()
            .find_clusters(Arc::new(fixture()), &NoProgress)
            .await
            .unwrap();
        let second = engine()
            .find_clusters(Arc::new(fixture()), &NoProgress)
            .await
            .unwrap();
        assert_eq!(membership(&first), membership(&second));
    }

    #[tokio::test]
    async fn every_cluster_valid_and_disjoint() {
        let mut records = fixture();
        for i in 0..40 {
            let angle = (i % 8) as f32 * 0.05;
            records.push(rec(
                &format!("bulk-{}", i),
                "bulk",
                vec![angle.cos(), angle.sin(), 0.0, 0.0, 0.0],
                i,
            ));
        }
        let clusters = engine()
            .find_clusters(Arc::new(records), &NoProgress)
            .await
            .unwrap();

        let mut seen = HashSet::new();
        for cluster in &clusters {
            assert!(cluster.members.len() >= 2);
            assert!((0.0..=1.0).contains(&cluster.similarity));
            for member in &cluster.members {
                assert!(seen.insert(member.id.clone()), "{} in two clusters", member.id);
            }
        }
    }

    #[tokio::test]
    async fn chunked_scan_matches_inline_scan() {
        let mut records = Vec::new();
        for i in 0..60 {
            let group = (i % 5) as f32;
            records.push(rec(
                &format!("r{}", i),
                "x",
                vec![group.cos(), group.sin(), 0.01 * (i % 3) as f32],
                60 - i,
            ));
        }

        let inline = engine()
            .find_clusters(Arc::new(records.clone()), &NoProgress)
            .await
            .unwrap();
        let chunked = ClusterEngine::new(ClusterSettings {
            comparison_chunk: 4,
            max_concurrency: 3,
            batch_size: 7,
            ..ClusterSettings::default()
        })
        .find_clusters(Arc::new(records), &NoProgress)
        .await
        .unwrap();

        assert_eq!(membership(&inline), membership(&chunked));
        let order = |cs: &[Cluster]| -> Vec<Vec<String>> {
            cs.iter()
                .map(|c| c.members.iter().map(|m| m.id.clone()).collect())
                .collect()
        };
        assert_eq!(order(&inline), order(&chunked));
    }

    #[tokio::test]
    async fn zero_and_mismatched_embeddings_never_cluster() {
        let records = vec![
            rec("z1", "zero", vec![0.0, 0.0], 0),
            rec("z2", "zero", vec![0.0, 0.0], 1),
            rec("short", "short", vec![1.0], 2),
            rec("long", "long", vec![1.0, 0.0], 3),
        ];
        let result = engine().analyze(records, &NoProgress).await.unwrap();
        assert!(result.clusters.is_empty());
        assert_eq!(result.total_records, 4);
        assert_eq!(result.potential_savings_percent, 0);
    }

    #[tokio::test]
    async fn empty_input_is_empty_result() {
        let result = engine().analyze(Vec::new(), &NoProgress).await.unwrap();
        assert_eq!(result.total_records, 0);
        assert!(result.clusters.is_empty());
    }
}
