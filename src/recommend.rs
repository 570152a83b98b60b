//! Advisory recommendations derived from an analysis.
//!
//! Never blocks anything; the notices only help a user decide what to
//! approve.

use chrono::{DateTime, Months, Utc};

use crate::models::{Cluster, Impact, Recommendation, RecommendationKind};

const HIGH_DUPLICATE_PERCENT: f64 = 30.0;
const LARGE_CLUSTER_MEMBERS: usize = 10;
const OLD_DUPLICATE_MONTHS: u32 = 6;
const OLD_DUPLICATE_COUNT: usize = 50;

/// Derive up to three notices from `clusters` over `total_records`.
pub fn generate_recommendations(
    clusters: &[Cluster],
    total_records: usize,
    now: DateTime<Utc>,
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    let duplicates: usize = clusters.iter().map(|c| c.members.len() - 1).sum();
    let duplicate_percent = if total_records > 0 {
        duplicates as f64 / total_records as f64 * 100.0
    } else {
        0.0
    };
    if duplicate_percent > HIGH_DUPLICATE_PERCENT {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Merge,
            title: "High Duplicate Count".to_string(),
            description: format!(
                "Over {}% of your records are duplicates. Running optimization could significantly reduce store size.",
                HIGH_DUPLICATE_PERCENT
            ),
            impact: Impact::High,
        });
    }

    if let Some(largest) = clusters.iter().map(|c| c.members.len()).max() {
        if largest > LARGE_CLUSTER_MEMBERS {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Review,
                title: "Large Duplicate Cluster Found".to_string(),
                description: format!(
                    "Found a cluster with {} similar records. Review this cluster carefully before merging.",
                    largest
                ),
                impact: Impact::Medium,
            });
        }
    }

    let cutoff = now
        .checked_sub_months(Months::new(OLD_DUPLICATE_MONTHS))
        .unwrap_or(now);
    let old = clusters
        .iter()
        .flat_map(|c| c.members.iter())
        .filter(|r| r.timestamp < cutoff)
        .count();
    if old > OLD_DUPLICATE_COUNT {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Archive,
            title: "Archive Old Duplicates".to_string(),
            description: format!(
                "Found {} duplicate records older than {} months. Consider archiving instead of merging.",
                old, OLD_DUPLICATE_MONTHS
            ),
            impact: Impact::Low,
        });
    }

    recommendations
}
