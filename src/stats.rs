//! Store statistics overview.
//!
//! A quick summary of what a store holds: record count, on-disk size,
//! average content length, the age range and the most common tags. Used by
//! `memdefrag stats` to size up a store before analyzing it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::Record;

const TOP_TAGS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub total_records: usize,
    pub size_bytes: u64,
    /// Mean content length in characters, truncated.
    pub average_content_len: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    /// Most used values of the comma-separated `tags` metadata key, most
    /// frequent first, ties by name.
    pub top_tags: Vec<(String, usize)>,
}

pub fn compute_statistics(records: &[Record], size_bytes: u64) -> StoreStatistics {
    let total_chars: usize = records.iter().map(|r| r.content.chars().count()).sum();
    let average_content_len = if records.is_empty() {
        0
    } else {
        total_chars / records.len()
    };

    let mut tags: HashMap<&str, usize> = HashMap::new();
    for record in records {
        if let Some(value) = record.metadata.get("tags") {
            for tag in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                *tags.entry(tag).or_default() += 1;
            }
        }
    }
    let mut top_tags: Vec<(String, usize)> = tags
        .into_iter()
        .map(|(tag, count)| (tag.to_string(), count))
        .collect();
    top_tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_tags.truncate(TOP_TAGS);

    StoreStatistics {
        total_records: records.len(),
        size_bytes,
        average_content_len,
        oldest: records.iter().map(|r| r.timestamp).min(),
        newest: records.iter().map(|r| r.timestamp).max(),
        top_tags,
    }
}

/// Print the summary shown by `memdefrag stats`.
pub fn print_statistics(location: &str, stats: &StoreStatistics) {
    println!("Memory Defrag — Store Stats");
    println!("===========================");
    println!();
    println!("  Store:       {}", location);
    println!("  Size:        {}", format_bytes(stats.size_bytes));
    println!();
    println!("  Records:     {}", stats.total_records);
    println!("  Avg length:  {} chars", stats.average_content_len);
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        println!("  Oldest:      {}", format_ts_relative(oldest));
        println!("  Newest:      {}", format_ts_relative(newest));
    }

    if !stats.top_tags.is_empty() {
        println!();
        println!("  Top tags:");
        println!("  {:<32} {:>8}", "TAG", "RECORDS");
        println!("  {}", "-".repeat(41));
        for (tag, count) in &stats.top_tags {
            println!("  {:<32} {:>8}", tag, count);
        }
    }
    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 days ago").
fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn rec(id: &str, content: &str, day: i64, tags: Option<&str>) -> Record {
        let mut metadata = BTreeMap::new();
        if let Some(tags) = tags {
            metadata.insert("tags".to_string(), tags.to_string());
        }
        Record {
            id: id.into(),
            content: content.into(),
            embedding: vec![1.0],
            metadata,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(day),
            content_hash: id.into(),
        }
    }

    #[test]
    fn summary_over_records() {
        let records = vec![
            rec("a", "four", 3, Some("python, data")),
            rec("b", "sixsix", 1, Some("python")),
            rec("c", "", 7, None),
            rec("d", "xy", 5, Some("data, python, ")),
        ];
        let stats = compute_statistics(&records, 2048);
        assert_eq!(stats.total_records, 4);
        assert_eq!(stats.size_bytes, 2048);
        assert_eq!(stats.average_content_len, 3);
        assert_eq!(stats.oldest, Some(records[1].timestamp));
        assert_eq!(stats.newest, Some(records[2].timestamp));
        assert_eq!(
            stats.top_tags,
            vec![("python".to_string(), 3), ("data".to_string(), 2)]
        );
    }

    #[test]
    fn empty_store() {
        let stats = compute_statistics(&[], 0);
        assert_eq!(stats.average_content_len, 0);
        assert!(stats.oldest.is_none());
        assert!(stats.top_tags.is_empty());
    }

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
