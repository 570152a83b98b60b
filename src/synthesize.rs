//! Merge synthesis for a cluster of near-duplicate records.
//!
//! This is a text heuristic, not language understanding:
//!
//! 1. The longest member content (by characters, first wins on ties) is
//!    the base text.
//! 2. Every other member is split on `". "`; a segment is kept if it is
//!    not already a substring of the text built so far.
//! 3. Kept segments are appended under an `Additional information:` note.
//!
//! Metadata is merged by key union; conflicting values are joined with
//! `", "` in first-seen order.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::Record;

/// Separator used to split member contents into segments.
pub const SEGMENT_SEPARATOR: &str = ". ";

/// Metadata key recording how many records a merge consolidated.
pub const CONSOLIDATED_COUNT_KEY: &str = "consolidated_count";

/// Metadata key recording when the merge was synthesized.
pub const CONSOLIDATED_DATE_KEY: &str = "consolidated_date";

const ADDITIONAL_HEADER: &str = "\n\nAdditional information: ";

/// Build the consolidated content for `members` (in member order).
pub fn synthesize_content(members: &[Record]) -> String {
    let Some(base_idx) = longest_index(members) else {
        return String::new();
    };

    let mut merged = members[base_idx].content.clone();
    let mut additions: Vec<&str> = Vec::new();

    for (idx, member) in members.iter().enumerate() {
        if idx == base_idx {
            continue;
        }
        for segment in member.content.split(SEGMENT_SEPARATOR) {
            if segment.is_empty() {
                continue;
            }
            if !merged.contains(segment) && !additions.iter().any(|a| a.contains(segment)) {
                additions.push(segment);
            }
        }
    }

    if !additions.is_empty() {
        merged.push_str(ADDITIONAL_HEADER);
        merged.push_str(&additions.join(SEGMENT_SEPARATOR));
    }
    merged
}

/// Union of all members' metadata plus the consolidation keys.
pub fn merge_metadata(members: &[Record], consolidated_at: DateTime<Utc>) -> BTreeMap<String, String> {
    let mut values: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for member in members {
        for (key, value) in &member.metadata {
            let seen = values.entry(key.clone()).or_default();
            if !seen.contains(&value.as_str()) {
                seen.push(value);
            }
        }
    }

    let mut merged: BTreeMap<String, String> = values
        .into_iter()
        .map(|(key, vals)| (key, vals.join(", ")))
        .collect();
    merged.insert(CONSOLIDATED_COUNT_KEY.to_string(), members.len().to_string());
    merged.insert(
        CONSOLIDATED_DATE_KEY.to_string(),
        consolidated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    merged
}

fn longest_index(members: &[Record]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, member) in members.iter().enumerate() {
        let len = member.content.chars().count();
        match best {
            Some((_, best_len)) if best_len >= len => {}
            _ => best = Some((idx, len)),
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(id: &str, content: &str, meta: &[(&str, &str)]) -> Record {
        Record {
            id: id.into(),
            content: content.into(),
            embedding: vec![1.0, 0.0, 0.0],
            metadata: meta
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            timestamp: Utc::now(),
            content_hash: id.into(),
        }
    }

    #[test]
    fn each_segment_appears_once() {
        let members = vec![
            rec("1", "A. B.", &[]),
            rec("2", "B. C.", &[]),
            rec("3", "A. C.", &[]),
        ];
        let merged = synthesize_content(&members);
        assert!(merged.starts_with("A. B."));
        assert_eq!(merged.matches("A.").count(), 1);
        assert_eq!(merged.matches("B.").count(), 1);
        assert_eq!(merged.matches("C.").count(), 1);
        assert!(merged.contains("Additional information: C."));
    }

    #[test]
    fn longest_content_is_base_first_wins_ties() {
        let members = vec![
            rec("1", "short", &[]),
            rec("2", "the longest one", &[]),
            rec("3", "also long, same", &[]),
        ];
        let merged = synthesize_content(&members);
        assert!(merged.starts_with("the longest one"));
    }

    #[test]
    fn nothing_new_returns_base_unchanged() {
        let members = vec![
            rec("1", "User prefers Python. Works on data science", &[]),
            rec("2", "User prefers Python", &[]),
        ];
        assert_eq!(
            synthesize_content(&members),
            "User prefers Python. Works on data science"
        );
    }

    #[test]
    fn empty_cluster_synthesizes_nothing() {
        assert_eq!(synthesize_content(&[]), "");
    }

    #[test]
    fn metadata_union_joins_distinct_values_in_order() {
        let members = vec![
            rec("1", "a", &[("category", "programming"), ("lang", "python")]),
            rec("2", "b", &[("category", "tools")]),
            rec("3", "c", &[("category", "programming"), ("source", "chat")]),
        ];
        let at = Utc.with_ymd_and_hms(2025, 6, 11, 8, 0, 0).unwrap();
        let merged = merge_metadata(&members, at);
        assert_eq!(merged["category"], "programming, tools");
        assert_eq!(merged["lang"], "python");
        assert_eq!(merged["source"], "chat");
        assert_eq!(merged[CONSOLIDATED_COUNT_KEY], "3");
        assert_eq!(merged[CONSOLIDATED_DATE_KEY], "2025-06-11T08:00:00Z");
    }
}
