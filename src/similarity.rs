//! Vector similarity and embedding encoding helpers.
//!
//! Pure functions shared by the clustering engine and the store adapters:
//! cosine similarity, mean pairwise similarity of a group, and the
//! little-endian `f32` BLOB encoding some stores use for embeddings.

use crate::models::Record;

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors, vectors of different lengths, and
/// zero-magnitude vectors. Never fails.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON || !denom.is_finite() {
        return 0.0;
    }

    dot / denom
}

/// Mean of the similarities of every unordered pair in `records`.
///
/// A single record (or none) is trivially self-similar and yields `1.0`.
/// The result is clamped to `[0, 1]`.
pub fn mean_pairwise_similarity(records: &[Record]) -> f32 {
    if records.len() < 2 {
        return 1.0;
    }

    let mut total = 0.0f64;
    let mut pairs = 0u64;
    for (i, a) in records.iter().enumerate() {
        for b in &records[i + 1..] {
            total += cosine_similarity(&a.embedding, &b.embedding) as f64;
            pairs += 1;
        }
    }

    ((total / pairs as f64) as f32).clamp(0.0, 1.0)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`]. Trailing bytes that do not
/// form a whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn rec(embedding: Vec<f32>) -> Record {
        Record {
            id: "r".into(),
            content: String::new(),
            embedding,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
            content_hash: String::new(),
        }
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_cosine_zero_magnitude() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn mean_pairwise_uses_every_pair() {
        // a~b = 1, a~c = 0, b~c = 0 -> mean 1/3
        let group = vec![
            rec(vec![1.0, 0.0]),
            rec(vec![1.0, 0.0]),
            rec(vec![0.0, 1.0]),
        ];
        let mean = mean_pairwise_similarity(&group);
        assert!((mean - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn mean_pairwise_clamps_negative() {
        let group = vec![rec(vec![1.0, 0.0]), rec(vec![-1.0, 0.0])];
        assert_eq!(mean_pairwise_similarity(&group), 0.0);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }
}
