/// Vector similarity and candidate ranking.
///
/// Cosine similarity is accumulated in `f64` so results are stable across runs. A vector
/// with zero norm is similar to nothing (score 0) instead of producing NaN.
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CommonError;

/// An embedding of one article or product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub owner_id: String,
    pub values: Vec<f32>,
}

impl EmbeddingVector {
    pub fn new(owner_id: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            owner_id: owner_id.into(),
            values,
        }
    }
}

/// Cosine similarity in [-1, 1]. Zero-norm vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, CommonError> {
    if a.len() != b.len() {
        return Err(CommonError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ranked<'a> {
    pub target: &'a EmbeddingVector,
    pub score: f64,
}

/// Rank `targets` by cosine similarity to `source`.
///
/// The source itself is never returned. Targets whose dimension differs from the source
/// are skipped with a warning. Results are sorted by score descending, ties broken by
/// owner id ascending, and contain only scores `>= min_score`.
pub fn rank_candidates<'a>(
    source: &EmbeddingVector,
    targets: &'a [EmbeddingVector],
    min_score: f64,
    max_results: usize,
) -> Vec<Ranked<'a>> {
    let mut ranked: Vec<Ranked<'a>> = targets
        .iter()
        .filter(|target| target.owner_id != source.owner_id)
        .filter_map(|target| match cosine_similarity(&source.values, &target.values) {
            Ok(score) => Some(Ranked { target, score }),
            Err(e) => {
                warn!(source = %source.owner_id, target = %target.owner_id, error = %e, "skipping candidate");
                None
            }
        })
        .filter(|r| r.score >= min_score)
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.target.owner_id.cmp(&b.target.owner_id))
    });
    ranked.truncate(max_results);
    ranked
}

/// Embeddings keyed by owner id.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingIndex {
    vectors: BTreeMap<String, EmbeddingVector>,
}

impl EmbeddingIndex {
    pub fn insert(&mut self, vector: EmbeddingVector) {
        self.vectors.insert(vector.owner_id.clone(), vector);
    }

    pub fn get(&self, owner_id: &str) -> Result<&EmbeddingVector, CommonError> {
        self.vectors
            .get(owner_id)
            .ok_or_else(|| CommonError::NoEmbedding(owner_id.to_string()))
    }

    /// Vectors in owner id order.
    pub fn vectors(&self) -> Vec<EmbeddingVector> {
        self.vectors.values().cloned().collect()
    }
}

impl FromIterator<EmbeddingVector> for EmbeddingIndex {
    fn from_iter<I: IntoIterator<Item = EmbeddingVector>>(iter: I) -> Self {
        let mut index = Self::default();
        for vector in iter {
            index.insert(vector);
        }
        index
    }
}

/// Jaccard overlap of two label sets, compared case-insensitively. Two empty sets score 0.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<String> = a.iter().map(|s| s.to_lowercase()).collect();
    let b: HashSet<String> = b.iter().map(|s| s.to_lowercase()).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Weights of the combined article relatedness score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub cosine: f64,
    pub categories: f64,
    pub tags: f64,
    pub same_language: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cosine: 0.8,
            categories: 0.1,
            tags: 0.05,
            same_language: 0.05,
        }
    }
}

impl ScoreWeights {
    /// Weighted sum of the signals, capped at 1.
    pub fn combine(&self, cosine: f64, category_overlap: f64, tag_overlap: f64, same_language: bool) -> f64 {
        let language = if same_language { 1.0 } else { 0.0 };
        let score = self.cosine * cosine
            + self.categories * category_overlap
            + self.tags * tag_overlap
            + self.same_language * language;
        score.min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(id: &str, values: &[f32]) -> EmbeddingVector {
        EmbeddingVector::new(id, values.to_vec())
    }

    #[test]
    fn cosine_of_vector_with_itself_is_one() {
        let v = [0.3f32, -1.2, 4.5, 0.01];
        let score = cosine_similarity(&v, &v).unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_vector_scores_zero() {
        let score = cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let err = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, CommonError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn ranking_excludes_self_and_sorts_with_tiebreak() {
        let source = vector("a", &[1.0, 0.0]);
        let targets = vec![
            vector("a", &[1.0, 0.0]),
            vector("c", &[1.0, 1.0]),
            vector("b", &[1.0, 1.0]),
            vector("d", &[0.0, 1.0]),
            vector("e", &[1.0, 0.0, 0.0]),
        ];
        let ranked = rank_candidates(&source, &targets, 0.1, 10);
        let ids: Vec<&str> = ranked.iter().map(|r| r.target.owner_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let ranked = rank_candidates(&source, &targets, -1.0, 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].target.owner_id, "b");
    }

    #[test]
    fn missing_embedding_is_reported() {
        let index: EmbeddingIndex = vec![vector("1", &[1.0])].into_iter().collect();
        assert!(index.get("1").is_ok());
        assert!(matches!(index.get("2"), Err(CommonError::NoEmbedding(id)) if id == "2"));
    }

    #[test]
    fn jaccard_and_combined_score() {
        let a = vec!["Swing".to_string(), "Driver".to_string()];
        let b = vec!["swing".to_string(), "Putter".to_string()];
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(jaccard(&[], &[]), 0.0);

        let weights = ScoreWeights::default();
        let score = weights.combine(1.0, 1.0, 1.0, true);
        assert_eq!(score, 1.0);
        let score = weights.combine(0.5, 0.0, 0.0, false);
        assert!((score - 0.4).abs() < 1e-12);
    }
}
