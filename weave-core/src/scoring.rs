//! Retrieval scoring (§4.3): relevance (cosine similarity), importance, and
//! recency combined into a single ranking score.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Default weight on relevance in the retrieval score.
pub const WEIGHT_RELEVANCE: f64 = 0.5;
/// Default weight on importance in the retrieval score.
pub const WEIGHT_IMPORTANCE: f64 = 0.3;
/// Default weight on recency in the retrieval score.
pub const WEIGHT_RECENCY: f64 = 0.2;
/// Recency exponential decay rate, per hour elapsed.
pub const RECENCY_DECAY_RATE: f64 = 0.995;

/// Cosine similarity between two equal-length, non-zero vectors, in
/// `[-1, 1]`. Zero vectors yield `0.0`. Mismatched dimensions fail with
/// [`Error::DimensionMismatch`].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch { a: a.len(), b: b.len() });
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

/// Exponential recency decay `exp(-lambda * hours_elapsed)` relative to
/// `last_accessed` (or `1.0` if never accessed — treated as "now").
#[must_use]
pub fn recency_score(last_accessed: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(last_accessed) = last_accessed else {
        return 1.0;
    };
    let hours = (now - last_accessed).num_milliseconds() as f64 / 3_600_000.0;
    (-RECENCY_DECAY_RATE * hours.max(0.0)).exp()
}

/// Combine relevance, importance, and recency into the retrieval score
/// `S = w_rel*Relevance + w_imp*Importance + w_rec*Recency` (§4.3).
#[must_use]
pub fn retrieval_score(relevance: f64, importance: f64, recency: f64) -> f64 {
    WEIGHT_RELEVANCE * relevance + WEIGHT_IMPORTANCE * importance + WEIGHT_RECENCY * recency
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_opposite_vectors_is_negative_one() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let sim = cosine_similarity(&a, &b).unwrap();
        assert!((sim + 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 2.0];
        assert_eq!(cosine_similarity(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn cosine_rejects_dimension_mismatch() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 2.0, 3.0];
        assert!(matches!(cosine_similarity(&a, &b), Err(Error::DimensionMismatch { a: 2, b: 3 })));
    }

    #[test]
    fn recency_strictly_decreases_with_elapsed_time() {
        let now = Utc::now();
        let recent = recency_score(Some(now - ChronoDuration::hours(1)), now);
        let older = recency_score(Some(now - ChronoDuration::hours(10)), now);
        assert!(recent > older);
    }

    #[test]
    fn retrieval_score_strictly_decreases_as_recency_falls() {
        let high = retrieval_score(0.8, 0.5, 1.0);
        let low = retrieval_score(0.8, 0.5, 0.5);
        assert!(high > low);
    }
}
