//! Reflections (§3, §4.4 step 6): lessons distilled from failure episodes,
//! retrievable by semantic similarity.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::scoring::cosine_similarity;
use crate::store::StoreAdapter;
use crate::types::Reflection;

const REFLECTION_PREFIX: &str = "reflection:";
/// Maximum length a prevention plan is truncated to before storage.
pub const PREVENTION_PLAN_MAX_LEN: usize = 500;

fn reflection_key(id: &str) -> String {
    format!("{REFLECTION_PREFIX}{id}")
}

/// Derive a stable reflection id from `sha256(context ∥ error ∥ now)`,
/// truncated to 16 hex characters.
#[must_use]
pub fn generate_reflection_id(context: &str, error_or_outcome: &str, now: chrono::DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.as_bytes());
    hasher.update(error_or_outcome.as_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes.iter().take(len.div_ceil(2)).map(|b| format!("{b:02x}")).collect::<String>()[..len].to_string()
}

/// Phrases that mark an episode's content as describing a failure (§4.4
/// step 6).
pub const FAILURE_INDICATORS: &[&str] = &["error", "exception", "failed", "failure", "traceback", "stack trace"];

/// Whether `content` describes a failure, case-insensitively.
#[must_use]
pub fn is_failure_content(content: &str) -> bool {
    let lowered = content.to_lowercase();
    FAILURE_INDICATORS.iter().any(|indicator| lowered.contains(indicator))
}

/// Store of [`Reflection`]s, queried by semantic similarity.
pub struct ReflectionStore {
    store: Arc<dyn StoreAdapter>,
}

impl ReflectionStore {
    /// Build a reflection store over the given store adapter.
    #[must_use]
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store }
    }

    /// Persist a reflection, truncating its prevention plan to
    /// [`PREVENTION_PLAN_MAX_LEN`] characters.
    pub async fn put(&self, mut reflection: Reflection) -> Result<()> {
        if reflection.prevention_plan.chars().count() > PREVENTION_PLAN_MAX_LEN {
            reflection.prevention_plan = reflection
                .prevention_plan
                .chars()
                .take(PREVENTION_PLAN_MAX_LEN)
                .collect();
        }
        let bytes = serde_json::to_vec(&reflection).map_err(|source| Error::Serialization {
            key: reflection.reflection_id.clone(),
            source,
        })?;
        self.store.set(&reflection_key(&reflection.reflection_id), bytes, None).await
    }

    /// Fetch a reflection by id.
    pub async fn get(&self, id: &str) -> Result<Option<Reflection>> {
        let Some(bytes) = self.store.get(&reflection_key(id)).await? else {
            return Ok(None);
        };
        let reflection: Reflection = serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
            key: id.to_string(),
            source,
        })?;
        Ok(Some(reflection))
    }

    /// Return the `limit` reflections most semantically relevant to
    /// `query_embedding`, bumping each returned reflection's
    /// `times_referenced`.
    pub async fn relevant_reflections(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(Reflection, f64)>> {
        let keys = self.store.keys(&format!("{REFLECTION_PREFIX}*")).await?;
        let mut scored = Vec::new();
        for key in keys {
            let Some(bytes) = self.store.get(&key).await? else { continue };
            let reflection: Reflection = serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
                key: key.clone(),
                source,
            })?;
            let Some(embedding) = &reflection.embedding else { continue };
            let similarity = cosine_similarity(query_embedding, embedding)?;
            scored.push((reflection, similarity));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        for (reflection, _) in &mut scored {
            reflection.times_referenced += 1;
            self.put(reflection.clone()).await?;
        }
        Ok(scored)
    }
}
