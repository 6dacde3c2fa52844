//! Utility scoring & pruning (§4.7): procedural memory patterns are kept
//! alive by usage, success, and recency, and archived once they stop
//! earning their keep.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::store::StoreAdapter;
use crate::types::Pattern;

const PATTERN_PREFIX: &str = "pattern:";

/// Default ceiling for `times_used` normalization.
pub const MAX_TIMES_FOR_UTILITY: f64 = 100.0;
/// Default recency decay rate, per day since last use.
pub const PATTERN_DECAY_RATE: f64 = 0.01;
/// Default utility threshold below which a pattern is archived.
pub const UTILITY_THRESHOLD: f64 = 0.3;

fn pattern_key(id: &str) -> String {
    format!("{PATTERN_PREFIX}{id}")
}

/// Compute `U = 0.4*min(times_used/max_times, 1) + 0.3*success_rate +
/// 0.3*exp(-mu*days_since_last_used)` (§4.7).
#[must_use]
pub fn calculate_utility_score(pattern: &Pattern, now: chrono::DateTime<Utc>) -> f64 {
    let usage = (pattern.times_used as f64 / MAX_TIMES_FOR_UTILITY).min(1.0);
    let days_since_last_used = (now - pattern.last_used).num_milliseconds() as f64 / 86_400_000.0;
    let recency = (-PATTERN_DECAY_RATE * days_since_last_used.max(0.0)).exp();
    0.4 * usage + 0.3 * pattern.success_rate + 0.3 * recency
}

/// Store of [`Pattern`]s with utility-driven pruning.
pub struct PatternStore {
    store: Arc<dyn StoreAdapter>,
}

impl PatternStore {
    /// Build a pattern store over the given store adapter.
    #[must_use]
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store }
    }

    /// Persist a pattern, recomputing its cached utility score.
    pub async fn put(&self, mut pattern: Pattern) -> Result<()> {
        pattern.utility_score = calculate_utility_score(&pattern, Utc::now());
        let bytes = serde_json::to_vec(&pattern).map_err(|source| Error::Serialization {
            key: pattern.pattern_id.clone(),
            source,
        })?;
        self.store.set(&pattern_key(&pattern.pattern_id), bytes, None).await
    }

    /// Fetch a pattern by id.
    pub async fn get(&self, id: &str) -> Result<Option<Pattern>> {
        let Some(bytes) = self.store.get(&pattern_key(id)).await? else {
            return Ok(None);
        };
        let pattern: Pattern = serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
            key: id.to_string(),
            source,
        })?;
        Ok(Some(pattern))
    }

    async fn all(&self) -> Result<Vec<Pattern>> {
        let keys = self.store.keys(&format!("{PATTERN_PREFIX}*")).await?;
        let mut patterns = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                let pattern: Pattern = serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
                    key: key.clone(),
                    source,
                })?;
                patterns.push(pattern);
            }
        }
        Ok(patterns)
    }

    /// Archive (flag + timestamp, never delete) every non-archived pattern
    /// whose utility falls below `threshold`. Returns the archived ids.
    pub async fn prune_patterns(&self, threshold: f64) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut archived_ids = Vec::new();
        for mut pattern in self.all().await? {
            if pattern.archived {
                continue;
            }
            let utility = calculate_utility_score(&pattern, now);
            if utility < threshold {
                pattern.archived = true;
                pattern.archived_at = Some(now);
                pattern.utility_score = utility;
                archived_ids.push(pattern.pattern_id.clone());
                self.put(pattern).await?;
            }
        }
        Ok(archived_ids)
    }
}
