//! Episode Log (§4.4): an append-only short-term record of agent steps per
//! pipeline run, consumed and archived by the [`crate::consolidator`].

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::StoreAdapter;
use crate::types::Episode;

fn episode_key(run_id: &str, step_number: i64, episode_id: &str) -> String {
    // Zero-padded step number keeps lexicographic and numeric order aligned
    // so `keys()` + sort-by-string is enough to recover step ascending order.
    format!("episode:{run_id}:{step_number:010}:{episode_id}")
}

fn episode_prefix(run_id: &str) -> String {
    format!("episode:{run_id}:*")
}

fn archive_key(run_id: &str, step_number: i64, episode_id: &str) -> String {
    format!("episode_archive:{run_id}:{step_number:010}:{episode_id}")
}

/// Append-only store of [`Episode`] records, scoped per pipeline run.
pub struct EpisodeLog {
    store: Arc<dyn StoreAdapter>,
}

impl EpisodeLog {
    /// Build an episode log over the given store adapter.
    #[must_use]
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store }
    }

    /// Record one agent step. Returns the generated episode id.
    pub async fn record_episode(
        &self,
        run_id: &str,
        step_number: i64,
        role: &str,
        content: &str,
        embedding: Option<Vec<f32>>,
    ) -> Result<String> {
        let episode_id = Uuid::new_v4().to_string();
        let episode = Episode {
            episode_id: episode_id.clone(),
            run_id: run_id.to_string(),
            step_number,
            role: role.to_string(),
            content: content.to_string(),
            embedding,
            created_at: Utc::now(),
            importance: None,
            last_accessed: None,
        };
        self.put(&episode).await?;
        Ok(episode_id)
    }

    async fn put(&self, episode: &Episode) -> Result<()> {
        let bytes = serde_json::to_vec(episode).map_err(|source| Error::Serialization {
            key: episode.episode_id.clone(),
            source,
        })?;
        let key = episode_key(&episode.run_id, episode.step_number, &episode.episode_id);
        self.store.set(&key, bytes, None).await
    }

    /// Persist an episode that was mutated in place (e.g. to set a computed
    /// importance score).
    pub async fn update(&self, episode: &Episode) -> Result<()> {
        self.put(episode).await
    }

    /// Fetch every active (not yet archived) episode for `run_id`, ordered
    /// by `step_number` ascending.
    pub async fn fetch_run(&self, run_id: &str) -> Result<Vec<Episode>> {
        let mut keys = self.store.keys(&episode_prefix(run_id)).await?;
        keys.sort();
        let mut episodes = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                let episode: Episode =
                    serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
                        key: key.clone(),
                        source,
                    })?;
                episodes.push(episode);
            }
        }
        episodes.sort_by_key(|e| e.step_number);
        Ok(episodes)
    }

    /// Move `episodes` to the archive namespace and remove them from the
    /// active log. Called by the consolidator as the last step of a sleep
    /// cycle so a failure earlier in the cycle leaves the active log intact.
    pub async fn archive(&self, episodes: &[Episode]) -> Result<usize> {
        let mut archived = 0;
        for episode in episodes {
            let bytes = serde_json::to_vec(episode).map_err(|source| Error::Serialization {
                key: episode.episode_id.clone(),
                source,
            })?;
            let dest = archive_key(&episode.run_id, episode.step_number, &episode.episode_id);
            self.store.set(&dest, bytes, None).await?;
            let src = episode_key(&episode.run_id, episode.step_number, &episode.episode_id);
            if self.store.del(&src).await? {
                archived += 1;
            }
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStoreAdapter;

    #[tokio::test]
    async fn record_and_fetch_preserves_step_order() {
        let log = EpisodeLog::new(Arc::new(InMemoryStoreAdapter::new()));
        log.record_episode("r1", 2, "executor", "did step 2", None).await.unwrap();
        log.record_episode("r1", 0, "planner", "did step 0", None).await.unwrap();
        log.record_episode("r1", 1, "executor", "did step 1", None).await.unwrap();

        let episodes = log.fetch_run("r1").await.unwrap();
        let steps: Vec<i64> = episodes.iter().map(|e| e.step_number).collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn archive_removes_from_active_log() {
        let log = EpisodeLog::new(Arc::new(InMemoryStoreAdapter::new()));
        log.record_episode("r1", 0, "planner", "hello", None).await.unwrap();
        let episodes = log.fetch_run("r1").await.unwrap();

        let archived = log.archive(&episodes).await.unwrap();
        assert_eq!(archived, 1);
        assert!(log.fetch_run("r1").await.unwrap().is_empty());
    }
}
