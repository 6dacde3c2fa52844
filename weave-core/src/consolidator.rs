//! The Consolidator (§4.4): the periodic "sleep cycle" that turns raw
//! episodic records into semantic nodes/relations and into reflections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::episode::EpisodeLog;
use crate::error::{Error, Result};
use crate::graph::MemoryGraph;
use crate::importance::score_importance;
use crate::lock::ScopedLock;
use crate::llm::{parse_insight_extraction, LlmClient};
use crate::reflection::{generate_reflection_id, is_failure_content, ReflectionStore};
use crate::scoring::cosine_similarity;
use crate::store::StoreAdapter;
use crate::types::{ConsolidationReport, Episode, NodeType, Relation, SemanticNode};

/// Default cosine-similarity threshold for cluster membership.
pub const CLUSTERING_THRESHOLD: f64 = 0.75;
/// Default maximum cluster size.
pub const MAX_CLUSTER_SIZE: usize = 10;
/// Default minimum cluster size; smaller clusters are discarded unless the
/// seed qualifies for singleton-promotion.
pub const MIN_CLUSTER_SIZE: usize = 2;
/// Minimum seed importance for singleton-promotion of an undersized cluster.
pub const SINGLETON_PROMOTION_THRESHOLD: f64 = 0.7;

fn node_type_from_str(s: &str) -> Option<NodeType> {
    match s {
        "file" => Some(NodeType::File),
        "concept" => Some(NodeType::Concept),
        "error" => Some(NodeType::Error),
        "decision" => Some(NodeType::Decision),
        "pattern" => Some(NodeType::Pattern),
        "service" => Some(NodeType::Service),
        "user" => Some(NodeType::User),
        _ => None,
    }
}

/// Greedily cluster `episodes` by cosine similarity of their embeddings
/// (§4.4 step 3). Episodes without an embedding never join or seed a
/// cluster. Returns index-groups into `episodes`, already filtered by
/// `min_size`/singleton-promotion.
fn cluster_episodes(episodes: &[Episode]) -> Result<Vec<Vec<usize>>> {
    let mut clustered = vec![false; episodes.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for seed_idx in 0..episodes.len() {
        if clustered[seed_idx] {
            continue;
        }
        let Some(seed_embedding) = &episodes[seed_idx].embedding else {
            continue;
        };
        clustered[seed_idx] = true;
        let mut cluster = vec![seed_idx];

        for candidate_idx in (seed_idx + 1)..episodes.len() {
            if clustered[candidate_idx] || cluster.len() >= MAX_CLUSTER_SIZE {
                continue;
            }
            let Some(candidate_embedding) = &episodes[candidate_idx].embedding else {
                continue;
            };
            let similarity = cosine_similarity(seed_embedding, candidate_embedding)?;
            if similarity >= CLUSTERING_THRESHOLD {
                clustered[candidate_idx] = true;
                cluster.push(candidate_idx);
            }
        }

        let seed_importance = episodes[seed_idx].importance.unwrap_or(0.0);
        if cluster.len() >= MIN_CLUSTER_SIZE || seed_importance >= SINGLETON_PROMOTION_THRESHOLD {
            clusters.push(cluster);
        }
    }
    Ok(clusters)
}

/// Orchestrates the sleep cycle: fetch, score, cluster, extract, upsert,
/// reflect, archive (§4.4).
pub struct Consolidator {
    store: Arc<dyn StoreAdapter>,
    episodes: EpisodeLog,
    graph: MemoryGraph,
    reflections: ReflectionStore,
    llm: Arc<dyn LlmClient>,
}

impl Consolidator {
    /// Build a consolidator wired to the given store adapter and LLM client.
    #[must_use]
    pub fn new(store: Arc<dyn StoreAdapter>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            episodes: EpisodeLog::new(store.clone()),
            graph: MemoryGraph::new(store.clone()),
            reflections: ReflectionStore::new(store.clone()),
            llm,
            store,
        }
    }

    fn consolidation_lock_resource(run_id: &str) -> String {
        format!("consolidator:{run_id}")
    }

    /// Run one sleep cycle for `run_id`. Two concurrent calls for the same
    /// run id are serialized by a dedicated lock; the cycle is idempotent
    /// modulo ids — re-running on an already-drained run is a no-op.
    pub async fn consolidate(&self, run_id: &str) -> Result<ConsolidationReport> {
        let start = Instant::now();
        let resource = Self::consolidation_lock_resource(run_id);
        let guard = ScopedLock::acquire(self.store.clone(), &resource, 300_000, true, Duration::from_secs(60))
            .await?
            .ok_or_else(|| Error::ConsolidationError {
                run_id: run_id.to_string(),
                reason: "could not acquire consolidation lock".to_string(),
            })?;

        let report = self.run_cycle(run_id, start).await;

        match &report {
            Ok(_) => {
                guard.release().await.ok();
            }
            Err(err) => {
                warn!(run_id, ?err, "consolidation cycle aborted, active log left intact");
                guard.release().await.ok();
            }
        }
        report
    }

    async fn run_cycle(&self, run_id: &str, start: Instant) -> Result<ConsolidationReport> {
        // Step 1: fetch, already ordered by step_number ascending.
        let mut fetched = self.episodes.fetch_run(run_id).await?;
        if fetched.is_empty() {
            return Ok(ConsolidationReport {
                run_id: run_id.to_string(),
                duration_ms: start.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }

        // Step 2: score importance for any episode lacking one.
        for episode in &mut fetched {
            if episode.importance.is_none() {
                episode.importance = Some(score_importance(&episode.content));
                self.episodes.update(episode).await?;
            }
        }

        // Step 3: cluster by embedding similarity.
        let clusters = cluster_episodes(&fetched)?;
        info!(run_id, clusters = clusters.len(), episodes = fetched.len(), "clustered episodes");

        // Step 4 + 5: extract insights per cluster, then upsert under the
        // supersession protocol.
        let mut nodes_upserted = 0;
        let mut relations_upserted = 0;
        for cluster in &clusters {
            let cluster_episodes: Vec<&Episode> = cluster.iter().map(|&i| &fetched[i]).collect();
            let extraction = self.extract_insights(&cluster_episodes).await;

            let source_ids: std::collections::HashSet<String> =
                cluster_episodes.iter().map(|e| e.episode_id.clone()).collect();
            let now = Utc::now();

            for entity in extraction.entities {
                let Some(node_type) = node_type_from_str(&entity.node_type) else {
                    warn!(node_type = entity.node_type, "unrecognized node type, skipping entity");
                    continue;
                };
                let node = SemanticNode {
                    name: entity.name,
                    node_type,
                    description: entity.description,
                    importance: entity.importance,
                    embedding: None,
                    sources: source_ids.clone(),
                    created_at: now,
                    last_updated: now,
                    last_accessed: None,
                    access_count: 0,
                    valid_from: Some(now),
                    valid_until: None,
                    metadata: serde_json::Value::Null,
                };
                self.graph.upsert_node(node).await?;
                nodes_upserted += 1;
            }

            for relation in extraction.relations {
                self.graph
                    .upsert_relation(Relation {
                        source_name: relation.source_name,
                        relation_type: relation.relation_type,
                        target_name: relation.target_name,
                        strength: relation.strength,
                        valid_from: now,
                        valid_until: None,
                        metadata: serde_json::Value::Null,
                    })
                    .await?;
                relations_upserted += 1;
            }
        }

        // Step 6: generate reflections for failure episodes.
        let reflections_generated = self.generate_reflections(&fetched).await?;

        // Step 7: archive processed episodes (last step, so a failure above
        // leaves the active log intact).
        let episodes_archived = self.episodes.archive(&fetched).await?;

        Ok(ConsolidationReport {
            run_id: run_id.to_string(),
            episodes_processed: fetched.len(),
            clusters_formed: clusters.len(),
            nodes_upserted,
            relations_upserted,
            reflections_generated,
            episodes_archived,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn extract_insights(&self, cluster: &[&Episode]) -> crate::llm::InsightExtraction {
        let joined = cluster
            .iter()
            .map(|e| format!("[{}] {}", e.role, e.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Extract entities and relations as JSON {{entities, relations}} from this transcript:\n{joined}"
        );
        match self.llm.generate(&prompt, 0.0, 1024).await {
            Ok(raw) => parse_insight_extraction(&raw),
            Err(err) => {
                warn!(?err, "insight extraction call failed, yielding empty result");
                crate::llm::InsightExtraction::default()
            }
        }
    }

    async fn generate_reflections(&self, episodes: &[Episode]) -> Result<usize> {
        let mut generated = 0;
        for episode in episodes {
            if !is_failure_content(&episode.content) {
                continue;
            }
            let prompt = format!(
                "An agent step failed. Produce JSON {{context_summary, root_cause, insight, prevention_plan}} for:\n{}",
                episode.content
            );
            let draft = match self.llm.generate(&prompt, 0.0, 512).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(?err, episode_id = episode.episode_id, "reflection generation call failed");
                    continue;
                }
            };
            let Ok(draft) = serde_json::from_str::<crate::llm::ReflectionDraft>(&draft) else {
                warn!(episode_id = episode.episode_id, "malformed reflection draft, skipping");
                continue;
            };
            let now = Utc::now();
            let reflection_id = generate_reflection_id(&draft.context_summary, &draft.root_cause, now);
            let embedding = self.llm.embed(&draft.insight).await.ok();
            self.reflections
                .put(crate::types::Reflection {
                    reflection_id,
                    context: draft.context_summary,
                    error_or_outcome: draft.root_cause,
                    insight: draft.insight,
                    prevention_plan: draft.prevention_plan,
                    created_at: now,
                    embedding,
                    times_referenced: 0,
                    success_rate: 0.0,
                })
                .await?;
            generated += 1;
        }
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::EpisodeLog as TestEpisodeLog;
    use crate::store::InMemoryStoreAdapter;
    use async_trait::async_trait;

    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn generate(&self, _prompt: &str, _temperature: f32, _max_tokens: u32) -> anyhow::Result<String> {
            Ok(r#"{"entities":[],"relations":[]}"#.to_string())
        }

        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.1, 0.2, 0.3])
        }
    }

    #[test]
    fn cluster_forms_on_similar_embeddings_and_drops_dissimilar_singleton() {
        let episodes = vec![
            episode_with_embedding(0, vec![1.0, 0.0], None),
            episode_with_embedding(1, vec![0.99, 0.01], None),
            episode_with_embedding(2, vec![0.0, 1.0], None),
        ];
        let clusters = cluster_episodes(&episodes).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn important_singleton_is_promoted() {
        let episodes = vec![
            episode_with_embedding(0, vec![1.0, 0.0], Some(0.9)),
            episode_with_embedding(1, vec![0.0, 1.0], None),
        ];
        let clusters = cluster_episodes(&episodes).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0], vec![0]);
    }

    fn episode_with_embedding(step: i64, embedding: Vec<f32>, importance: Option<f64>) -> Episode {
        Episode {
            episode_id: format!("e{step}"),
            run_id: "r1".to_string(),
            step_number: step,
            role: "executor".to_string(),
            content: "did something".to_string(),
            embedding: Some(embedding),
            created_at: Utc::now(),
            importance,
            last_accessed: None,
        }
    }

    #[tokio::test]
    async fn consolidate_empty_run_is_a_no_op() {
        let store = Arc::new(InMemoryStoreAdapter::new());
        let consolidator = Consolidator::new(store, Arc::new(StubLlm));
        let report = consolidator.consolidate("unknown-run").await.unwrap();
        assert_eq!(report.episodes_processed, 0);
    }

    #[tokio::test]
    async fn consolidate_archives_episodes_and_is_idempotent() {
        let store = Arc::new(InMemoryStoreAdapter::new());
        let log = TestEpisodeLog::new(store.clone());
        log.record_episode("r1", 0, "planner", "starting run", Some(vec![1.0, 0.0]))
            .await
            .unwrap();
        log.record_episode("r1", 1, "executor", "step one done", Some(vec![0.99, 0.01]))
            .await
            .unwrap();

        let consolidator = Consolidator::new(store, Arc::new(StubLlm));
        let first = consolidator.consolidate("r1").await.unwrap();
        assert_eq!(first.episodes_processed, 2);
        assert_eq!(first.episodes_archived, 2);

        let second = consolidator.consolidate("r1").await.unwrap();
        assert_eq!(second.episodes_processed, 0);
    }
}
