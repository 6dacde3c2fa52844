//! Memory Graph (§4.3): a temporal knowledge graph of [`SemanticNode`]s and
//! bi-temporal [`Relation`]s, queried by a weighted retrieval score.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::scoring::{cosine_similarity, recency_score, retrieval_score};
use crate::store::StoreAdapter;
use crate::types::{NodeType, Relation, SemanticNode};

const NODE_PREFIX: &str = "graph:node:";
const RELATION_PREFIX: &str = "graph:rel:";

fn node_key(name: &str) -> String {
    format!("{NODE_PREFIX}{name}")
}

fn relation_key(source: &str, relation_type: &str, target: &str, valid_from_nanos: i64) -> String {
    format!("{RELATION_PREFIX}{source}|{relation_type}|{target}|{valid_from_nanos}")
}

fn relation_scan_prefix(source: &str, relation_type: &str, target: &str) -> String {
    format!("{RELATION_PREFIX}{source}|{relation_type}|{target}|*")
}

/// Outcome of [`MemoryGraph::upsert_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No node with this name existed.
    Created,
    /// An existing node was merged with the new contribution.
    Updated,
}

/// One hop discovered by [`MemoryGraph::traverse`].
#[derive(Debug, Clone)]
pub struct TraversalHop {
    /// The relation traversed.
    pub relation: Relation,
    /// How many hops from the origin entity this relation was found at.
    pub depth: u32,
}

/// Temporal knowledge graph over which agents retrieve context (§4.3).
pub struct MemoryGraph {
    store: Arc<dyn StoreAdapter>,
}

impl MemoryGraph {
    /// Build a memory graph over the given store adapter.
    #[must_use]
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store }
    }

    async fn get_node_raw(&self, name: &str) -> Result<Option<SemanticNode>> {
        let Some(bytes) = self.store.get(&node_key(name)).await? else {
            return Ok(None);
        };
        let node: SemanticNode = serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
            key: name.to_string(),
            source,
        })?;
        Ok(Some(node))
    }

    async fn put_node(&self, node: &SemanticNode) -> Result<()> {
        let bytes = serde_json::to_vec(node).map_err(|source| Error::Serialization {
            key: node.name.clone(),
            source,
        })?;
        self.store.set(&node_key(&node.name), bytes, None).await
    }

    /// Create or merge a [`SemanticNode`] (§4.3). Update merges `sources` by
    /// set union, takes `max(importance)`, overwrites `description`, and
    /// bumps `last_updated`.
    pub async fn upsert_node(&self, mut node: SemanticNode) -> Result<UpsertOutcome> {
        match self.get_node_raw(&node.name).await? {
            None => {
                self.put_node(&node).await?;
                Ok(UpsertOutcome::Created)
            }
            Some(existing) => {
                node.sources.extend(existing.sources);
                node.importance = node.importance.max(existing.importance);
                node.created_at = existing.created_at;
                node.last_updated = Utc::now();
                node.access_count = existing.access_count;
                node.last_accessed = existing.last_accessed;
                self.put_node(&node).await?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    /// Mark a node invalid as of now.
    pub async fn invalidate_node(&self, name: &str) -> Result<bool> {
        let Some(mut node) = self.get_node_raw(name).await? else {
            return Ok(false);
        };
        node.valid_until = Some(Utc::now());
        self.put_node(&node).await?;
        Ok(true)
    }

    /// Read a node, updating `last_accessed`/`access_count` atomically with
    /// the read (§4.3).
    pub async fn get_node(&self, name: &str) -> Result<Option<SemanticNode>> {
        let Some(mut node) = self.get_node_raw(name).await? else {
            return Ok(None);
        };
        node.last_accessed = Some(Utc::now());
        node.access_count += 1;
        self.put_node(&node).await?;
        Ok(Some(node))
    }

    async fn active_relation(
        &self,
        source: &str,
        relation_type: &str,
        target: &str,
    ) -> Result<Option<(String, Relation)>> {
        let keys = self
            .store
            .keys(&relation_scan_prefix(source, relation_type, target))
            .await?;
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                let relation: Relation = serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
                    key: key.clone(),
                    source,
                })?;
                if relation.is_active() {
                    return Ok(Some((key, relation)));
                }
            }
        }
        Ok(None)
    }

    async fn put_relation(&self, relation: &Relation) -> Result<()> {
        let bytes = serde_json::to_vec(relation).map_err(|source| Error::Serialization {
            key: relation.source_name.clone(),
            source,
        })?;
        let key = relation_key(
            &relation.source_name,
            &relation.relation_type,
            &relation.target_name,
            relation.valid_from.timestamp_nanos_opt().unwrap_or_default(),
        );
        self.store.set(&key, bytes, None).await
    }

    /// Insert a relation under the supersession protocol (§4.3): if an
    /// active `(source, type, target)` triple exists, close it
    /// (`valid_until := now`) and insert the new record as the active one.
    pub async fn upsert_relation(&self, relation: Relation) -> Result<()> {
        if let Some((key, mut existing)) = self
            .active_relation(&relation.source_name, &relation.relation_type, &relation.target_name)
            .await?
        {
            existing.valid_until = Some(Utc::now());
            let bytes = serde_json::to_vec(&existing).map_err(|source| Error::Serialization {
                key: key.clone(),
                source,
            })?;
            self.store.set(&key, bytes, None).await?;
        }
        self.put_relation(&relation).await
    }

    /// Close the currently active `(source, type, target)` triple, if
    /// present.
    pub async fn invalidate_relation(&self, source: &str, relation_type: &str, target: &str) -> Result<bool> {
        let Some((key, mut existing)) = self.active_relation(source, relation_type, target).await? else {
            return Ok(false);
        };
        existing.valid_until = Some(Utc::now());
        let bytes = serde_json::to_vec(&existing).map_err(|source| Error::Serialization {
            key: key.clone(),
            source,
        })?;
        self.store.set(&key, bytes, None).await?;
        Ok(true)
    }

    async fn all_relations(&self) -> Result<Vec<Relation>> {
        let keys = self.store.keys(&format!("{RELATION_PREFIX}*")).await?;
        let mut relations = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                let relation: Relation = serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
                    key: key.clone(),
                    source,
                })?;
                relations.push(relation);
            }
        }
        Ok(relations)
    }

    /// Breadth-first traversal over active relations in either direction,
    /// up to `depth` hops (1..=3), de-duplicated by `(source, type,
    /// target)`.
    pub async fn traverse(&self, entity_name: &str, depth: u32) -> Result<Vec<TraversalHop>> {
        let depth = depth.clamp(1, 3);
        let relations: Vec<Relation> = self.all_relations().await?.into_iter().filter(Relation::is_active).collect();

        let mut visited: HashSet<(String, String, String)> = HashSet::new();
        let mut frontier: VecDeque<(String, u32)> = VecDeque::new();
        frontier.push_back((entity_name.to_string(), 0));
        let mut hops = Vec::new();
        let mut seen_nodes = HashSet::new();
        seen_nodes.insert(entity_name.to_string());

        while let Some((node, hop_depth)) = frontier.pop_front() {
            if hop_depth >= depth {
                continue;
            }
            for relation in &relations {
                let touches = relation.source_name == node || relation.target_name == node;
                if !touches {
                    continue;
                }
                let triple = (
                    relation.source_name.clone(),
                    relation.relation_type.clone(),
                    relation.target_name.clone(),
                );
                if visited.contains(&triple) {
                    continue;
                }
                visited.insert(triple);
                hops.push(TraversalHop {
                    relation: relation.clone(),
                    depth: hop_depth + 1,
                });
                let neighbor = if relation.source_name == node {
                    &relation.target_name
                } else {
                    &relation.source_name
                };
                if seen_nodes.insert(neighbor.clone()) {
                    frontier.push_back((neighbor.clone(), hop_depth + 1));
                }
            }
        }
        Ok(hops)
    }

    /// Vector-nearest search over all nodes (optionally filtered to
    /// `node_type`), scored by [`retrieval_score`], truncated to `limit`.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
        filter_type: Option<NodeType>,
    ) -> Result<Vec<(SemanticNode, f64)>> {
        let keys = self.store.keys(&format!("{NODE_PREFIX}*")).await?;
        let now = Utc::now();
        let mut scored = Vec::new();
        for key in keys {
            let Some(bytes) = self.store.get(&key).await? else { continue };
            let node: SemanticNode = serde_json::from_slice(&bytes).map_err(|source| Error::Serialization {
                key: key.clone(),
                source,
            })?;
            if node.valid_until.is_some() {
                continue;
            }
            if let Some(filter_type) = filter_type {
                if node.node_type != filter_type {
                    continue;
                }
            }
            let relevance = match &node.embedding {
                Some(embedding) => cosine_similarity(query_embedding, embedding)?,
                None => 0.0,
            };
            let recency = recency_score(node.last_accessed, now);
            let score = retrieval_score(relevance.max(0.0), node.importance, recency);
            scored.push((node, score));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Vector search restricted to `Pattern`-typed nodes sharing `context`'s
    /// semantic neighborhood.
    pub async fn get_similar_patterns(
        &self,
        context_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(SemanticNode, f64)>> {
        self.search(context_embedding, limit, Some(NodeType::Pattern)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStoreAdapter;
    use std::collections::HashSet as StdHashSet;

    fn node(name: &str, importance: f64, sources: &[&str]) -> SemanticNode {
        SemanticNode {
            name: name.to_string(),
            node_type: NodeType::Concept,
            description: "d".to_string(),
            importance,
            embedding: None,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            created_at: Utc::now(),
            last_updated: Utc::now(),
            last_accessed: None,
            access_count: 0,
            valid_from: None,
            valid_until: None,
            metadata: serde_json::Value::Null,
        }
    }

    fn relation(source: &str, rel_type: &str, target: &str, strength: f64) -> Relation {
        Relation {
            source_name: source.to_string(),
            relation_type: rel_type.to_string(),
            target_name: target.to_string(),
            strength,
            valid_from: Utc::now(),
            valid_until: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn upsert_node_merges_sources_and_max_importance() {
        let graph = MemoryGraph::new(Arc::new(InMemoryStoreAdapter::new()));
        assert_eq!(
            graph.upsert_node(node("n1", 0.4, &["e1"])).await.unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            graph.upsert_node(node("n1", 0.9, &["e2"])).await.unwrap(),
            UpsertOutcome::Updated
        );
        let stored = graph.get_node_raw("n1").await.unwrap().unwrap();
        assert_eq!(stored.sources, StdHashSet::from(["e1".to_string(), "e2".to_string()]));
        assert!((stored.importance - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn upsert_relation_supersedes_prior_active_triple() {
        let graph = MemoryGraph::new(Arc::new(InMemoryStoreAdapter::new()));
        graph
            .upsert_relation(relation("svc_a", "depends_on", "svc_b", 0.8))
            .await
            .unwrap();
        graph
            .upsert_relation(relation("svc_a", "depends_on", "svc_c", 0.9))
            .await
            .unwrap();

        let hops = graph.traverse("svc_a", 1).await.unwrap();
        assert_eq!(hops.len(), 2);

        assert!(graph
            .invalidate_relation("svc_a", "depends_on", "svc_b")
            .await
            .unwrap());

        let hops = graph.traverse("svc_a", 1).await.unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].relation.target_name, "svc_c");
    }

    #[tokio::test]
    async fn search_filters_by_node_type() {
        let graph = MemoryGraph::new(Arc::new(InMemoryStoreAdapter::new()));
        let mut file_node = node("f1", 0.5, &[]);
        file_node.node_type = NodeType::File;
        graph.upsert_node(file_node).await.unwrap();
        let mut pattern_node = node("p1", 0.5, &[]);
        pattern_node.node_type = NodeType::Pattern;
        graph.upsert_node(pattern_node).await.unwrap();

        let results = graph.search(&[], 10, Some(NodeType::Pattern)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.name, "p1");
    }
}
