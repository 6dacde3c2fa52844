//! The external LLM dependency contract (§6.4). Embedding generation and
//! insight extraction are modeled only as an opaque trait with a stated
//! input/output contract — the actual model client lives outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An entity candidate extracted from a cluster of episodes (§4.4 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    /// Candidate node name.
    pub name: String,
    /// Candidate node type, as a string (mapped to [`crate::types::NodeType`]
    /// by the caller; unrecognized values are dropped).
    pub node_type: String,
    /// Candidate description.
    pub description: String,
    /// Candidate importance in `[0, 1]`.
    #[serde(default)]
    pub importance: f64,
}

/// A relation candidate extracted from a cluster of episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    /// Source node name.
    pub source_name: String,
    /// Relation type/label.
    pub relation_type: String,
    /// Target node name.
    pub target_name: String,
    /// Candidate strength in `[0, 1]`.
    #[serde(default = "default_strength")]
    pub strength: f64,
}

fn default_strength() -> f64 {
    0.5
}

/// The structured document an insight-extraction call is expected to
/// produce (§4.4 step 4, §6.4). Parse failures yield an empty extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightExtraction {
    /// Candidate semantic nodes.
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    /// Candidate relations between those nodes.
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

/// The structured document a reflection-generation call is expected to
/// produce (§4.4 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionDraft {
    /// Summary of the failure's context.
    pub context_summary: String,
    /// What went wrong, as best understood.
    pub root_cause: String,
    /// The distilled lesson.
    pub insight: String,
    /// A concrete plan to prevent recurrence.
    pub prevention_plan: String,
}

/// The two operations the consolidator depends on, both backed by an
/// external language model (§6.4). Out of scope: the client's prompts,
/// model selection, and transport — this trait is the whole contract.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Free-form text generation, used for insight extraction and
    /// reflection drafting.
    async fn generate(&self, prompt: &str, temperature: f32, max_tokens: u32) -> anyhow::Result<String>;

    /// Embed `text` into a fixed-dimension vector. Dimension is constant for
    /// a given deployment (typically 384 or 1536).
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Parse a `generate()` response expected to contain an [`InsightExtraction`]
/// document. Per §6.4, malformed output yields an empty extraction rather
/// than an error, with the failure logged by the caller.
#[must_use]
pub fn parse_insight_extraction(raw: &str) -> InsightExtraction {
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::warn!(?err, "failed to parse insight extraction, yielding empty result");
        InsightExtraction::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_extraction_yields_empty_result() {
        let extraction = parse_insight_extraction("not json");
        assert!(extraction.entities.is_empty());
        assert!(extraction.relations.is_empty());
    }

    #[test]
    fn well_formed_extraction_parses() {
        let raw = r#"{"entities":[{"name":"svc_a","node_type":"service","description":"d","importance":0.5}],"relations":[]}"#;
        let extraction = parse_insight_extraction(raw);
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].name, "svc_a");
    }
}
