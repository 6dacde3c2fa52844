//! Wire types shared by the Blackboard, Memory Graph, and Episode Log (§3, §6).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of artifact kinds the Blackboard accepts (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// A plan produced by a planning agent.
    Plan,
    /// Source code produced or modified by an agent.
    Code,
    /// The result of running a test suite.
    TestResult,
    /// A reviewer's assessment of an artifact.
    Review,
    /// A recorded error condition.
    Error,
    /// Free-form contextual information.
    Context,
    /// Bookkeeping metadata about a run or step.
    Metadata,
    /// A decision record.
    Decision,
}

/// The artifact envelope stored under `bb:artifact:<key>` (§6.2).
///
/// Invariant: an artifact is either absent or fully present and parseable —
/// partial writes are never observable by readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact kind.
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Arbitrary structured payload.
    pub data: serde_json::Value,
    /// Unix seconds (with fractional component) of the write that produced
    /// this envelope.
    pub timestamp: f64,
    /// Monotonic version, currently always 1 (reserved for future optimistic
    /// concurrency).
    pub version: u64,
}

/// The action recorded by an [`Event`] or audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// An artifact was written (created or overwritten).
    Write,
    /// An artifact was deleted.
    Delete,
}

/// A change notification published on `bb:events` (§6.3) and recorded to
/// the audit stream in the same logical operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Key that changed.
    pub key: String,
    /// What happened to it.
    pub action: Action,
    /// Unix seconds (with fractional component) of the mutation.
    pub timestamp: f64,
    /// The artifact's type, when the action is `write`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<ArtifactType>,
}

/// State tracked per pipeline run (§3, `bb:pipeline:<run_id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Current step index.
    pub step: i64,
    /// Free-form status string.
    pub status: String,
    /// When this record was last updated.
    pub updated_at: DateTime<Utc>,
    /// Optional arbitrary associated data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Retention window for pipeline state after its last update (§3).
pub const PIPELINE_STATE_RETENTION_SECS: i64 = 24 * 60 * 60;

/// An entry in the capped `bb:audit` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Store-assigned stream entry id.
    pub id: String,
    /// Key that changed.
    pub key: String,
    /// What happened to it.
    pub action: Action,
    /// Unix seconds (with fractional component) of the mutation.
    pub timestamp: f64,
}

/// Node kinds in the memory graph (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// A source file.
    File,
    /// An abstract concept.
    Concept,
    /// A recurring error condition.
    Error,
    /// A recorded decision.
    Decision,
    /// A recurring pattern.
    Pattern,
    /// An external service.
    Service,
    /// A human user.
    User,
}

/// A unit of distilled knowledge in the memory graph (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticNode {
    /// Primary identity; unique across the graph.
    pub name: String,
    /// Node kind.
    pub node_type: NodeType,
    /// Free-form description, overwritten on every upsert.
    pub description: String,
    /// Running maximum over all contributing upserts, in `[0, 1]`.
    pub importance: f64,
    /// Embedding used for similarity scoring, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Union of every episode id that contributed to this node.
    pub sources: HashSet<String>,
    /// When the node was first created.
    pub created_at: DateTime<Utc>,
    /// When the node was last touched by an upsert.
    pub last_updated: DateTime<Utc>,
    /// When this node was last read, for recency scoring.
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    /// Number of times this node has been read.
    #[serde(default)]
    pub access_count: u64,
    /// When the node became valid, if bi-temporally tracked.
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    /// When the node was invalidated, if ever.
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    /// Arbitrary extra metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A directed, bi-temporal edge between two named nodes (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    /// Source node name.
    pub source_name: String,
    /// Relation type/label.
    pub relation_type: String,
    /// Target node name.
    pub target_name: String,
    /// Strength of the relation, in `[0, 1]`.
    pub strength: f64,
    /// When the relation became valid.
    pub valid_from: DateTime<Utc>,
    /// When the relation was superseded or invalidated, if ever. Unset means
    /// the relation is active.
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    /// Arbitrary extra metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Relation {
    /// Whether this relation is currently active (not superseded).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.valid_until.is_none()
    }
}

/// One agent step's raw record within a pipeline run (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Unique episode id.
    pub episode_id: String,
    /// Pipeline run this episode belongs to.
    pub run_id: String,
    /// Position within the run, ascending.
    pub step_number: i64,
    /// Role of the agent that produced this episode (e.g. "planner").
    pub role: String,
    /// Raw textual content.
    pub content: String,
    /// Embedding of `content`, if computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// When this episode was recorded.
    pub created_at: DateTime<Utc>,
    /// Importance score in `[0, 1]`, computed lazily if absent.
    #[serde(default)]
    pub importance: Option<f64>,
    /// Last time this episode was read, if ever.
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
}

/// A lesson distilled from a failure episode (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    /// Unique id, derived from a hash of its inputs.
    pub reflection_id: String,
    /// Summary of the situation that produced the failure.
    pub context: String,
    /// The error or undesirable outcome observed.
    pub error_or_outcome: String,
    /// The distilled lesson.
    pub insight: String,
    /// A concrete plan to prevent recurrence.
    pub prevention_plan: String,
    /// When this reflection was produced.
    pub created_at: DateTime<Utc>,
    /// Embedding of `context` + `insight`, for retrieval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Number of times this reflection has been retrieved.
    #[serde(default)]
    pub times_referenced: u64,
    /// Observed success rate when this reflection's prevention plan was
    /// followed.
    #[serde(default)]
    pub success_rate: f64,
}

/// A recurring success/failure template with utility and success rate (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique pattern id.
    pub pattern_id: String,
    /// Human-readable name.
    pub name: String,
    /// Category/grouping label.
    pub category: String,
    /// Observed success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Number of times this pattern has been applied.
    pub times_used: u64,
    /// Cached utility score; recomputed by the consolidator.
    pub utility_score: f64,
    /// Key elements that characterize this pattern.
    pub key_elements: Vec<String>,
    /// Tools commonly associated with this pattern.
    pub common_tools: Vec<String>,
    /// When this pattern was last applied.
    pub last_used: DateTime<Utc>,
    /// Whether this pattern has been archived by pruning.
    #[serde(default)]
    pub archived: bool,
    /// When this pattern was archived, if ever.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

/// Counts and timing returned by a completed sleep cycle (§4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Pipeline run id consolidated.
    pub run_id: String,
    /// Number of episodes fetched.
    pub episodes_processed: usize,
    /// Number of clusters formed.
    pub clusters_formed: usize,
    /// Number of semantic nodes created or updated.
    pub nodes_upserted: usize,
    /// Number of relations created or superseded.
    pub relations_upserted: usize,
    /// Number of reflections generated.
    pub reflections_generated: usize,
    /// Number of episodes archived.
    pub episodes_archived: usize,
    /// Wall-clock duration of the cycle, in milliseconds.
    pub duration_ms: u64,
}

/// Health snapshot returned by `Blackboard::health` (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the underlying store answered the probe.
    pub connected: bool,
    /// Observed throughput at the time of the probe, if measurable.
    #[serde(default)]
    pub ops_per_sec: Option<f64>,
    /// Error string, set only when `connected` is false.
    #[serde(default)]
    pub error: Option<String>,
}
