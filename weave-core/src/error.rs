//! Error taxonomy for the coordination and memory substrate.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the blackboard, memory graph, episode log, and consolidator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store operation hit a transient connectivity problem. Retried by
    /// [`crate::retry::RetryPolicy`] before it ever reaches a caller; if it
    /// surfaces here the retry budget was exhausted.
    #[error("transient store I/O error: {0}")]
    TransientIo(String),

    /// Terminal failure talking to the backing store after retries.
    #[error("store connection failed: {0}")]
    ConnectionFailure(String),

    /// An artifact value could not be encoded into the wire envelope.
    #[error("failed to serialize artifact {key}: {source}")]
    Serialization {
        /// Artifact key being written.
        key: String,
        /// Underlying encoding error.
        #[source]
        source: serde_json::Error,
    },

    /// Stored bytes for an artifact could not be decoded back into an envelope.
    #[error("corrupt artifact at {key}: {reason}")]
    CorruptArtifact {
        /// Artifact key whose bytes failed to decode.
        key: String,
        /// Human-readable decode failure.
        reason: String,
    },

    /// A blocking lock acquisition exceeded its `blocking_timeout`.
    #[error("timed out acquiring lock on {resource} after {elapsed_ms}ms")]
    LockTimeout {
        /// Resource id that could not be locked.
        resource: String,
        /// How long the caller waited before giving up.
        elapsed_ms: u64,
    },

    /// Two embeddings being compared (e.g. in retrieval scoring) have
    /// different dimensionality.
    #[error("embedding dimension mismatch: {a} vs {b}")]
    DimensionMismatch {
        /// Dimension of the first vector.
        a: usize,
        /// Dimension of the second vector.
        b: usize,
    },

    /// A consolidation sleep cycle aborted before completing. The active
    /// episode log for the run is left untouched.
    #[error("consolidation failed for run {run_id}: {reason}")]
    ConsolidationError {
        /// Pipeline run id being consolidated.
        run_id: String,
        /// Why the cycle aborted.
        reason: String,
    },

    /// A request referenced something that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A request was malformed independent of any store state.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this error is worth retrying with backoff.
    ///
    /// Only transient store connectivity problems are recoverable; every
    /// other variant reflects a condition a retry cannot fix.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TransientIo(_))
    }
}
