//! The Blackboard (§4.2): artifact CRUD, pub/sub events, an append-only
//! audit stream, distributed locks, and pipeline-state tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::lock::{self, ScopedLock};
use crate::retry::RetryPolicy;
use crate::store::StoreAdapter;
use crate::types::{Action, Artifact, ArtifactType, AuditEntry, Event, HealthStatus, PipelineState};
use crate::watch::Watcher;

const ARTIFACT_PREFIX: &str = "bb:artifact:";
const PIPELINE_PREFIX: &str = "bb:pipeline:";
const EVENTS_CHANNEL: &str = "bb:events";
const AUDIT_STREAM: &str = "bb:audit";
const AUDIT_CAP: usize = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_LOCK_TTL_MS: u64 = 5000;
const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(10);

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn artifact_key(key: &str) -> String {
    format!("{ARTIFACT_PREFIX}{key}")
}

fn pipeline_key(run_id: &str) -> String {
    format!("{PIPELINE_PREFIX}{run_id}")
}

/// The shared multi-agent coordination substrate (§4.2).
pub struct Blackboard {
    store: Arc<dyn StoreAdapter>,
    retry: RetryPolicy,
    ops_count: AtomicU64,
}

impl Blackboard {
    /// Build a Blackboard over the given store adapter.
    #[must_use]
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            ops_count: AtomicU64::new(0),
        }
    }

    /// Override the retry policy used for store operations.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn count_op(&self) {
        self.ops_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically encode and store an artifact, then (unless `notify` is
    /// false) publish an Event and append an audit entry. Ordering within
    /// this call is store-write, then publish, then audit-append, so a
    /// subscriber never observes an Event for a key whose new value isn't
    /// yet readable (§4.2 event/audit atomicity).
    pub async fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        artifact_type: ArtifactType,
        ttl: Option<Duration>,
        notify: bool,
    ) -> Result<()> {
        self.count_op();
        let timestamp = now_unix_seconds();
        let artifact = Artifact {
            artifact_type,
            data: value,
            timestamp,
            version: 1,
        };
        let bytes = serde_json::to_vec(&artifact).map_err(|source| Error::Serialization {
            key: key.to_string(),
            source,
        })?;

        let store_key = artifact_key(key);
        let ttl = ttl.unwrap_or(DEFAULT_TTL);
        self.retry
            .execute(|| self.store.set(&store_key, bytes.clone(), Some(ttl)))
            .await?;

        if notify {
            self.publish_event_and_audit(key, Action::Write, timestamp, Some(artifact_type))
                .await?;
        }
        Ok(())
    }

    /// Read the decoded envelope at `key`, or `None` if absent.
    pub async fn read(&self, key: &str) -> Result<Option<Artifact>> {
        self.count_op();
        let store_key = artifact_key(key);
        let bytes = self.retry.execute(|| self.store.get(&store_key)).await?;
        match bytes {
            None => Ok(None),
            Some(bytes) => {
                let artifact: Artifact =
                    serde_json::from_slice(&bytes).map_err(|source| Error::CorruptArtifact {
                        key: key.to_string(),
                        reason: source.to_string(),
                    })?;
                Ok(Some(artifact))
            }
        }
    }

    /// Delete `key`. Idempotent: returns `true` only if a value was present.
    /// On an actual deletion, publishes an Event and appends an audit entry.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.count_op();
        let store_key = artifact_key(key);
        let existed = self.retry.execute(|| self.store.del(&store_key)).await?;
        if existed {
            let timestamp = now_unix_seconds();
            self.publish_event_and_audit(key, Action::Delete, timestamp, None)
                .await?;
        }
        Ok(existed)
    }

    /// List artifact keys matching a simple glob (`*` wildcard only).
    pub async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        self.count_op();
        let store_pattern = format!("{ARTIFACT_PREFIX}{pattern}");
        let keys = self.retry.execute(|| self.store.keys(&store_pattern)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(ARTIFACT_PREFIX).map(str::to_string))
            .collect())
    }

    async fn publish_event_and_audit(
        &self,
        key: &str,
        action: Action,
        timestamp: f64,
        artifact_type: Option<ArtifactType>,
    ) -> Result<()> {
        let event = Event {
            key: key.to_string(),
            action,
            timestamp,
            artifact_type,
        };
        let payload = serde_json::to_vec(&event).map_err(|source| Error::Serialization {
            key: key.to_string(),
            source,
        })?;
        if let Err(err) = self.store.publish(EVENTS_CHANNEL, payload).await {
            warn!(key, ?err, "failed to publish event, continuing");
        }

        let mut fields = HashMap::new();
        fields.insert("key".to_string(), key.to_string());
        fields.insert(
            "action".to_string(),
            match action {
                Action::Write => "write".to_string(),
                Action::Delete => "delete".to_string(),
            },
        );
        fields.insert("timestamp".to_string(), timestamp.to_string());
        if let Err(err) = self
            .store
            .stream_append(AUDIT_STREAM, fields, Some(AUDIT_CAP))
            .await
        {
            error!(key, ?err, "failed to append audit entry");
            return Err(err);
        }
        Ok(())
    }

    /// Non-blocking or blocking lock acquisition over `resource` (§4.2's
    /// locking algorithm, implemented in [`crate::lock`]).
    pub async fn acquire_lock(
        &self,
        resource: &str,
        ttl_ms: Option<u64>,
        blocking: bool,
        blocking_timeout: Option<Duration>,
    ) -> Result<bool> {
        self.count_op();
        lock::acquire_lock(
            self.store.as_ref(),
            resource,
            ttl_ms.unwrap_or(DEFAULT_LOCK_TTL_MS),
            blocking,
            blocking_timeout.unwrap_or(DEFAULT_BLOCKING_TIMEOUT),
        )
        .await
    }

    /// Unconditionally release `resource`'s lock.
    pub async fn release_lock(&self, resource: &str) -> Result<bool> {
        self.count_op();
        lock::release_lock(self.store.as_ref(), resource).await
    }

    /// Acquire `resource` and return a guard that releases it on every exit
    /// path, including early return or panic unwind (§9).
    pub async fn scoped_lock(
        &self,
        resource: &str,
        ttl_ms: Option<u64>,
        blocking: bool,
        blocking_timeout: Option<Duration>,
    ) -> Result<Option<ScopedLock>> {
        self.count_op();
        ScopedLock::acquire(
            self.store.clone(),
            resource,
            ttl_ms.unwrap_or(DEFAULT_LOCK_TTL_MS),
            blocking,
            blocking_timeout.unwrap_or(DEFAULT_BLOCKING_TIMEOUT),
        )
        .await
    }

    /// Set pipeline state for `run_id`, retained 24 hours past last update.
    pub async fn set_pipeline_state(
        &self,
        run_id: &str,
        step: i64,
        status: &str,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.count_op();
        let state = PipelineState {
            step,
            status: status.to_string(),
            updated_at: Utc::now(),
            data,
        };
        let bytes = serde_json::to_vec(&state).map_err(|source| Error::Serialization {
            key: run_id.to_string(),
            source,
        })?;
        let mut fields = HashMap::new();
        fields.insert("state".to_string(), String::from_utf8_lossy(&bytes).into_owned());
        let key = pipeline_key(run_id);
        // Retention (§3: 24h after last update) is enforced by a periodic
        // sweep over `bb:pipeline:*` comparing `updated_at`, since the
        // StoreAdapter hash primitive carries no per-field TTL.
        self.retry.execute(|| self.store.hash_put(&key, fields.clone())).await?;
        Ok(())
    }

    /// Fetch pipeline state for `run_id`, or `None` if never set.
    pub async fn get_pipeline_state(&self, run_id: &str) -> Result<Option<PipelineState>> {
        self.count_op();
        let key = pipeline_key(run_id);
        let fields = self.retry.execute(|| self.store.hash_get_all(&key)).await?;
        match fields.get("state") {
            None => Ok(None),
            Some(raw) => {
                let state: PipelineState =
                    serde_json::from_str(raw).map_err(|source| Error::Serialization {
                        key: run_id.to_string(),
                        source,
                    })?;
                Ok(Some(state))
            }
        }
    }

    /// Clear pipeline state for `run_id`.
    pub async fn clear_pipeline_state(&self, run_id: &str) -> Result<bool> {
        self.count_op();
        self.retry.execute(|| self.store.del(&pipeline_key(run_id))).await
    }

    /// The most recent `limit` audit entries, newest first.
    pub async fn get_history(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.count_op();
        let entries = self
            .retry
            .execute(|| self.store.stream_range_reverse(AUDIT_STREAM, limit))
            .await?;
        entries
            .into_iter()
            .map(|(id, fields)| {
                let key = fields.get("key").cloned().unwrap_or_default();
                let action = match fields.get("action").map(String::as_str) {
                    Some("delete") => Action::Delete,
                    _ => Action::Write,
                };
                let timestamp = fields
                    .get("timestamp")
                    .and_then(|t| t.parse::<f64>().ok())
                    .unwrap_or(0.0);
                Ok(AuditEntry {
                    id,
                    key,
                    action,
                    timestamp,
                })
            })
            .collect()
    }

    /// Subscribe to Events matching `pattern` (`*` wildcard only, §4.6).
    pub async fn watch(&self, pattern: &str) -> Result<Watcher> {
        self.count_op();
        let subscription = self.store.subscribe(EVENTS_CHANNEL).await?;
        Ok(Watcher::new(subscription, pattern.to_string()))
    }

    /// Probe the store and report connectivity and throughput.
    pub async fn health(&self) -> HealthStatus {
        let probe_key = "bb:__health_probe__";
        match self.store.get(probe_key).await {
            Ok(_) => HealthStatus {
                connected: true,
                ops_per_sec: Some(self.ops_count.load(Ordering::Relaxed) as f64),
                error: None,
            },
            Err(err) => HealthStatus {
                connected: false,
                ops_per_sec: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStoreAdapter;
    use serde_json::json;

    fn blackboard() -> Blackboard {
        Blackboard::new(Arc::new(InMemoryStoreAdapter::new()))
    }

    #[tokio::test]
    async fn write_read_list_delete_round_trip() {
        let bb = blackboard();
        bb.write("k1", json!({"x": 1}), ArtifactType::Plan, Some(Duration::from_secs(3600)), true)
            .await
            .unwrap();

        let artifact = bb.read("k1").await.unwrap().unwrap();
        assert_eq!(artifact.data, json!({"x": 1}));
        assert_eq!(artifact.version, 1);
        assert!(matches!(artifact.artifact_type, ArtifactType::Plan));

        let keys = bb.list("*").await.unwrap();
        assert!(keys.contains(&"k1".to_string()));

        assert!(bb.delete("k1").await.unwrap());
        assert!(bb.read("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let bb = blackboard();
        assert!(!bb.delete("missing").await.unwrap());
    }

    #[tokio::test]
    async fn write_publishes_event_before_being_missed() {
        let bb = blackboard();
        let mut watcher = bb.watch("*").await.unwrap();
        bb.write("k1", json!({"x": 1}), ArtifactType::Plan, None, true)
            .await
            .unwrap();
        let event = watcher.next().await.unwrap();
        assert_eq!(event.key, "k1");
        assert!(matches!(event.action, Action::Write));

        let artifact = bb.read(&event.key).await.unwrap();
        assert!(artifact.is_some());
        assert!(artifact.unwrap().timestamp >= event.timestamp);
    }

    #[tokio::test]
    async fn audit_history_is_newest_first() {
        let bb = blackboard();
        bb.write("k1", json!(1), ArtifactType::Context, None, true).await.unwrap();
        bb.write("k2", json!(2), ArtifactType::Context, None, true).await.unwrap();
        let history = bb.get_history(10).await.unwrap();
        assert_eq!(history[0].key, "k2");
        assert_eq!(history[1].key, "k1");
    }

    #[tokio::test]
    async fn lock_lifecycle() {
        let bb = blackboard();
        assert!(bb.acquire_lock("r", None, false, None).await.unwrap());
        assert!(!bb.acquire_lock("r", None, false, None).await.unwrap());
        assert!(bb.release_lock("r").await.unwrap());
        assert!(bb.acquire_lock("r", None, false, None).await.unwrap());
    }

    #[tokio::test]
    async fn pipeline_state_round_trip() {
        let bb = blackboard();
        bb.set_pipeline_state("run1", 2, "running", Some(json!({"foo": "bar"})))
            .await
            .unwrap();
        let state = bb.get_pipeline_state("run1").await.unwrap().unwrap();
        assert_eq!(state.step, 2);
        assert_eq!(state.status, "running");
        assert!(bb.clear_pipeline_state("run1").await.unwrap());
        assert!(bb.get_pipeline_state("run1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn health_reports_connected() {
        let bb = blackboard();
        let health = bb.health().await;
        assert!(health.connected);
    }
}
