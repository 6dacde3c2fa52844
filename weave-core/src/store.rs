//! The Store Adapter: the narrow set of primitives every other subsystem in
//! this crate is built on (§4.1). Two conforming implementations live in
//! sibling crates — `weave-store-redb` (embedded) and `weave-store-redis`
//! (networked) — selected by the embedding application.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A message delivered to a pub/sub subscriber.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw message payload.
    pub payload: Vec<u8>,
}

/// A live subscription returned by [`StoreAdapter::subscribe`].
///
/// Dropping this value cancels the subscription: the adapter's background
/// forwarding task observes the closed receiver and releases its transport
/// resources, per §5's cancellation requirement.
pub struct Subscription {
    receiver: tokio::sync::mpsc::Receiver<PubSubMessage>,
}

impl Subscription {
    /// Wrap a receiver fed by the adapter's transport-specific listener task.
    #[must_use]
    pub fn new(receiver: tokio::sync::mpsc::Receiver<PubSubMessage>) -> Self {
        Self { receiver }
    }

    /// Await the next message. Returns `None` once the adapter side has
    /// permanently stopped delivering (e.g. the underlying connection was
    /// closed and could not be re-established).
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.receiver.recv().await
    }
}

/// Unified storage backend trait (§4.1).
///
/// All operations are async to support both networked (remote-service) and
/// embedded backends uniformly, and must be safe to call concurrently from
/// many independent callers.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Fetch the raw bytes at `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` at `key`. A `ttl` of `None` or zero means no expiration.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Delete `key`. Returns `true` if a value was present.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Conditional put: store `value` at `key` only if absent, with a
    /// millisecond-grained expiration. This is the primitive distributed
    /// locks are built on (§4.2).
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> Result<bool>;

    /// List keys matching a simple glob pattern (`*` wildcard only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Write multiple fields into a hash at `key`.
    async fn hash_put(&self, key: &str, fields: HashMap<String, String>) -> Result<()>;

    /// Read all fields of the hash at `key`.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Append an entry to `stream`, returning its id. `cap_hint` is an
    /// approximate cap on stream length; adapters MAY truncate older
    /// entries to honor it (§4.2 audit cap).
    async fn stream_append(
        &self,
        stream: &str,
        fields: HashMap<String, String>,
        cap_hint: Option<usize>,
    ) -> Result<String>;

    /// Read up to `limit` entries from `stream`, newest first.
    async fn stream_range_reverse(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Vec<(String, HashMap<String, String>)>>;

    /// Publish `payload` on `channel` to all current subscribers.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to `channel`. Delivery is at-least-once: reconnection after
    /// a transport loss is automatic, but messages in flight during the
    /// disconnect may be lost (§4.1) — consumers must be idempotent.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Simple glob matching used for `keys()` patterns and [`crate::watch`]
/// filters: `*` alone matches everything, a single `*` matches by prefix,
/// and a pattern without `*` requires exact equality (§4.6, §9 open
/// question — full glob semantics are intentionally out of scope).
#[must_use]
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.split('*').next() {
        if pattern.contains('*') {
            return candidate.starts_with(prefix);
        }
    }
    candidate == pattern
}

pub mod memory_store;
pub use memory_store::InMemoryStoreAdapter;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_everything() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn glob_prefix_matches_by_prefix() {
        assert!(glob_match("agent:*", "agent:1:plan"));
        assert!(!glob_match("agent:*", "other:1:plan"));
    }

    #[test]
    fn glob_without_star_requires_exact_match() {
        assert!(glob_match("k1", "k1"));
        assert!(!glob_match("k1", "k1x"));
    }
}
