//! In-process [`StoreAdapter`] used by this crate's own tests and available
//! to downstream crates for unit testing without a real backend, mirroring
//! the teacher's in-memory storage test doubles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{glob_match, PubSubMessage, StoreAdapter, Subscription};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    kv: HashMap<String, (Vec<u8>, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    streams: HashMap<String, Vec<(String, HashMap<String, String>)>>,
    stream_seq: HashMap<String, u64>,
    subscribers: HashMap<String, Vec<mpsc::Sender<PubSubMessage>>>,
}

impl Inner {
    fn expire(&mut self, key: &str) {
        if let Some((_, Some(expiry))) = self.kv.get(key) {
            if Instant::now() >= *expiry {
                self.kv.remove(key);
            }
        }
    }
}

/// A thread-safe, in-memory [`StoreAdapter`]. Not durable, not networked;
/// intended purely as a test double.
#[derive(Clone, Default)]
pub struct InMemoryStoreAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStoreAdapter {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreAdapter for InMemoryStoreAdapter {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        inner.expire(key);
        Ok(inner.kv.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expiry = ttl.filter(|d| !d.is_zero()).map(|d| Instant::now() + d);
        self.inner.lock().kv.insert(key.to_string(), (value, expiry));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().kv.remove(key).is_some())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.expire(key);
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        let expiry = if ttl_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(ttl_ms))
        };
        inner.kv.insert(key.to_string(), (value, expiry));
        Ok(true)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner.kv.keys().cloned().collect();
        for k in &keys {
            inner.expire(k);
        }
        Ok(inner
            .kv
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn hash_put(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: HashMap<String, String>,
        cap_hint: Option<usize>,
    ) -> Result<String> {
        let mut inner = self.inner.lock();
        let seq = inner.stream_seq.entry(stream.to_string()).or_insert(0);
        *seq += 1;
        let id = format!("{seq}-0");
        let entries = inner.streams.entry(stream.to_string()).or_default();
        entries.push((id.clone(), fields));
        if let Some(cap) = cap_hint {
            let len = entries.len();
            if len > cap {
                entries.drain(0..(len - cap));
            }
        }
        Ok(id)
    }

    async fn stream_range_reverse(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Vec<(String, HashMap<String, String>)>> {
        let inner = self.inner.lock();
        let mut entries = inner.streams.get(stream).cloned().unwrap_or_default();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(channel) {
            subs.retain(|tx| {
                tx.try_send(PubSubMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
                    || !tx.is_closed()
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(128);
        self.inner
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}
