//! Embedded [`StoreAdapter`] backed by `redb`. Pub/sub is emulated by
//! polling a change-log table, per §4.1: "the embedded implementation may
//! emulate pub/sub by polling a change table; consumers must not observe
//! the difference beyond latency."

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use weave_core::error::{Error, Result};
use weave_core::store::{glob_match, PubSubMessage, StoreAdapter, Subscription};

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const HASH_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("hashes");
const STREAM_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("streams");
const STREAM_SEQ_TABLE: TableDefinition<&str, u64> = TableDefinition::new("stream_seq");
const CHANGE_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("change_log");

/// Poll interval for pub/sub emulation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Serialize, Deserialize)]
struct KvEntry {
    value: Vec<u8>,
    expires_at_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct ChangeLogEntry {
    channel: String,
    payload: Vec<u8>,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn to_transient(err: redb::Error) -> Error {
    Error::TransientIo(err.to_string())
}

/// Embedded `StoreAdapter` over a single `redb` file.
#[derive(Clone)]
pub struct RedbStoreAdapter {
    db: Arc<Database>,
    change_seq: Arc<AtomicU64>,
}

impl RedbStoreAdapter {
    /// Open (creating if absent) a `redb` database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(|err| Error::ConnectionFailure(err.to_string()))?;
        {
            let txn = db.begin_write().map_err(to_transient)?;
            txn.open_table(KV_TABLE).map_err(to_transient)?;
            txn.open_table(HASH_TABLE).map_err(to_transient)?;
            txn.open_table(STREAM_TABLE).map_err(to_transient)?;
            txn.open_table(STREAM_SEQ_TABLE).map_err(to_transient)?;
            txn.open_table(CHANGE_LOG_TABLE).map_err(to_transient)?;
            txn.commit().map_err(to_transient)?;
        }
        let mut last_seq = 0u64;
        {
            let txn = db.begin_read().map_err(to_transient)?;
            let table = txn.open_table(CHANGE_LOG_TABLE).map_err(to_transient)?;
            if let Some((k, _)) = table.iter().map_err(to_transient)?.next_back().transpose().map_err(to_transient)? {
                last_seq = k.value();
            }
        }
        Ok(Self {
            db: Arc::new(db),
            change_seq: Arc::new(AtomicU64::new(last_seq)),
        })
    }

    fn with_write<T>(&self, f: impl FnOnce(&redb::WriteTransaction) -> std::result::Result<T, redb::Error>) -> Result<T> {
        let txn = self.db.begin_write().map_err(to_transient)?;
        let result = f(&txn).map_err(to_transient)?;
        txn.commit().map_err(to_transient)?;
        Ok(result)
    }

    fn with_read<T>(&self, f: impl FnOnce(&redb::ReadTransaction) -> std::result::Result<T, redb::Error>) -> Result<T> {
        let txn = self.db.begin_read().map_err(to_transient)?;
        f(&txn).map_err(to_transient)
    }
}

#[async_trait]
impl StoreAdapter for RedbStoreAdapter {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_read(|txn| {
                let table = txn.open_table(KV_TABLE)?;
                let Some(raw) = table.get(key.as_str())? else {
                    return Ok(None);
                };
                let entry: KvEntry = serde_json::from_slice(raw.value()).unwrap_or(KvEntry {
                    value: Vec::new(),
                    expires_at_ms: None,
                });
                if let Some(expires_at) = entry.expires_at_ms {
                    if now_ms() >= expires_at {
                        return Ok(None);
                    }
                }
                Ok(Some(entry.value))
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let expires_at_ms = ttl.filter(|d| !d.is_zero()).map(|d| now_ms() + d.as_millis() as u64);
            let entry = KvEntry { value, expires_at_ms };
            let bytes = serde_json::to_vec(&entry).expect("KvEntry always serializes");
            this.with_write(|txn| {
                let mut table = txn.open_table(KV_TABLE)?;
                table.insert(key.as_str(), bytes.as_slice())?;
                Ok(())
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_write(|txn| {
                let mut table = txn.open_table(KV_TABLE)?;
                let existed = table.remove(key.as_str())?.is_some();
                Ok(existed)
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> Result<bool> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_write(|txn| {
                let mut table = txn.open_table(KV_TABLE)?;
                let present = match table.get(key.as_str())? {
                    Some(raw) => {
                        let entry: KvEntry = serde_json::from_slice(raw.value()).unwrap_or(KvEntry {
                            value: Vec::new(),
                            expires_at_ms: None,
                        });
                        !matches!(entry.expires_at_ms, Some(expiry) if now_ms() >= expiry)
                    }
                    None => false,
                };
                if present {
                    return Ok(false);
                }
                let expires_at_ms = if ttl_ms == 0 { None } else { Some(now_ms() + ttl_ms) };
                let entry = KvEntry { value, expires_at_ms };
                let bytes = serde_json::to_vec(&entry).expect("KvEntry always serializes");
                table.insert(key.as_str(), bytes.as_slice())?;
                Ok(true)
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let this = self.clone();
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_read(|txn| {
                let table = txn.open_table(KV_TABLE)?;
                let mut matched = Vec::new();
                for row in table.iter()? {
                    let (k, raw) = row?;
                    let entry: KvEntry = serde_json::from_slice(raw.value()).unwrap_or(KvEntry {
                        value: Vec::new(),
                        expires_at_ms: None,
                    });
                    if matches!(entry.expires_at_ms, Some(expiry) if now_ms() >= expiry) {
                        continue;
                    }
                    if glob_match(&pattern, k.value()) {
                        matched.push(k.value().to_string());
                    }
                }
                Ok(matched)
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn hash_put(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_write(|txn| {
                let mut table = txn.open_table(HASH_TABLE)?;
                let mut existing: HashMap<String, String> = match table.get(key.as_str())? {
                    Some(raw) => serde_json::from_slice(raw.value()).unwrap_or_default(),
                    None => HashMap::new(),
                };
                existing.extend(fields);
                let bytes = serde_json::to_vec(&existing).expect("hash always serializes");
                table.insert(key.as_str(), bytes.as_slice())?;
                Ok(())
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_read(|txn| {
                let table = txn.open_table(HASH_TABLE)?;
                match table.get(key.as_str())? {
                    Some(raw) => Ok(serde_json::from_slice(raw.value()).unwrap_or_default()),
                    None => Ok(HashMap::new()),
                }
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: HashMap<String, String>,
        cap_hint: Option<usize>,
    ) -> Result<String> {
        let this = self.clone();
        let stream = stream.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_write(|txn| {
                let mut seq_table = txn.open_table(STREAM_SEQ_TABLE)?;
                let next_seq = seq_table.get(stream.as_str())?.map(|v| v.value()).unwrap_or(0) + 1;
                seq_table.insert(stream.as_str(), next_seq)?;

                let mut stream_table = txn.open_table(STREAM_TABLE)?;
                let mut entries: Vec<(String, HashMap<String, String>)> = match stream_table.get(stream.as_str())? {
                    Some(raw) => serde_json::from_slice(raw.value()).unwrap_or_default(),
                    None => Vec::new(),
                };
                let id = format!("{next_seq}-0");
                entries.push((id.clone(), fields));
                if let Some(cap) = cap_hint {
                    let len = entries.len();
                    if len > cap {
                        entries.drain(0..(len - cap));
                    }
                }
                let bytes = serde_json::to_vec(&entries).expect("stream entries always serialize");
                stream_table.insert(stream.as_str(), bytes.as_slice())?;
                Ok(id)
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn stream_range_reverse(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Vec<(String, HashMap<String, String>)>> {
        let this = self.clone();
        let stream = stream.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_read(|txn| {
                let table = txn.open_table(STREAM_TABLE)?;
                let mut entries: Vec<(String, HashMap<String, String>)> = match table.get(stream.as_str())? {
                    Some(raw) => serde_json::from_slice(raw.value()).unwrap_or_default(),
                    None => Vec::new(),
                };
                entries.reverse();
                entries.truncate(limit);
                Ok(entries)
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let this = self.clone();
        let channel = channel.to_string();
        let seq = self.change_seq.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::spawn_blocking(move || {
            let entry = ChangeLogEntry { channel, payload };
            let bytes = serde_json::to_vec(&entry).expect("change log entry always serializes");
            this.with_write(|txn| {
                let mut table = txn.open_table(CHANGE_LOG_TABLE)?;
                table.insert(seq, bytes.as_slice())?;
                Ok(())
            })
        })
        .await
        .map_err(|err| Error::TransientIo(err.to_string()))?
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(128);
        let db = self.db.clone();
        let channel = channel.to_string();
        let mut last_seen = self.change_seq.load(Ordering::SeqCst);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    return;
                }
                let db = db.clone();
                let channel = channel.clone();
                let from = last_seen;
                let result = tokio::task::spawn_blocking(move || -> Result<(u64, Vec<ChangeLogEntry>)> {
                    let txn = db.begin_read().map_err(to_transient)?;
                    let table = txn.open_table(CHANGE_LOG_TABLE).map_err(to_transient)?;
                    let mut matched = Vec::new();
                    let mut newest = from;
                    for row in table.range((from + 1)..).map_err(to_transient)? {
                        let (k, raw) = row.map_err(to_transient)?;
                        newest = newest.max(k.value());
                        if let Ok(entry) = serde_json::from_slice::<ChangeLogEntry>(raw.value()) {
                            if entry.channel == channel {
                                matched.push(entry);
                            }
                        }
                    }
                    Ok((newest, matched))
                })
                .await;

                match result {
                    Ok(Ok((newest, matched))) => {
                        last_seen = newest;
                        for entry in matched {
                            if tx
                                .send(PubSubMessage {
                                    channel: entry.channel,
                                    payload: entry.payload,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    _ => continue,
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_adapter() -> (tempfile::TempDir, RedbStoreAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = RedbStoreAdapter::open(dir.path().join("store.redb")).unwrap();
        (dir, adapter)
    }

    #[tokio::test]
    async fn set_get_del_round_trip() {
        let (_dir, store) = temp_adapter();
        store.set("k1", b"v1".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert!(store.del("k1").await.unwrap());
        assert_eq!(store.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive_and_respects_ttl() {
        let (_dir, store) = temp_adapter();
        assert!(store.set_if_absent("lock:a", b"1".to_vec(), 50).await.unwrap());
        assert!(!store.set_if_absent("lock:a", b"2".to_vec(), 50).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.set_if_absent("lock:a", b"3".to_vec(), 5000).await.unwrap());
    }

    #[tokio::test]
    async fn hash_put_merges_fields() {
        let (_dir, store) = temp_adapter();
        store
            .hash_put("h1", HashMap::from([("a".to_string(), "1".to_string())]))
            .await
            .unwrap();
        store
            .hash_put("h1", HashMap::from([("b".to_string(), "2".to_string())]))
            .await
            .unwrap();
        let all = store.hash_get_all("h1").await.unwrap();
        assert_eq!(all.get("a"), Some(&"1".to_string()));
        assert_eq!(all.get("b"), Some(&"2".to_string()));
    }

    #[tokio::test]
    async fn stream_append_caps_and_reads_newest_first() {
        let (_dir, store) = temp_adapter();
        for i in 0..5 {
            store
                .stream_append("s1", HashMap::from([("i".to_string(), i.to_string())]), Some(3))
                .await
                .unwrap();
        }
        let entries = store.stream_range_reverse("s1", 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].1.get("i"), Some(&"4".to_string()));
    }

    #[tokio::test]
    async fn publish_is_observed_by_subscriber_via_polling() {
        let (_dir, store) = temp_adapter();
        let mut sub = store.subscribe("bb:events").await.unwrap();
        store.publish("bb:events", b"hello".to_vec()).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
        assert_eq!(message.payload, b"hello");
    }
}
