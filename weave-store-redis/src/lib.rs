//! Networked [`StoreAdapter`] backed by Redis. Pub/sub subscriptions use a
//! dedicated connection, distinct from request/response traffic, per §5.
//! Re-subscription on transport loss is automatic; messages in flight
//! during the disconnect may be lost (§4.1) — consumers must be idempotent.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::mpsc;
use weave_core::error::{Error, Result};
use weave_core::store::{PubSubMessage, StoreAdapter, Subscription};

/// Delay before attempting to re-establish a dropped pub/sub connection.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(250);

fn to_error(err: RedisError) -> Error {
    if err.is_io_error() || err.is_timeout() {
        Error::TransientIo(err.to_string())
    } else {
        Error::ConnectionFailure(err.to_string())
    }
}

/// Networked `StoreAdapter` over a Redis connection pool.
#[derive(Clone)]
pub struct RedisStoreAdapter {
    client: Client,
    manager: ConnectionManager,
}

impl RedisStoreAdapter {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`), establishing the
    /// pooled connection manager used for request/response traffic.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(to_error)?;
        let manager = client.get_connection_manager().await.map_err(to_error)?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl StoreAdapter for RedisStoreAdapter {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(to_error)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.manager.clone();
        match ttl.filter(|d| !d.is_zero()) {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await.map_err(to_error)?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(to_error)?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(key).await.map_err(to_error)?;
        Ok(removed > 0)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if ttl_ms > 0 {
            cmd.arg("PX").arg(ttl_ms);
        }
        let result: Option<String> = cmd.query_async(&mut conn).await.map_err(to_error)?;
        Ok(result.is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.keys(pattern).await.map_err(to_error)
    }

    async fn hash_put(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        let mut conn = self.manager.clone();
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let _: () = conn.hset_multiple(key, &pairs).await.map_err(to_error)?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        conn.hgetall(key).await.map_err(to_error)
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: HashMap<String, String>,
        cap_hint: Option<usize>,
    ) -> Result<String> {
        let mut conn = self.manager.clone();
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(cap) = cap_hint {
            cmd.arg("MAXLEN").arg("~").arg(cap);
        }
        cmd.arg("*");
        for (field, value) in &pairs {
            cmd.arg(field).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await.map_err(to_error)?;
        Ok(id)
    }

    async fn stream_range_reverse(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Vec<(String, HashMap<String, String>)>> {
        let mut conn = self.manager.clone();
        let rows: Vec<(String, HashMap<String, String>)> = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(to_error)?;
        Ok(rows)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.publish(channel, payload).await.map_err(to_error)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(128);
        let client = self.client.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    return;
                }
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        tracing::warn!(?err, "failed to open pub/sub connection, retrying");
                        tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                        continue;
                    }
                };
                if let Err(err) = pubsub.subscribe(&channel).await {
                    tracing::warn!(?err, channel, "failed to subscribe, retrying");
                    tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                loop {
                    use futures::StreamExt;
                    match stream.next().await {
                        Some(msg) => {
                            let payload: Vec<u8> = msg.get_payload().unwrap_or_default();
                            let channel_name = msg.get_channel_name().to_string();
                            if tx
                                .send(PubSubMessage {
                                    channel: channel_name,
                                    payload,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        None => {
                            tracing::debug!(channel, "pub/sub connection closed, re-subscribing");
                            break;
                        }
                    }
                }
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
            }
        });

        Ok(Subscription::new(rx))
    }
}
