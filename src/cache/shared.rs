// Shared cache tier over redis. Every operation is defensive: a
// disconnected or failing shared tier degrades to local-only behavior and
// never raises to the caller on read.
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Invalidation message published on the `<prefix>invalidate` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

pub struct SharedCache {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl SharedCache {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        info!("shared cache tier configured at {redis_url}");
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Option<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => *guard = Some(conn),
                Err(err) => {
                    debug!("shared cache unavailable: {err}");
                    return None;
                }
            }
        }
        guard.clone()
    }

    async fn drop_connection(&self) {
        let mut guard = self.connection.lock().await;
        *guard = None;
    }

    /// Read one key. Failures return `None`, never an error.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                debug!("shared cache get failed for {key}: {err}");
                self.drop_connection().await;
                None
            }
        }
    }

    /// Write one key with a TTL. Returns false when the write was dropped.
    pub async fn set(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("unserializable cache value for {key}: {err}");
                return false;
            }
        };
        match conn
            .set_ex::<_, _, ()>(key, raw, ttl.as_secs().max(1))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                debug!("shared cache set failed for {key}: {err}");
                self.drop_connection().await;
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        match conn.del::<_, ()>(key).await {
            Ok(()) => true,
            Err(err) => {
                debug!("shared cache delete failed for {key}: {err}");
                self.drop_connection().await;
                false
            }
        }
    }

    /// Publish an invalidation so remote peers evict matching local keys.
    pub async fn publish_invalidation(&self, channel: &str, message: &InvalidationMessage) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(_) => return false,
        };
        match conn.publish::<_, _, ()>(channel, payload).await {
            Ok(()) => true,
            Err(err) => {
                debug!("invalidation publish failed: {err}");
                self.drop_connection().await;
                false
            }
        }
    }

    /// Subscribe to the invalidation channel, forwarding messages until the
    /// receiver is dropped or the connection dies (the caller respawns).
    pub async fn subscribe_invalidations(
        &self,
        channel: &str,
        tx: mpsc::Sender<InvalidationMessage>,
    ) -> anyhow::Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!("subscribed to cache invalidation channel {channel}");
        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            match serde_json::from_str::<InvalidationMessage>(&payload) {
                Ok(invalidation) => {
                    if tx.send(invalidation).await.is_err() {
                        break;
                    }
                }
                Err(err) => debug!("discarding malformed invalidation: {err}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_message_wire_format() {
        let by_key = InvalidationMessage {
            key: Some("arbflow:prices:WETH".into()),
            pattern: None,
        };
        let raw = serde_json::to_string(&by_key).unwrap();
        assert_eq!(raw, r#"{"key":"arbflow:prices:WETH"}"#);

        let by_pattern: InvalidationMessage =
            serde_json::from_str(r#"{"pattern":"arbflow:prices:*"}"#).unwrap();
        assert_eq!(by_pattern.pattern.as_deref(), Some("arbflow:prices:*"));
        assert!(by_pattern.key.is_none());
    }

    #[tokio::test]
    async fn test_disconnected_tier_degrades_quietly() {
        // Nothing listens on this port; every operation must degrade.
        let cache = SharedCache::new("redis://127.0.0.1:1/").unwrap();
        assert!(cache.get("k").await.is_none());
        assert!(!cache.set("k", &serde_json::json!(1), Duration::from_secs(1)).await);
        assert!(!cache.delete("k").await);
    }
}
