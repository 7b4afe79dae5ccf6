use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::{KeyValueStore, MessageBus};
use crate::error::Result;

/// A message published on the in-memory bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Instant,
}

/// In-process store and bus
///
/// Expiry is checked lazily on read against `tokio::time::Instant`, so
/// tests running with a paused clock can advance past a TTL.
#[derive(Clone)]
pub struct MemoryStore {
    strings: Arc<DashMap<String, StringEntry>>,
    hashes: Arc<DashMap<String, BTreeMap<String, String>>>,
    bus_tx: broadcast::Sender<BusMessage>,
}

impl MemoryStore {
    pub const BUS_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        let (bus_tx, _) = broadcast::channel(Self::BUS_CAPACITY);
        Self {
            strings: Arc::new(DashMap::new()),
            hashes: Arc::new(DashMap::new()),
            bus_tx,
        }
    }

    /// Receive every message published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.bus_tx.subscribe()
    }

    /// Number of live (unexpired) string keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.strings
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.strings.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.strings.remove(key);
        }
        None
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.remove(key);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        Ok(keys.iter().map(|key| self.live_value(key)).collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        if let Some(mut hash) = self.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                drop(hash);
                self.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MessageBus for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        // No receivers is not an error, same as PUBLISH on an idle channel
        let receivers = self
            .bus_tx
            .send(BusMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            })
            .unwrap_or(0);
        debug!(channel = %channel, receivers = receivers, "Published on in-memory bus");
        Ok(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_mget_preserves_order_and_gaps() {
        let store = MemoryStore::new();
        store.set_ex("a", "1", Duration::from_secs(60)).await.unwrap();
        store.set_ex("c", "3", Duration::from_secs(60)).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = store.mget(&keys).await.unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, Some("3".to_string())]);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();
        store.hset("h", "t2", "1").await.unwrap();
        store.hset("h", "t1", "1").await.unwrap();
        store.hset("h", "t1", "1").await.unwrap();

        assert_eq!(store.hkeys("h").await.unwrap(), vec!["t1", "t2"]);

        store.hdel("h", "t1").await.unwrap();
        store.hdel("h", "t2").await.unwrap();
        assert!(store.hkeys("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("idle", "x").await.unwrap(), 0);

        let mut rx = store.subscribe();
        assert_eq!(store.publish("route#S1", "{}").await.unwrap(), 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "route#S1");
        assert_eq!(msg.payload, "{}");
    }
}
