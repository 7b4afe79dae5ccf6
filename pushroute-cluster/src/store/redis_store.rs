use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use std::future::Future;
use tokio::time::{timeout, Duration};
use tracing::info;

use super::{KeyValueStore, MessageBus};
use crate::error::{Error, Result};

/// Redis-backed store and bus
///
/// All commands share one auto-reconnecting multiplexed connection and are
/// bounded by the configured timeout.
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Open the client and establish the shared connection
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let conn = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;

        info!(timeout_ms = op_timeout.as_millis() as u64, "Redis store connected");

        Ok(Self {
            client,
            conn,
            op_timeout,
        })
    }

    /// Underlying client, used to open dedicated Pub/Sub connections
    #[must_use]
    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("Redis {op} timed out")))?
            .map_err(Error::from)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.run(
            "GET",
            redis::cmd("GET").arg(key).query_async::<Option<String>>(&mut conn),
        )
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run(
            "SETEX",
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .arg(value)
                .query_async::<()>(&mut conn),
        )
        .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run("DEL", redis::cmd("DEL").arg(key).query_async::<()>(&mut conn))
            .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let mut conn = self.conn.clone();
        self.run("MGET", cmd.query_async::<Vec<Option<String>>>(&mut conn))
            .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run(
            "HSET",
            redis::cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .query_async::<()>(&mut conn),
        )
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run(
            "HDEL",
            redis::cmd("HDEL").arg(key).arg(field).query_async::<()>(&mut conn),
        )
        .await
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.run(
            "HKEYS",
            redis::cmd("HKEYS").arg(key).query_async::<Vec<String>>(&mut conn),
        )
        .await
    }
}

#[async_trait]
impl MessageBus for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.run(
            "PUBLISH",
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<usize>(&mut conn),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let result = RedisStore::connect("not-a-url", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_roundtrip_against_redis() {
        let store = RedisStore::connect("redis://127.0.0.1:6379", Duration::from_secs(5))
            .await
            .unwrap();

        store
            .set_ex("pushroute:test:key", "value", Duration::from_secs(10))
            .await
            .unwrap();
        let values = store
            .mget(&["pushroute:test:key".to_string(), "pushroute:test:missing".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("value".to_string()), None]);

        store.del("pushroute:test:key").await.unwrap();
        assert_eq!(store.get("pushroute:test:key").await.unwrap(), None);
    }
}
