use futures::stream::StreamExt;
use redis::Client as RedisClient;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{HeartbeatRegistry, HeartbeatResult};
use crate::store::MemoryStore;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Feeds worker heartbeats from the bus into the [`HeartbeatRegistry`]
///
/// Against Redis the listener holds a dedicated pub/sub connection and
/// resubscribes with exponential backoff when it drops. In single-node mode
/// it reads the in-process bus of a [`MemoryStore`] instead.
pub struct HeartbeatListener {
    registry: Arc<HeartbeatRegistry>,
    channel: String,
    op_timeout: Duration,
    cancel_token: CancellationToken,
}

impl HeartbeatListener {
    pub fn new(
        registry: Arc<HeartbeatRegistry>,
        channel: impl Into<String>,
        op_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            channel: channel.into(),
            op_timeout,
            cancel_token,
        }
    }

    /// Apply one raw heartbeat payload
    pub fn handle_payload(&self, payload: &str) -> Option<HeartbeatResult> {
        self.registry.handle_message(payload)
    }

    /// Subscribe to the heartbeat channel on Redis until cancelled
    pub fn spawn_redis(self: Arc<Self>, client: RedisClient) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if self.cancel_token.is_cancelled() {
                    info!("Heartbeat listener cancelled");
                    return;
                }

                match self.run_subscriber(&client).await {
                    SubscriberExit::Cancelled => {
                        info!("Heartbeat listener cancelled");
                        return;
                    }
                    SubscriberExit::Disconnected => {
                        error!(
                            "Heartbeat subscription lost, reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Heartbeat subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        info!("Heartbeat listener cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        })
    }

    async fn run_subscriber(&self, client: &RedisClient) -> SubscriberExit {
        let mut pubsub = match timeout(self.op_timeout, client.get_async_pubsub()).await {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context("Failed to get Redis Pub/Sub connection"),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out getting Redis Pub/Sub connection"
                ));
            }
        };

        match timeout(self.op_timeout, pubsub.subscribe(&self.channel)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context(format!("Failed to subscribe to {}", self.channel)),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out subscribing to {}",
                    self.channel
                ));
            }
        }

        info!(channel = %self.channel, "Heartbeat listener subscribed");

        let mut stream = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                () = self.cancel_token.cancelled() => return SubscriberExit::Cancelled,
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else {
                return SubscriberExit::Disconnected;
            };

            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %self.channel, "Invalid heartbeat payload");
                    continue;
                }
            };
            self.handle_payload(&payload);
        }
    }

    /// Read heartbeats from the in-process bus until cancelled
    pub fn spawn_local(self: Arc<Self>, store: &MemoryStore) -> JoinHandle<()> {
        let mut rx = store.subscribe();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        info!("Local heartbeat listener cancelled");
                        return;
                    }
                    msg = rx.recv() => msg,
                };
                match msg {
                    Ok(msg) if msg.channel == self.channel => {
                        self.handle_payload(&msg.payload);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Local heartbeat listener lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Local bus closed, heartbeat listener exiting");
                        return;
                    }
                }
            }
        })
    }
}

/// How one subscription attempt ended
enum SubscriberExit {
    /// Subscribed and streaming, then the connection dropped; backoff resets
    Disconnected,
    /// Could not connect or subscribe; backoff keeps growing
    ConnectFailed(anyhow::Error),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageBus;

    fn listener(
        registry: Arc<HeartbeatRegistry>,
        cancel: CancellationToken,
    ) -> Arc<HeartbeatListener> {
        Arc::new(HeartbeatListener::new(
            registry,
            "serverHeartbeat",
            Duration::from_secs(5),
            cancel,
        ))
    }

    #[test]
    fn test_handle_payload_ignores_malformed() {
        let registry = Arc::new(HeartbeatRegistry::default());
        let listener = listener(registry.clone(), CancellationToken::new());

        assert!(listener.handle_payload("not json").is_none());
        assert!(listener
            .handle_payload(r#"{"serverId":"S1","paths":["/chat"]}"#)
            .is_some());
        assert_eq!(registry.servers_for("/chat"), vec!["S1".to_string()]);
    }

    #[tokio::test]
    async fn test_local_listener_applies_heartbeats() {
        let registry = Arc::new(HeartbeatRegistry::default());
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let handle = listener(registry.clone(), cancel.clone()).spawn_local(&store);

        store
            .publish("route#S9", r#"{"serverId":"S9","paths":["/chat"]}"#)
            .await
            .unwrap();
        store
            .publish("serverHeartbeat", r#"{"serverId":"S1","paths":["/chat"]}"#)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while registry.servers_for("/chat").is_empty() && tokio::time::Instant::now() < deadline {
            tokio::task::yield_now().await;
        }

        // Only the heartbeat channel is consumed
        assert_eq!(registry.servers_for("/chat"), vec!["S1".to_string()]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at redis://127.0.0.1:6379"]
    async fn test_redis_listener_applies_heartbeats() {
        let client = RedisClient::open("redis://127.0.0.1:6379").unwrap();
        let registry = Arc::new(HeartbeatRegistry::default());
        let cancel = CancellationToken::new();
        let handle = listener(registry.clone(), cancel.clone()).spawn_redis(client.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let _: i64 = redis::cmd("PUBLISH")
            .arg("serverHeartbeat")
            .arg(r#"{"serverId":"S1","paths":["/redis"]}"#)
            .query_async(&mut conn)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(registry.servers_for("/redis"), vec!["S1".to_string()]);
        cancel.cancel();
        handle.await.unwrap();
    }
}
