//! Process-wide routing service
//!
//! [`PushCluster`] owns every routing component and the background tasks
//! feeding them. It is built once at startup, either against Redis or fully
//! in-process for a single node, and torn down with [`PushCluster::shutdown`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::heartbeat_listener::HeartbeatListener;
use super::recipient_hub::RecipientHub;
use super::route_publisher::RoutePublisher;
use super::session_tracker::{ConnectOutcome, DisconnectOutcome, SessionTracker};
use crate::discovery::{HeartbeatRegistry, Router};
use crate::error::Result;
use crate::push::{
    ApnsConnection, DeviceTokenRegistry, DisabledPush, DispatchSummary, Notification,
    NotificationDispatcher, OfflinePush, PushErrorCallback, DEFAULT_NOTIFICATION_TTL,
};
use crate::store::{KeyValueStore, MemoryStore, MessageBus, RedisStore};
use pushroute_core::config::ApnsConfig;
use pushroute_core::{Config, KeyBuilder};

/// Offline push from configuration: APNs when configured, otherwise disabled
pub fn default_offline_push(
    apns: Option<&ApnsConfig>,
    on_error: PushErrorCallback,
) -> Result<Arc<dyn OfflinePush>> {
    match apns {
        Some(apns) => Ok(Arc::new(ApnsConnection::new(apns.clone(), on_error)?)),
        None => {
            warn!("APNs not configured, offline push disabled");
            Ok(Arc::new(DisabledPush))
        }
    }
}

pub struct PushCluster {
    registry: Arc<HeartbeatRegistry>,
    publisher: Arc<RoutePublisher>,
    sessions: Arc<SessionTracker>,
    tokens: Arc<DeviceTokenRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    hub: Arc<RecipientHub>,
    push: Arc<dyn OfflinePush>,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PushCluster {
    /// Connect to Redis and start listening for heartbeats
    pub async fn connect(config: &Config) -> Result<Self> {
        let op_timeout = Duration::from_secs(config.redis.timeout_secs);
        let store = RedisStore::connect(&config.redis.url, op_timeout).await?;
        let client = store.client().clone();
        let store = Arc::new(store);

        let cluster = Self::from_parts(config, store.clone(), store, |on_error| {
            default_offline_push(config.apns.as_ref(), on_error)
        })?;

        let listener = Arc::new(cluster.heartbeat_listener(config, op_timeout));
        cluster.track(listener.spawn_redis(client));

        info!(
            heartbeat_channel = %config.cluster.heartbeat_channel,
            "Push cluster connected to Redis"
        );
        Ok(cluster)
    }

    /// Single-node variant over a [`MemoryStore`]
    ///
    /// Heartbeats published on the in-process bus feed the registry. Must be
    /// called from within a Tokio runtime.
    pub fn in_memory<F>(config: &Config, push_factory: F) -> Result<(Self, MemoryStore)>
    where
        F: FnOnce(PushErrorCallback) -> Result<Arc<dyn OfflinePush>>,
    {
        let store = MemoryStore::new();
        let shared = Arc::new(store.clone());
        let cluster = Self::from_parts(config, shared.clone(), shared, push_factory)?;

        let op_timeout = Duration::from_secs(config.redis.timeout_secs);
        let listener = Arc::new(cluster.heartbeat_listener(config, op_timeout));
        cluster.track(listener.spawn_local(&store));

        info!("Push cluster running in single-node mode");
        Ok((cluster, store))
    }

    /// Wire the components over an existing store and bus.
    ///
    /// No heartbeat listener is started; feed heartbeats through
    /// [`Self::registry`]. The stale sweep starts when configured.
    pub fn from_parts<F>(
        config: &Config,
        store: Arc<dyn KeyValueStore>,
        bus: Arc<dyn MessageBus>,
        push_factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(PushErrorCallback) -> Result<Arc<dyn OfflinePush>>,
    {
        let cluster_config = &config.cluster;
        let keys = KeyBuilder::from_config(config);

        let registry = Arc::new(HeartbeatRegistry::new(Duration::from_millis(
            cluster_config.stale_after_ms,
        )));
        let publisher = Arc::new(RoutePublisher::new(
            Router::new(registry.clone()),
            bus,
            cluster_config.route_channel_prefix.clone(),
            cluster_config.default_channel.clone(),
        ));
        let sessions = Arc::new(SessionTracker::new(
            store.clone(),
            publisher.clone(),
            keys.clone(),
            Duration::from_secs(cluster_config.session_ttl_secs),
        ));
        let tokens = Arc::new(DeviceTokenRegistry::new(
            store,
            keys,
            Duration::from_secs(cluster_config.token_ttl_secs),
        ));

        let push = push_factory(tokens.invalidation_callback())?;
        let notification_ttl = config
            .apns
            .as_ref()
            .map_or(DEFAULT_NOTIFICATION_TTL, |apns| {
                Duration::from_secs(apns.notification_ttl_secs)
            });
        let dispatcher = Arc::new(NotificationDispatcher::new(
            tokens.clone(),
            push.clone(),
            notification_ttl,
        ));

        let cluster = Self {
            registry,
            publisher,
            sessions,
            tokens,
            dispatcher,
            hub: Arc::new(RecipientHub::new()),
            push,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };

        if cluster_config.sweep_interval_secs > 0 {
            let handle = cluster.registry.start_sweeper(
                Duration::from_secs(cluster_config.sweep_interval_secs),
                cluster.cancel_token.child_token(),
            );
            cluster.track(handle);
        }

        Ok(cluster)
    }

    fn heartbeat_listener(&self, config: &Config, op_timeout: Duration) -> HeartbeatListener {
        HeartbeatListener::new(
            self.registry.clone(),
            config.cluster.heartbeat_channel.clone(),
            op_timeout,
            self.cancel_token.child_token(),
        )
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<HeartbeatRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn publisher(&self) -> &Arc<RoutePublisher> {
        &self.publisher
    }

    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    #[must_use]
    pub const fn tokens(&self) -> &Arc<DeviceTokenRegistry> {
        &self.tokens
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Live connections held by this process
    #[must_use]
    pub const fn hub(&self) -> &Arc<RecipientHub> {
        &self.hub
    }

    pub async fn on_connect(
        &self,
        recipient_id: &str,
        connection_id: &str,
        uid: Option<&str>,
    ) -> ConnectOutcome {
        self.sessions.on_connect(recipient_id, connection_id, uid).await
    }

    pub async fn on_disconnect(
        &self,
        recipient_id: &str,
        connection_id: &str,
        uid: Option<&str>,
    ) -> DisconnectOutcome {
        self.sessions
            .on_disconnect(recipient_id, connection_id, uid)
            .await
    }

    pub async fn set_token(&self, recipient_id: &str, token: &str) {
        self.tokens.set_token(recipient_id, token).await;
    }

    /// Notify recipients through this process's hub and offline push
    pub async fn notify(
        &self,
        recipient_ids: &[String],
        notification: &Notification,
    ) -> DispatchSummary {
        self.dispatcher
            .notify(recipient_ids, notification, self.hub.as_ref())
            .await
    }

    /// Broadcast through this process's hub and offline push
    pub async fn notify_all(&self, notification: &Notification) -> DispatchSummary {
        self.dispatcher
            .notify_all(notification, self.hub.as_ref())
            .await
    }

    /// Stop background tasks and close the offline-push connection
    pub async fn shutdown(&self) {
        info!("Shutting down push cluster");
        self.cancel_token.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.push.shutdown().await;
        info!("Push cluster shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BusMessage;
    use crate::sync::events::RoutedEvent;
    use tokio::sync::broadcast;

    fn single_node_config() -> Config {
        let mut config = Config::default();
        config.redis.url = String::new();
        config
    }

    async fn next_on(rx: &mut broadcast::Receiver<BusMessage>, channel: &str) -> BusMessage {
        loop {
            let msg = rx.recv().await.unwrap();
            if msg.channel == channel {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_in_memory_routes_connect_to_heartbeating_server() {
        let config = single_node_config();
        let (cluster, store) = PushCluster::in_memory(&config, |on_error| {
            default_offline_push(None, on_error)
        })
        .unwrap();
        let mut rx = store.subscribe();

        store
            .publish(
                "serverHeartbeat",
                r#"{"serverId":"S1","paths":["/socketConnect"]}"#,
            )
            .await
            .unwrap();
        for _ in 0..100 {
            if !cluster.registry().servers_for("/socketConnect").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let outcome = cluster.on_connect("alice", "c1", None).await;
        assert_eq!(outcome, ConnectOutcome::FirstConnect);

        let msg = next_on(&mut rx, "route#S1").await;
        let event: RoutedEvent = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(event.push_id, "alice");

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_parts_with_sweeper_shuts_down() {
        let mut config = single_node_config();
        config.cluster.sweep_interval_secs = 1;
        let store = Arc::new(MemoryStore::new());

        let cluster = PushCluster::from_parts(&config, store.clone(), store, |_| {
            Ok(Arc::new(DisabledPush) as Arc<dyn OfflinePush>)
        })
        .unwrap();
        assert_eq!(cluster.tasks.lock().len(), 1);

        cluster.shutdown().await;
        assert!(cluster.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_notify_reaches_local_hub() {
        let store = Arc::new(MemoryStore::new());
        let cluster = PushCluster::from_parts(&single_node_config(), store.clone(), store, |_| {
            Ok(Arc::new(DisabledPush) as Arc<dyn OfflinePush>)
        })
        .unwrap();
        let mut rx = cluster.hub().subscribe("alice", "c1");

        let notification: Notification =
            serde_json::from_value(serde_json::json!({"text": "hello"})).unwrap();
        let summary = cluster
            .notify(&["alice".to_string()], &notification)
            .await;

        assert_eq!(summary.live_deliveries, 1);
        assert_eq!(rx.recv().await.unwrap().event, "noti");
    }
}
