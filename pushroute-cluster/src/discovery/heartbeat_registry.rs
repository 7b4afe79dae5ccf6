//! Path ownership registry built from worker heartbeats
//!
//! Workers periodically broadcast `{"serverId": .., "paths": [..]}`. For
//! every path in a heartbeat the registry keeps the ordered list of servers
//! claiming it, in the order they were first seen. Staleness is detected
//! lazily: a record is only dropped while a later heartbeat for the same
//! path is being applied. A path that stops receiving heartbeats keeps its
//! records until [`HeartbeatRegistry::sweep_stale`] runs, which is opt-in.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Records older than this are dropped on the next heartbeat for their path
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_millis(10_000);

/// Heartbeat broadcast by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(rename = "serverId")]
    pub server_id: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// One server claiming a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub server_id: String,
    pub last_heartbeat_at: Instant,
}

/// A record removed because its heartbeat went stale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedServer {
    pub path: String,
    pub server_id: String,
}

/// What applying one heartbeat changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatResult {
    /// Paths the server was not registered on before this heartbeat
    pub joined: Vec<String>,
    pub evicted: Vec<EvictedServer>,
}

/// Path → servers map shared between heartbeat processing and routing
pub struct HeartbeatRegistry {
    routes: RwLock<HashMap<String, Vec<ServerRecord>>>,
    stale_after: Duration,
}

impl HeartbeatRegistry {
    #[must_use]
    pub fn new(stale_after: Duration) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            stale_after,
        }
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Decode and apply a raw heartbeat payload.
    ///
    /// Malformed payloads are logged and dropped; they never touch the map.
    pub fn handle_message(&self, payload: &str) -> Option<HeartbeatResult> {
        match serde_json::from_str::<HeartbeatMessage>(payload) {
            Ok(message) if message.server_id.is_empty() => {
                warn!(payload = %payload, "Dropping heartbeat without serverId");
                None
            }
            Ok(message) => Some(self.on_heartbeat(&message.server_id, &message.paths)),
            Err(e) => {
                warn!(error = %e, payload = %payload, "Dropping malformed heartbeat");
                None
            }
        }
    }

    /// Apply a heartbeat from `server_id` for each of `paths`
    pub fn on_heartbeat<S: AsRef<str>>(&self, server_id: &str, paths: &[S]) -> HeartbeatResult {
        self.on_heartbeat_at(server_id, paths, Instant::now())
    }

    /// Apply a heartbeat as if it was received at `now`.
    ///
    /// The write lock is held for the whole heartbeat so updates to a path
    /// are applied in receipt order.
    pub fn on_heartbeat_at<S: AsRef<str>>(
        &self,
        server_id: &str,
        paths: &[S],
        now: Instant,
    ) -> HeartbeatResult {
        let mut result = HeartbeatResult::default();
        let mut routes = self.routes.write();

        for path in paths {
            let path = path.as_ref();
            let servers = routes.entry(path.to_string()).or_default();
            let mut found = false;

            servers.retain_mut(|record| {
                if record.server_id == server_id {
                    record.last_heartbeat_at = now;
                    found = true;
                    true
                } else if now.saturating_duration_since(record.last_heartbeat_at) > self.stale_after
                {
                    info!(
                        path = %path,
                        server_id = %record.server_id,
                        "Server heartbeat expired, removing from path"
                    );
                    result.evicted.push(EvictedServer {
                        path: path.to_string(),
                        server_id: record.server_id.clone(),
                    });
                    false
                } else {
                    true
                }
            });

            if !found {
                info!(path = %path, server_id = %server_id, "New server added to path");
                servers.push(ServerRecord {
                    server_id: server_id.to_string(),
                    last_heartbeat_at: now,
                });
                result.joined.push(path.to_string());
            }
        }

        debug!(
            server_id = %server_id,
            paths = paths.len(),
            joined = result.joined.len(),
            evicted = result.evicted.len(),
            "Heartbeat applied"
        );

        result
    }

    /// Server ids currently claiming `path`, in first-seen order
    #[must_use]
    pub fn servers_for(&self, path: &str) -> Vec<String> {
        self.with_servers(path, |servers| {
            servers.iter().map(|r| r.server_id.clone()).collect()
        })
    }

    /// Run `f` against a consistent snapshot of the records for `path`
    pub fn with_servers<R>(&self, path: &str, f: impl FnOnce(&[ServerRecord]) -> R) -> R {
        let routes = self.routes.read();
        f(routes.get(path).map(Vec::as_slice).unwrap_or_default())
    }

    /// Every path with at least one record
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let routes = self.routes.read();
        let mut paths: Vec<String> = routes
            .iter()
            .filter(|(_, servers)| !servers.is_empty())
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    #[must_use]
    pub fn path_count(&self) -> usize {
        self.routes.read().values().filter(|s| !s.is_empty()).count()
    }

    /// Apply the staleness rule to every path, including abandoned ones
    pub fn sweep_stale(&self) -> Vec<EvictedServer> {
        self.sweep_stale_at(Instant::now())
    }

    pub fn sweep_stale_at(&self, now: Instant) -> Vec<EvictedServer> {
        let mut evicted = Vec::new();
        let mut routes = self.routes.write();

        for (path, servers) in routes.iter_mut() {
            servers.retain(|record| {
                let stale =
                    now.saturating_duration_since(record.last_heartbeat_at) > self.stale_after;
                if stale {
                    evicted.push(EvictedServer {
                        path: path.clone(),
                        server_id: record.server_id.clone(),
                    });
                }
                !stale
            });
        }
        routes.retain(|_, servers| !servers.is_empty());

        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Stale servers swept");
        }
        evicted
    }

    /// Run [`Self::sweep_stale`] every `every` until `cancel_token` fires
    pub fn start_sweeper(
        self: &Arc<Self>,
        every: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("Heartbeat sweeper shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        registry.sweep_stale();
                    }
                }
            }
        })
    }
}

impl Default for HeartbeatRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_order() {
        let registry = HeartbeatRegistry::default();
        let t0 = Instant::now();

        registry.on_heartbeat_at("S1", &["/chat"], t0);
        registry.on_heartbeat_at("S2", &["/chat"], t0);
        registry.on_heartbeat_at("S1", &["/chat"], t0 + Duration::from_secs(1));

        assert_eq!(registry.servers_for("/chat"), vec!["S1", "S2"]);
    }

    #[test]
    fn test_one_record_per_server() {
        let registry = HeartbeatRegistry::default();
        let t0 = Instant::now();

        let first = registry.on_heartbeat_at("S1", &["/chat", "/feed"], t0);
        let second = registry.on_heartbeat_at("S1", &["/chat"], t0 + Duration::from_secs(2));

        assert_eq!(first.joined, vec!["/chat", "/feed"]);
        assert!(second.joined.is_empty());
        assert_eq!(registry.servers_for("/chat"), vec!["S1"]);
        assert_eq!(registry.servers_for("/feed"), vec!["S1"]);
    }

    #[test]
    fn test_stale_server_evicted_on_next_heartbeat() {
        let registry = HeartbeatRegistry::default();
        let t0 = Instant::now();

        registry.on_heartbeat_at("S1", &["/chat"], t0);
        registry.on_heartbeat_at("S2", &["/chat"], t0 + Duration::from_secs(5));

        // S1 is 10.001s old, S2 only 5.001s
        let result =
            registry.on_heartbeat_at("S2", &["/chat"], t0 + Duration::from_millis(10_001));

        assert_eq!(
            result.evicted,
            vec![EvictedServer {
                path: "/chat".to_string(),
                server_id: "S1".to_string(),
            }]
        );
        assert_eq!(registry.servers_for("/chat"), vec!["S2"]);
    }

    #[test]
    fn test_exactly_threshold_is_not_stale() {
        let registry = HeartbeatRegistry::default();
        let t0 = Instant::now();

        registry.on_heartbeat_at("S1", &["/chat"], t0);
        registry.on_heartbeat_at("S2", &["/chat"], t0 + DEFAULT_STALE_AFTER);

        assert_eq!(registry.servers_for("/chat"), vec!["S1", "S2"]);
    }

    #[test]
    fn test_stale_server_reregisters_at_end() {
        let registry = HeartbeatRegistry::default();
        let t0 = Instant::now();

        registry.on_heartbeat_at("S1", &["/chat"], t0);
        registry.on_heartbeat_at("S2", &["/chat"], t0);
        registry.on_heartbeat_at("S2", &["/chat"], t0 + Duration::from_secs(11));
        registry.on_heartbeat_at("S1", &["/chat"], t0 + Duration::from_secs(12));

        assert_eq!(registry.servers_for("/chat"), vec!["S2", "S1"]);
    }

    #[test]
    fn test_abandoned_path_keeps_stale_records() {
        let registry = HeartbeatRegistry::default();
        let t0 = Instant::now();

        registry.on_heartbeat_at("S1", &["/old"], t0);
        registry.on_heartbeat_at("S2", &["/new"], t0 + Duration::from_secs(60));

        // Only a heartbeat touching "/old" evicts S1 from it
        assert_eq!(registry.servers_for("/old"), vec!["S1"]);
    }

    #[test]
    fn test_sweep_removes_abandoned_paths() {
        let registry = HeartbeatRegistry::default();
        let t0 = Instant::now();

        registry.on_heartbeat_at("S1", &["/old"], t0);
        registry.on_heartbeat_at("S2", &["/new"], t0 + Duration::from_secs(60));

        let evicted = registry.sweep_stale_at(t0 + Duration::from_secs(61));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].server_id, "S1");
        assert!(registry.servers_for("/old").is_empty());
        assert_eq!(registry.paths(), vec!["/new"]);
        assert_eq!(registry.path_count(), 1);
    }

    #[test]
    fn test_handle_message() {
        let registry = HeartbeatRegistry::default();

        let result = registry
            .handle_message(r#"{"serverId":"S1","paths":["/chat","/feed"]}"#)
            .unwrap();
        assert_eq!(result.joined.len(), 2);
        assert_eq!(registry.servers_for("/feed"), vec!["S1"]);
    }

    #[test]
    fn test_malformed_heartbeat_dropped() {
        let registry = HeartbeatRegistry::default();

        assert!(registry.handle_message("not json").is_none());
        assert!(registry.handle_message(r#"{"paths":["/chat"]}"#).is_none());
        assert!(registry
            .handle_message(r#"{"serverId":"","paths":["/chat"]}"#)
            .is_none());
        assert_eq!(registry.path_count(), 0);
    }

    #[test]
    fn test_unknown_path_is_empty() {
        let registry = HeartbeatRegistry::default();
        assert!(registry.servers_for("/nothing").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let registry = Arc::new(HeartbeatRegistry::default());
        let cancel = CancellationToken::new();

        let handle = registry.start_sweeper(Duration::from_secs(1), cancel.clone());
        cancel.cancel();

        assert!(handle.await.is_ok());
    }
}
