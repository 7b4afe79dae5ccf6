//! Recipient → worker selection
//!
//! Selection is positional: the recipient hash indexes into the path's
//! server list in first-seen order. When a server joins or leaves, indices
//! shift and recipients move between servers. Workers rely on that
//! rebalancing; this is not consistent hashing.

use std::fmt;
use std::sync::Arc;

use super::heartbeat_registry::HeartbeatRegistry;

/// Where a routed event goes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    Server(String),
    /// No server is known for the path
    Default,
}

impl RouteTarget {
    /// Bus channel for this target
    #[must_use]
    pub fn channel(&self, route_prefix: &str, default_channel: &str) -> String {
        match self {
            Self::Server(server_id) => format!("{route_prefix}{server_id}"),
            Self::Default => default_channel.to_string(),
        }
    }

    #[must_use]
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Server(server_id) => Some(server_id),
            Self::Default => None,
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(server_id) => f.write_str(server_id),
            Self::Default => f.write_str("DEFAULT"),
        }
    }
}

/// 32-bit signed rolling hash (`h = h * 31 + c`, wrapping) over UTF-16 code units.
///
/// Workers compute the same value, so the code-unit encoding and the
/// wrapping behavior must not change.
#[must_use]
pub fn recipient_hash(recipient_id: &str) -> i32 {
    recipient_id
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Picks the worker owning a recipient on a path
#[derive(Clone)]
pub struct Router {
    registry: Arc<HeartbeatRegistry>,
}

impl Router {
    #[must_use]
    pub const fn new(registry: Arc<HeartbeatRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HeartbeatRegistry> {
        &self.registry
    }

    /// Select the server for `recipient_id` on `path`, or [`RouteTarget::Default`]
    #[must_use]
    pub fn select_server(&self, path: &str, recipient_id: &str) -> RouteTarget {
        let hash = recipient_hash(recipient_id);
        self.registry.with_servers(path, |servers| {
            if servers.is_empty() {
                return RouteTarget::Default;
            }
            // The hash may be negative; rem_euclid keeps the index in [0, n)
            let index = i64::from(hash).rem_euclid(servers.len() as i64) as usize;
            RouteTarget::Server(servers[index].server_id.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn router_with(path: &str, servers: &[&str]) -> Router {
        let registry = Arc::new(HeartbeatRegistry::default());
        let now = Instant::now();
        for server in servers {
            registry.on_heartbeat_at(server, &[path], now);
        }
        Router::new(registry)
    }

    #[test]
    fn test_hash_values() {
        assert_eq!(recipient_hash(""), 0);
        assert_eq!(recipient_hash("a"), 97);
        assert_eq!(recipient_hash("ab"), 97 * 31 + 98);
        assert_eq!(recipient_hash("alice"), 92_903_040);
        // Long ids overflow and wrap negative
        assert_eq!(recipient_hash("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn test_hash_uses_utf16_code_units() {
        // U+1F600 is a surrogate pair in UTF-16: 0xD83D 0xDE00
        let expected = 0xD83Di32.wrapping_mul(31).wrapping_add(0xDE00);
        assert_eq!(recipient_hash("😀"), expected);
    }

    #[test]
    fn test_no_servers_routes_to_default() {
        let router = router_with("/chat", &[]);
        assert_eq!(router.select_server("/chat", "alice"), RouteTarget::Default);
        assert_eq!(router.select_server("/unknown", ""), RouteTarget::Default);
    }

    #[test]
    fn test_single_server() {
        let router = router_with("/chat", &["S1"]);
        assert_eq!(
            router.select_server("/chat", "alice"),
            RouteTarget::Server("S1".to_string())
        );
    }

    #[test]
    fn test_selection_is_positional() {
        let router = router_with("/chat", &["S1", "S2"]);

        // hash("alice") = 92903040 is even
        assert_eq!(
            router.select_server("/chat", "alice"),
            RouteTarget::Server("S1".to_string())
        );
        // hash("ab") = 3105 is odd
        assert_eq!(
            router.select_server("/chat", "ab"),
            RouteTarget::Server("S2".to_string())
        );
    }

    #[test]
    fn test_deterministic() {
        let router = router_with("/chat", &["S1", "S2", "S3"]);
        let first = router.select_server("/chat", "recipient-42");
        for _ in 0..10 {
            assert_eq!(router.select_server("/chat", "recipient-42"), first);
        }
    }

    #[test]
    fn test_negative_hash_stays_in_range() {
        let router = router_with("/chat", &["S1", "S2", "S3"]);
        assert!(recipient_hash("polygenelubricants") < 0);

        // i32::MIN mod 3 normalizes to 1
        assert_eq!(
            router.select_server("/chat", "polygenelubricants"),
            RouteTarget::Server("S2".to_string())
        );
    }

    #[test]
    fn test_never_out_of_range() {
        let ids = ["", "a", "alice", "polygenelubricants", "😀", "用户-7"];
        for n in 1..=7 {
            let servers: Vec<String> = (0..n).map(|i| format!("S{i}")).collect();
            let names: Vec<&str> = servers.iter().map(String::as_str).collect();
            let router = router_with("/p", &names);
            for id in ids {
                let target = router.select_server("/p", id);
                assert!(target.server_id().is_some_and(|s| servers.iter().any(|x| x == s)));
            }
        }
    }

    #[test]
    fn test_channel_names() {
        let server = RouteTarget::Server("S1".to_string());
        assert_eq!(server.channel("route#", "route#default"), "route#S1");
        assert_eq!(
            RouteTarget::Default.channel("route#", "route#default"),
            "route#default"
        );
        assert_eq!(RouteTarget::Default.to_string(), "DEFAULT");
    }
}
