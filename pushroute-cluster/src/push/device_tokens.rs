use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{PushErrorCallback, PushErrorCode};
use crate::store::KeyValueStore;
use pushroute_core::KeyBuilder;

/// Default lifetime of each direction of a token binding
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600 * 24 * 7);

/// Recipient and device token bindings
///
/// Both directions are stored with their own expiry so a token maps to at
/// most one recipient. The all-tokens hash is what broadcasts push to; it is
/// only pruned when the push service reports a token as invalid.
pub struct DeviceTokenRegistry {
    store: Arc<dyn KeyValueStore>,
    keys: KeyBuilder,
    token_ttl: Duration,
}

impl DeviceTokenRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeyBuilder, token_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            token_ttl,
        }
    }

    /// Bind `token` to `recipient_id`, moving it away from any previous owner
    pub async fn set_token(&self, recipient_id: &str, token: &str) {
        if recipient_id.is_empty() || token.is_empty() {
            warn!(
                recipient_id = %recipient_id,
                token_len = token.len(),
                "Ignoring token registration with empty recipient or token"
            );
            return;
        }

        let reverse_key = self.keys.token_recipient(token);
        match self.store.get(&reverse_key).await {
            Ok(Some(previous)) if previous != recipient_id => {
                info!(
                    previous_recipient = %previous,
                    recipient_id = %recipient_id,
                    "Device token moved to a new recipient"
                );
                if let Err(e) = self.store.del(&self.keys.recipient_token(&previous)).await {
                    warn!(
                        error = %e,
                        previous_recipient = %previous,
                        "Failed to remove previous owner's token binding"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Token owner lookup failed, binding anyway");
            }
        }

        if let Err(e) = self
            .store
            .set_ex(&self.keys.recipient_token(recipient_id), token, self.token_ttl)
            .await
        {
            warn!(error = %e, recipient_id = %recipient_id, "Failed to store recipient token");
        }
        if let Err(e) = self
            .store
            .set_ex(&reverse_key, recipient_id, self.token_ttl)
            .await
        {
            warn!(error = %e, recipient_id = %recipient_id, "Failed to store token owner");
        }
        if let Err(e) = self
            .store
            .hset(&self.keys.device_tokens(), token, "1")
            .await
        {
            warn!(error = %e, "Failed to add token to the all-tokens set");
        }

        debug!(recipient_id = %recipient_id, "Device token registered");
    }

    /// Tokens bound to any of `recipient_ids`, fetched in one round trip
    pub async fn resolve_tokens(&self, recipient_ids: &[String]) -> BTreeSet<String> {
        if recipient_ids.is_empty() {
            return BTreeSet::new();
        }

        let keys: Vec<String> = recipient_ids
            .iter()
            .map(|id| self.keys.recipient_token(id))
            .collect();

        match self.store.mget(&keys).await {
            Ok(values) => values
                .into_iter()
                .flatten()
                .filter(|token| !token.is_empty())
                .collect(),
            Err(e) => {
                warn!(
                    error = %e,
                    recipients = recipient_ids.len(),
                    "Token lookup failed, skipping offline push"
                );
                BTreeSet::new()
            }
        }
    }

    /// Forget `token` for broadcasts; per-recipient bindings expire on their own
    pub async fn invalidate(&self, token: &str) {
        match self.store.hdel(&self.keys.device_tokens(), token).await {
            Ok(()) => info!(token_len = token.len(), "Invalid device token removed"),
            Err(e) => warn!(error = %e, "Failed to remove invalid device token"),
        }
    }

    /// Every token currently valid for broadcast
    pub async fn all_tokens(&self) -> Vec<String> {
        match self.store.hkeys(&self.keys.device_tokens()).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "Failed to read the all-tokens set");
                Vec::new()
            }
        }
    }

    /// Callback for the push service that invalidates rejected tokens
    pub fn invalidation_callback(self: &Arc<Self>) -> PushErrorCallback {
        let registry = Arc::clone(self);
        Arc::new(move |code: PushErrorCode, token: &str| {
            debug!(code = %code, token_len = token.len(), "Push error reported");
            if code != PushErrorCode::InvalidToken {
                return;
            }
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!("No runtime to invalidate device token on");
                return;
            };
            let registry = Arc::clone(&registry);
            let token = token.to_string();
            handle.spawn(async move {
                registry.invalidate(&token).await;
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> (Arc<DeviceTokenRegistry>, MemoryStore) {
        let store = MemoryStore::new();
        let registry = Arc::new(DeviceTokenRegistry::new(
            Arc::new(store.clone()),
            KeyBuilder::default(),
            DEFAULT_TOKEN_TTL,
        ));
        (registry, store)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_and_resolve() {
        let (registry, _store) = registry();
        registry.set_token("alice", "T1").await;
        registry.set_token("bob", "T2").await;

        let tokens = registry.resolve_tokens(&ids(&["alice", "bob", "carol"])).await;

        assert_eq!(tokens.into_iter().collect::<Vec<_>>(), vec!["T1", "T2"]);
        assert_eq!(registry.all_tokens().await, vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn test_reassigned_token_leaves_previous_owner() {
        let (registry, _store) = registry();
        registry.set_token("alice", "T1").await;
        registry.set_token("bob", "T1").await;

        assert!(registry.resolve_tokens(&ids(&["alice"])).await.is_empty());
        let tokens = registry.resolve_tokens(&ids(&["alice", "bob"])).await;
        assert_eq!(tokens.len(), 1);
        assert!(tokens.contains("T1"));
    }

    #[tokio::test]
    async fn test_same_owner_rebinding_keeps_token() {
        let (registry, _store) = registry();
        registry.set_token("alice", "T1").await;
        registry.set_token("alice", "T1").await;

        assert!(registry.resolve_tokens(&ids(&["alice"])).await.contains("T1"));
        assert_eq!(registry.all_tokens().await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_ignored() {
        let (registry, store) = registry();
        registry.set_token("", "T1").await;
        registry.set_token("alice", "").await;

        assert!(store.is_empty());
        assert!(registry.all_tokens().await.is_empty());
        assert!(registry.resolve_tokens(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_removes_from_broadcast_only() {
        let (registry, _store) = registry();
        registry.set_token("alice", "T1").await;

        registry.invalidate("T1").await;

        assert!(registry.all_tokens().await.is_empty());
        // The binding itself expires on its own schedule
        assert!(registry.resolve_tokens(&ids(&["alice"])).await.contains("T1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bindings_expire() {
        let (registry, _store) = registry();
        registry.set_token("alice", "T1").await;

        tokio::time::advance(DEFAULT_TOKEN_TTL + Duration::from_secs(1)).await;

        assert!(registry.resolve_tokens(&ids(&["alice"])).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalidation_callback_only_for_invalid_token() {
        let (registry, _store) = registry();
        registry.set_token("alice", "T1").await;
        registry.set_token("bob", "T2").await;
        let callback = registry.invalidation_callback();

        callback(PushErrorCode::ProcessingError, "T2");
        callback(PushErrorCode::InvalidToken, "T1");

        for _ in 0..10 {
            if registry.all_tokens().await == vec!["T2".to_string()] {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.all_tokens().await, vec!["T2"]);
    }
}
