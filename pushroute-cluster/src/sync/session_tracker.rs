//! Recipient session affinity
//!
//! Tracks the connection currently recorded for each recipient so that a
//! reconnect does not announce a second "connected" event and a disconnect
//! from a connection that has already been replaced does not announce
//! "disconnected".
//!
//! The lookup and the following write are not atomic. Matching on the
//! connection id is what makes racing connect/disconnect callbacks safe:
//! connect is last-writer-wins, disconnect only acts on an exact match.
//!
//! When the store cannot be read the two operations lean in opposite
//! directions. A connect assumes there was no prior session and announces
//! (a duplicate "connected" is tolerable). A disconnect assumes the
//! connection is not current and stays silent (a missed "disconnected" is
//! preferred over a false one).

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::events::RoutedEvent;
use super::route_publisher::RoutePublisher;
use crate::store::KeyValueStore;
use pushroute_core::KeyBuilder;

/// Default lifetime of a recorded session
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600 * 24 * 7);

/// What `on_connect` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// No session was recorded; "connected" was announced
    FirstConnect,
    /// A session was already recorded; nothing announced
    Reconnect,
}

/// What `on_disconnect` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The connection was current; session removed and "disconnected" announced
    Disconnected,
    /// A later connection replaced this one; nothing done
    Superseded,
    /// No session recorded for the recipient; nothing done
    NoSession,
    /// The store could not be read; nothing done
    Unknown,
}

pub struct SessionTracker {
    store: Arc<dyn KeyValueStore>,
    publisher: Arc<RoutePublisher>,
    keys: KeyBuilder,
    session_ttl: Duration,
}

impl SessionTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        publisher: Arc<RoutePublisher>,
        keys: KeyBuilder,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            keys,
            session_ttl,
        }
    }

    /// Record `connection_id` as the recipient's current connection.
    ///
    /// Announces "connected" only when no session was recorded. The session
    /// is (re)written either way, refreshing its lifetime.
    pub async fn on_connect(
        &self,
        recipient_id: &str,
        connection_id: &str,
        uid: Option<&str>,
    ) -> ConnectOutcome {
        let key = self.keys.session(recipient_id);

        let previous = match self.store.get(&key).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(
                    error = %e,
                    recipient_id = %recipient_id,
                    "Session lookup failed on connect, treating as first connect"
                );
                None
            }
        };

        let outcome = if let Some(previous) = previous {
            debug!(
                recipient_id = %recipient_id,
                previous_connection = %previous,
                connection_id = %connection_id,
                "Reconnect, not announcing"
            );
            ConnectOutcome::Reconnect
        } else {
            info!(
                recipient_id = %recipient_id,
                connection_id = %connection_id,
                "First connect, announcing"
            );
            if let Err(e) = self
                .publisher
                .publish(RoutedEvent::connected(recipient_id, uid))
                .await
            {
                warn!(error = %e, recipient_id = %recipient_id, "Failed to publish connect event");
            }
            ConnectOutcome::FirstConnect
        };

        if let Err(e) = self
            .store
            .set_ex(&key, connection_id, self.session_ttl)
            .await
        {
            warn!(
                error = %e,
                recipient_id = %recipient_id,
                connection_id = %connection_id,
                "Failed to store session"
            );
        }

        outcome
    }

    /// Close the session if `connection_id` is still the recorded one
    pub async fn on_disconnect(
        &self,
        recipient_id: &str,
        connection_id: &str,
        uid: Option<&str>,
    ) -> DisconnectOutcome {
        let key = self.keys.session(recipient_id);

        let current = match self.store.get(&key).await {
            Ok(current) => current,
            Err(e) => {
                warn!(
                    error = %e,
                    recipient_id = %recipient_id,
                    connection_id = %connection_id,
                    "Session lookup failed on disconnect, not announcing"
                );
                return DisconnectOutcome::Unknown;
            }
        };

        match current {
            Some(current) if current == connection_id => {
                info!(
                    recipient_id = %recipient_id,
                    connection_id = %connection_id,
                    "Current connection closed, announcing"
                );
                if let Err(e) = self.store.del(&key).await {
                    warn!(error = %e, recipient_id = %recipient_id, "Failed to delete session");
                }
                if let Err(e) = self
                    .publisher
                    .publish(RoutedEvent::disconnected(recipient_id, uid))
                    .await
                {
                    warn!(
                        error = %e,
                        recipient_id = %recipient_id,
                        "Failed to publish disconnect event"
                    );
                }
                DisconnectOutcome::Disconnected
            }
            Some(current) => {
                debug!(
                    recipient_id = %recipient_id,
                    connection_id = %connection_id,
                    current_connection = %current,
                    "Stale disconnect ignored"
                );
                DisconnectOutcome::Superseded
            }
            None => DisconnectOutcome::NoSession,
        }
    }

    /// Connection currently recorded for the recipient, if readable
    pub async fn current_connection(&self, recipient_id: &str) -> Option<String> {
        self.store
            .get(&self.keys.session(recipient_id))
            .await
            .ok()
            .flatten()
    }
}
