use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Live-socket delivery seam used by the dispatcher
#[cfg_attr(test, mockall::automock)]
pub trait LiveSessionEmitter: Send + Sync {
    /// Emit `event` to every live connection of `recipient_id`; returns deliveries
    fn emit_to(&self, recipient_id: &str, event: &str, payload: &Value) -> usize;

    /// Emit `event` to every live connection joined to `group`; returns deliveries
    fn emit_to_group(&self, group: &str, event: &str, payload: &Value) -> usize;
}

/// Handle for a live connection
pub type ConnectionId = String;

/// Event delivered to a live connection
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEvent {
    pub event: String,
    pub payload: Value,
}

type MessageSender = mpsc::UnboundedSender<LiveEvent>;

#[derive(Debug, Clone)]
struct Subscriber {
    connection_id: ConnectionId,
    sender: MessageSender,
}

#[derive(Debug)]
struct ConnectionEntry {
    recipient_id: String,
    sender: MessageSender,
    groups: Vec<String>,
}

/// In-process fan-out to the connections held by this worker
///
/// Each connection subscribes under its recipient id and may join any number
/// of groups. Senders whose receiver is gone are dropped on the next emit.
#[derive(Clone, Default)]
pub struct RecipientHub {
    recipients: Arc<DashMap<String, Vec<Subscriber>>>,
    groups: Arc<DashMap<String, Vec<Subscriber>>>,
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
}

impl RecipientHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `recipient_id` and return its event stream
    pub fn subscribe(
        &self,
        recipient_id: &str,
        connection_id: impl Into<ConnectionId>,
    ) -> mpsc::UnboundedReceiver<LiveEvent> {
        let connection_id = connection_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        // A connection id re-subscribing replaces its previous registration
        if self.connections.contains_key(&connection_id) {
            self.unsubscribe(&connection_id);
        }

        self.recipients
            .entry(recipient_id.to_string())
            .or_default()
            .push(Subscriber {
                connection_id: connection_id.clone(),
                sender: tx.clone(),
            });

        self.connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                recipient_id: recipient_id.to_string(),
                sender: tx,
                groups: Vec::new(),
            },
        );

        info!(
            recipient_id = %recipient_id,
            connection_id = %connection_id,
            "Connection subscribed"
        );

        rx
    }

    /// Add a subscribed connection to `group`. Returns false for unknown connections.
    pub fn join_group(&self, connection_id: &str, group: &str) -> bool {
        let Some(mut entry) = self.connections.get_mut(connection_id) else {
            warn!(connection_id = %connection_id, group = %group, "Join from unknown connection");
            return false;
        };
        if entry.groups.iter().any(|g| g == group) {
            return true;
        }
        entry.groups.push(group.to_string());
        let sender = entry.sender.clone();
        drop(entry);

        self.groups
            .entry(group.to_string())
            .or_default()
            .push(Subscriber {
                connection_id: connection_id.to_string(),
                sender,
            });

        debug!(connection_id = %connection_id, group = %group, "Connection joined group");
        true
    }

    /// Remove a connection from its recipient and every group it joined
    pub fn unsubscribe(&self, connection_id: &str) {
        let Some((_, entry)) = self.connections.remove(connection_id) else {
            warn!(
                connection_id = %connection_id,
                "Attempted to unsubscribe unknown connection"
            );
            return;
        };

        remove_subscriber(&self.recipients, &entry.recipient_id, connection_id);
        for group in &entry.groups {
            remove_subscriber(&self.groups, group, connection_id);
        }

        info!(
            recipient_id = %entry.recipient_id,
            connection_id = %connection_id,
            "Connection unsubscribed"
        );
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Live connections held for `recipient_id`
    #[must_use]
    pub fn recipient_connection_count(&self, recipient_id: &str) -> usize {
        self.recipients.get(recipient_id).map_or(0, |subs| subs.len())
    }

    #[must_use]
    pub fn group_size(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |subs| subs.len())
    }

    fn fan_out(
        &self,
        table: &DashMap<String, Vec<Subscriber>>,
        key: &str,
        event: &str,
        payload: &Value,
    ) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(subscribers) = table.get(key) {
            for subscriber in subscribers.iter() {
                let live_event = LiveEvent {
                    event: event.to_string(),
                    payload: payload.clone(),
                };
                match subscriber.sender.send(live_event) {
                    Ok(()) => sent_count += 1,
                    Err(_) => {
                        warn!(
                            key = %key,
                            connection_id = %subscriber.connection_id,
                            "Connection receiver dropped, marking for cleanup"
                        );
                        failed_connections.push(subscriber.connection_id.clone());
                    }
                }
            }
        }

        for conn_id in failed_connections {
            self.unsubscribe(&conn_id);
        }

        debug!(key = %key, event = %event, sent_count = sent_count, "Live emit complete");
        sent_count
    }
}

fn remove_subscriber(table: &DashMap<String, Vec<Subscriber>>, key: &str, connection_id: &str) {
    if let Some(mut subscribers) = table.get_mut(key) {
        subscribers.retain(|sub| sub.connection_id != connection_id);
        if subscribers.is_empty() {
            drop(subscribers);
            table.remove(key);
        }
    }
}

impl LiveSessionEmitter for RecipientHub {
    fn emit_to(&self, recipient_id: &str, event: &str, payload: &Value) -> usize {
        self.fan_out(&self.recipients, recipient_id, event, payload)
    }

    fn emit_to_group(&self, group: &str, event: &str, payload: &Value) -> usize {
        self.fan_out(&self.groups, group, event, payload)
    }
}
