use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Path of the event published when a recipient first connects
pub const SOCKET_CONNECT_PATH: &str = "/socketConnect";

/// Path of the event published when a recipient's current connection closes
pub const SOCKET_DISCONNECT_PATH: &str = "/socketDisconnect";

/// Event forwarded to the worker owning `path` for `push_id`
///
/// Wire shape: `{"path", "pushId", "sequenceId", "uid"?, ...}`. Fields the
/// router does not know about are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedEvent {
    pub path: String,
    #[serde(rename = "pushId")]
    pub push_id: String,
    #[serde(rename = "sequenceId", default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RoutedEvent {
    pub fn new(path: impl Into<String>, push_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            push_id: push_id.into(),
            sequence_id: None,
            uid: None,
            extra: Map::new(),
        }
    }

    /// "connected" notification for a recipient
    pub fn connected(push_id: impl Into<String>, uid: Option<&str>) -> Self {
        Self::new(SOCKET_CONNECT_PATH, push_id).with_uid(uid)
    }

    /// "disconnected" notification for a recipient
    pub fn disconnected(push_id: impl Into<String>, uid: Option<&str>) -> Self {
        Self::new(SOCKET_DISCONNECT_PATH, push_id).with_uid(uid)
    }

    #[must_use]
    pub fn with_uid(mut self, uid: Option<&str>) -> Self {
        self.uid = uid.filter(|u| !u.is_empty()).map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_sequence_id(mut self, sequence_id: impl Into<String>) -> Self {
        self.sequence_id = Some(sequence_id.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}
