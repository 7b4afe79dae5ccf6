use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Sound used when a notification does not name one
pub const DEFAULT_SOUND: &str = "default";

/// Offline-push fields carried inside a notification under `apn`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApnFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    /// String or alert dictionary, passed through as given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Notification as handed to the dispatcher
///
/// Everything except `apn` is live payload and reaches sockets untouched;
/// `apn` is also forwarded so clients see the same object either way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apn: Option<ApnFields>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Notification {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { apn: None, fields }
    }

    #[must_use]
    pub fn with_apn(mut self, apn: ApnFields) -> Self {
        self.apn = Some(apn);
        self
    }

    /// JSON object emitted on live sockets
    #[must_use]
    pub fn to_live_payload(&self) -> Value {
        let mut object = self.fields.clone();
        if let Some(apn) = &self.apn {
            let mut apn_object = Map::new();
            if let Some(badge) = apn.badge {
                apn_object.insert("badge".to_string(), Value::from(badge));
            }
            if let Some(sound) = &apn.sound {
                apn_object.insert("sound".to_string(), Value::from(sound.as_str()));
            }
            if let Some(alert) = &apn.alert {
                apn_object.insert("alert".to_string(), alert.clone());
            }
            if let Some(payload) = &apn.payload {
                apn_object.insert("payload".to_string(), payload.clone());
            }
            object.insert("apn".to_string(), Value::Object(apn_object));
        }
        Value::Object(object)
    }

    /// Build the platform notification, expiring `ttl` after `now_unix_secs`
    #[must_use]
    pub fn to_push_notification(&self, now_unix_secs: i64, ttl: Duration) -> PushNotification {
        let apn = self.apn.clone().unwrap_or_default();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        PushNotification {
            badge: apn.badge,
            sound: apn
                .sound
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SOUND.to_string()),
            alert: apn.alert,
            expiry: now_unix_secs.saturating_add(ttl_secs),
            payload: apn
                .payload
                .unwrap_or_else(|| Value::Object(Map::new())),
        }
    }
}

/// Platform notification sent to every resolved device token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub badge: Option<u32>,
    pub sound: String,
    pub alert: Option<Value>,
    /// Unix seconds after which the platform may drop the notification
    pub expiry: i64,
    pub payload: Value,
}
