//! Notification fan-out: live sockets first, offline push for the rest
//!
//! [`NotificationDispatcher`] emits on the live-session layer and hands the
//! device tokens it can resolve to an [`OfflinePush`] implementation in one
//! batch. [`ApnsConnection`] is the production implementation; per-token
//! failures come back through a [`PushErrorCallback`], and
//! [`PushErrorCode::InvalidToken`] is what triggers token invalidation.

pub mod apns;
pub mod device_tokens;
pub mod dispatcher;
pub mod notification;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub use apns::ApnsConnection;
pub use device_tokens::{DeviceTokenRegistry, DEFAULT_TOKEN_TTL};
pub use dispatcher::{
    DispatchSummary, NotificationDispatcher, BROADCAST_GROUP, DEFAULT_NOTIFICATION_TTL,
    NOTIFICATION_EVENT,
};
pub use notification::{ApnFields, Notification, PushNotification};

/// Reported once per token the offline-push service rejected
pub type PushErrorCallback = Arc<dyn Fn(PushErrorCode, &str) + Send + Sync>;

/// Platform offline-push capability
#[async_trait]
pub trait OfflinePush: Send + Sync {
    /// Queue `notification` for every token and return without waiting for delivery
    async fn push(&self, notification: &PushNotification, tokens: &[String]);

    /// Stop accepting pushes and wait for the ones in flight
    async fn shutdown(&self) {}
}

/// Per-token failure codes, numbered as the legacy APNs binary protocol did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushErrorCode {
    ProcessingError = 1,
    MissingDeviceToken = 2,
    MissingTopic = 3,
    MissingPayload = 4,
    InvalidTokenSize = 5,
    InvalidTopicSize = 6,
    InvalidPayloadSize = 7,
    /// The token is permanently rejected and should be forgotten
    InvalidToken = 8,
    Shutdown = 10,
    Unknown = 255,
}

impl PushErrorCode {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Map an HTTP/2 APNs rejection to a code
    #[must_use]
    pub fn from_response(status: u16, reason: Option<&str>) -> Self {
        match reason {
            Some("BadDeviceToken" | "Unregistered" | "DeviceTokenNotForTopic") => {
                return Self::InvalidToken;
            }
            Some("MissingDeviceToken") => return Self::MissingDeviceToken,
            Some("MissingTopic" | "BadTopic" | "TopicDisallowed") => return Self::MissingTopic,
            Some("PayloadEmpty") => return Self::MissingPayload,
            Some("PayloadTooLarge") => return Self::InvalidPayloadSize,
            Some("Shutdown") => return Self::Shutdown,
            _ => {}
        }

        match status {
            410 => Self::InvalidToken,
            413 => Self::InvalidPayloadSize,
            500 => Self::ProcessingError,
            503 => Self::Shutdown,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for PushErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Offline push when no platform credentials are configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPush;

#[async_trait]
impl OfflinePush for DisabledPush {
    async fn push(&self, _notification: &PushNotification, tokens: &[String]) {
        debug!(tokens = tokens.len(), "Offline push disabled, dropping notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_token_reasons() {
        for reason in ["BadDeviceToken", "Unregistered", "DeviceTokenNotForTopic"] {
            assert_eq!(
                PushErrorCode::from_response(400, Some(reason)),
                PushErrorCode::InvalidToken
            );
        }
        assert_eq!(
            PushErrorCode::from_response(410, None),
            PushErrorCode::InvalidToken
        );
        assert_eq!(PushErrorCode::InvalidToken.code(), 8);
    }

    #[test]
    fn test_other_rejections() {
        assert_eq!(
            PushErrorCode::from_response(413, Some("PayloadTooLarge")),
            PushErrorCode::InvalidPayloadSize
        );
        assert_eq!(
            PushErrorCode::from_response(400, Some("MissingTopic")),
            PushErrorCode::MissingTopic
        );
        assert_eq!(
            PushErrorCode::from_response(503, None),
            PushErrorCode::Shutdown
        );
        assert_eq!(
            PushErrorCode::from_response(429, Some("TooManyRequests")),
            PushErrorCode::Unknown
        );
        assert_eq!(PushErrorCode::Unknown.to_string(), "Unknown(255)");
    }
}
