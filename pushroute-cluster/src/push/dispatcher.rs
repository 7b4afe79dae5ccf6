use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::device_tokens::DeviceTokenRegistry;
use super::notification::Notification;
use super::OfflinePush;
use crate::sync::LiveSessionEmitter;

/// Event name notifications are emitted under on live sockets
pub const NOTIFICATION_EVENT: &str = "noti";

/// Group every socket subscribed to broadcasts joins
pub const BROADCAST_GROUP: &str = "noti";

/// Default lifetime of an offline notification
pub const DEFAULT_NOTIFICATION_TTL: Duration = Duration::from_secs(600);

/// What a dispatch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Live connections the notification was written to
    pub live_deliveries: usize,
    /// Device tokens handed to the offline-push service
    pub offline_tokens: usize,
}

/// Delivers notifications on live sockets and through offline push
///
/// The live emit always happens, whether or not the recipient is connected;
/// offline push goes to every token that resolves. A client that is online
/// and has a token receives both.
pub struct NotificationDispatcher {
    tokens: Arc<DeviceTokenRegistry>,
    push: Arc<dyn OfflinePush>,
    notification_ttl: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        tokens: Arc<DeviceTokenRegistry>,
        push: Arc<dyn OfflinePush>,
        notification_ttl: Duration,
    ) -> Self {
        Self {
            tokens,
            push,
            notification_ttl,
        }
    }

    #[must_use]
    pub fn offline_push(&self) -> &Arc<dyn OfflinePush> {
        &self.push
    }

    /// Notify each of `recipient_ids`
    pub async fn notify(
        &self,
        recipient_ids: &[String],
        notification: &Notification,
        emitter: &dyn LiveSessionEmitter,
    ) -> DispatchSummary {
        let payload = notification.to_live_payload();
        let live_deliveries = recipient_ids
            .iter()
            .map(|id| emitter.emit_to(id, NOTIFICATION_EVENT, &payload))
            .sum();

        let tokens: Vec<String> = self
            .tokens
            .resolve_tokens(recipient_ids)
            .await
            .into_iter()
            .collect();

        let offline_tokens = self.push_to(notification, &tokens).await;

        debug!(
            recipients = recipient_ids.len(),
            live_deliveries = live_deliveries,
            offline_tokens = offline_tokens,
            "Notification dispatched"
        );

        DispatchSummary {
            live_deliveries,
            offline_tokens,
        }
    }

    /// Notify every subscribed socket and every known device
    pub async fn notify_all(
        &self,
        notification: &Notification,
        emitter: &dyn LiveSessionEmitter,
    ) -> DispatchSummary {
        let payload = notification.to_live_payload();
        let live_deliveries = emitter.emit_to_group(BROADCAST_GROUP, NOTIFICATION_EVENT, &payload);

        let tokens = self.tokens.all_tokens().await;
        let offline_tokens = self.push_to(notification, &tokens).await;

        info!(
            live_deliveries = live_deliveries,
            offline_tokens = offline_tokens,
            "Broadcast notification dispatched"
        );

        DispatchSummary {
            live_deliveries,
            offline_tokens,
        }
    }

    async fn push_to(&self, notification: &Notification, tokens: &[String]) -> usize {
        if tokens.is_empty() {
            return 0;
        }
        let push_notification =
            notification.to_push_notification(chrono::Utc::now().timestamp(), self.notification_ttl);
        self.push.push(&push_notification, tokens).await;
        tokens.len()
    }
}
