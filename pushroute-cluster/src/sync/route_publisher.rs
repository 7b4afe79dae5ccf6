use std::sync::Arc;
use tracing::debug;

use super::events::RoutedEvent;
use crate::discovery::{RouteTarget, Router};
use crate::error::{Error, Result};
use crate::store::MessageBus;

/// Length of generated sequence ids
pub const SEQUENCE_ID_LEN: usize = 16;

const ALPHANUMERIC: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H',
    'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Random alphanumeric id the receiving worker uses for idempotency and tracing
#[must_use]
pub fn generate_sequence_id() -> String {
    nanoid::nanoid!(SEQUENCE_ID_LEN, &ALPHANUMERIC)
}

/// Publishes routed events on the owning worker's channel
pub struct RoutePublisher {
    router: Router,
    bus: Arc<dyn MessageBus>,
    route_prefix: String,
    default_channel: String,
}

impl RoutePublisher {
    pub fn new(
        router: Router,
        bus: Arc<dyn MessageBus>,
        route_prefix: impl Into<String>,
        default_channel: impl Into<String>,
    ) -> Self {
        Self {
            router,
            bus,
            route_prefix: route_prefix.into(),
            default_channel: default_channel.into(),
        }
    }

    #[must_use]
    pub const fn router(&self) -> &Router {
        &self.router
    }

    /// Route and publish `event`.
    ///
    /// Events without a `path` or `pushId` are rejected before anything is
    /// published. A missing `sequenceId` is generated. When no worker is
    /// known for the path the event goes to the default channel.
    pub async fn publish(&self, mut event: RoutedEvent) -> Result<RouteTarget> {
        if event.path.is_empty() || event.push_id.is_empty() {
            return Err(Error::InvalidEvent(
                "routed events need both path and pushId".to_string(),
            ));
        }

        if event.sequence_id.as_deref().is_none_or(str::is_empty) {
            event.sequence_id = Some(generate_sequence_id());
        }

        let target = self.router.select_server(&event.path, &event.push_id);
        let channel = target.channel(&self.route_prefix, &self.default_channel);
        let payload = serde_json::to_string(&event)?;

        let receivers = self.bus.publish(&channel, &payload).await?;

        debug!(
            channel = %channel,
            path = %event.path,
            push_id = %event.push_id,
            receivers = receivers,
            "Routed event published"
        );

        Ok(target)
    }
}
