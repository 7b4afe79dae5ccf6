//! Push-event routing for a fleet of real-time workers
//!
//! Workers announce the delivery paths they own over a heartbeat channel;
//! events for a recipient are routed to one of those workers, sessions are
//! tracked so connect and disconnect are announced once, and notifications
//! fall back to offline push through device tokens.

pub mod discovery;
pub mod error;
pub mod push;
pub mod store;
pub mod sync;

pub use discovery::{HeartbeatRegistry, RouteTarget, Router};
pub use error::{Error, Result};
pub use push::{
    ApnsConnection, DeviceTokenRegistry, DispatchSummary, Notification, NotificationDispatcher,
    OfflinePush, PushErrorCallback, PushErrorCode, PushNotification,
};
pub use store::{KeyValueStore, MemoryStore, MessageBus, RedisStore};
pub use sync::{
    ConnectOutcome, DisconnectOutcome, HeartbeatListener, LiveSessionEmitter, PushCluster,
    RecipientHub, RoutePublisher, RoutedEvent, SessionTracker,
};
