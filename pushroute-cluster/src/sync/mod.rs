//! Recipient sessions, routed events and the process-wide cluster service

pub mod events;
pub mod heartbeat_listener;
pub mod push_cluster;
pub mod recipient_hub;
pub mod route_publisher;
pub mod session_tracker;

pub use events::{RoutedEvent, SOCKET_CONNECT_PATH, SOCKET_DISCONNECT_PATH};
pub use heartbeat_listener::HeartbeatListener;
pub use push_cluster::{default_offline_push, PushCluster};
pub use recipient_hub::{ConnectionId, LiveEvent, LiveSessionEmitter, RecipientHub};
pub use route_publisher::{generate_sequence_id, RoutePublisher, SEQUENCE_ID_LEN};
pub use session_tracker::{
    ConnectOutcome, DisconnectOutcome, SessionTracker, DEFAULT_SESSION_TTL,
};
