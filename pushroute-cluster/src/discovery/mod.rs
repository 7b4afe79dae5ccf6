//! Worker discovery and recipient routing

pub mod heartbeat_registry;
pub mod router;

pub use heartbeat_registry::{
    EvictedServer, HeartbeatMessage, HeartbeatRegistry, HeartbeatResult, ServerRecord,
    DEFAULT_STALE_AFTER,
};
pub use router::{recipient_hash, RouteTarget, Router};
