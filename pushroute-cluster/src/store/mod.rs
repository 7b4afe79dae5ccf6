//! Key-value store and broadcast bus seams
//!
//! The router only needs a handful of primitives from its backing store.
//! [`RedisStore`] implements both traits against a shared Redis deployment;
//! [`MemoryStore`] implements them in-process for single-node mode and tests.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use memory::{BusMessage, MemoryStore};
pub use redis_store::RedisStore;

/// String keys with expiry plus a single-level hash
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// SET followed by EXPIRE, applied as one operation
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Fetch N keys at once; the result has exactly N entries in key order
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>>;
}

/// Publish side of the broadcast bus
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Returns the number of subscribers that received the message
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;
}
