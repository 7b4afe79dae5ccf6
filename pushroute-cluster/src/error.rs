//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Push error: {0}")]
    Push(String),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
