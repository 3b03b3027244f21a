//! Event store error types.

use thiserror::Error;

pub type EventStoreResult<T> = Result<T, EventStoreError>;

#[derive(Error, Debug)]
pub enum EventStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}
