//! Error types for relaybus.

use thiserror::Error;

/// Boxed error returned by user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("dequeue worker already registered for queue: {0}")]
    DuplicateWorker(String),

    #[error("subscribe listener already registered for topic: {0}")]
    DuplicateListener(String),

    #[error("no worker or listener registered for: {0}")]
    NotFound(String),

    #[error("handler for {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
