//! Error types for coordkit.

use std::time::Duration;

use thiserror::Error;

/// Main error type for coordkit operations.
#[derive(Error, Debug)]
pub enum CoordkitError {
    /// Rejected argument, raised before any store I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the redis client
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Store unreachable or script failed
    #[error("Store error: {0}")]
    Store(String),

    /// A store call exceeded its deadline
    #[error("Store call timed out after {0:?}")]
    StoreTimeout(Duration),

    /// A script returned a code outside the expected set
    #[error("Unknown status code: {0}")]
    UnknownCode(i64),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordkitError {
    /// Whether this error came from talking to the shared store.
    ///
    /// Limiters treat every such error as a rejection.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            CoordkitError::Redis(_)
                | CoordkitError::Store(_)
                | CoordkitError::StoreTimeout(_)
                | CoordkitError::UnknownCode(_)
        )
    }
}

impl From<::config::ConfigError> for CoordkitError {
    fn from(err: ::config::ConfigError) -> Self {
        CoordkitError::Config(err.to_string())
    }
}

/// Result type alias for coordkit operations.
pub type Result<T> = std::result::Result<T, CoordkitError>;
