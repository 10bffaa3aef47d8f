//! Error types for event distribution

use thiserror::Error;

/// Errors that can occur while distributing events
#[derive(Debug, Error)]
pub enum RelayError {
    /// An envelope could not be persisted
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A payload could not be produced or reconstructed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// HTTP-level failure while polling or submitting
    #[error("transport error: {0}")]
    Transport(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type for distribution operations
pub type RelayResult<T> = Result<T, RelayError>;

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}
