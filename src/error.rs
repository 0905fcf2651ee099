//! Centralized error types for whisper-dispatch

use thiserror::Error;

/// Dispatch error types
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Configuration is missing or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// A queue message or store notification could not be parsed
    #[error("Malformed notification: {0}")]
    Notification(String),

    /// Object store call failed
    #[error("Object store error: {0}")]
    Store(String),

    /// Inference endpoint rejected or failed a submission
    #[error("Inference endpoint error: {0}")]
    Endpoint(String),

    /// Queue receive/acknowledge failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// Backlog metric could not be read
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Capacity change could not be applied
    #[error("Scaling error: {0}")]
    Scaling(String),

    /// Registry credential exchange failed
    #[error("Registry error: {0}")]
    Registry(String),

    /// Work exceeded its wall-clock budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, DispatchError>;
