//! Error types for stepflux

use thiserror::Error;

/// Errors surfaced to the lifecycle host
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("No usable user identity; tracking not started")]
    MissingIdentity,

    #[error("Sensor event received before tracking was started")]
    NotStarted,

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by a persistence collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store document is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store worker has shut down")]
    Closed,
}
