//! Error types for the Bulwark engine.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Bulwark operations.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected arguments to an administrative operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for BulwarkError {
    fn from(err: config::ConfigError) -> Self {
        BulwarkError::Config(err.to_string())
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
