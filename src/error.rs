//! Error types for the Authguard service.

use thiserror::Error;

use crate::ratelimit::ConfigError;

/// Main error type for Authguard operations.
#[derive(Error, Debug)]
pub enum AuthguardError {
    /// Service settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// The rate limiter document failed validation
    #[error(transparent)]
    InvalidRules(#[from] ConfigError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for AuthguardError {
    fn from(e: config::ConfigError) -> Self {
        AuthguardError::Config(e.to_string())
    }
}

/// Result type alias for Authguard operations.
pub type Result<T> = std::result::Result<T, AuthguardError>;
