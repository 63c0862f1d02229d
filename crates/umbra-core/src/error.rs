//! Error types for the renderer.

use thiserror::Error;

/// Renderer-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
