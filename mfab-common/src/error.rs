//! Common error types for mfab

use thiserror::Error;

/// Common result type for mfab operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the fabrication crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity failed validation at construction time
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unparseable musical value (note, key, chord)
    #[error("Music theory error: {0}")]
    Music(String),
}
