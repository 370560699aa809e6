//! Error types for mfab-engine
//!
//! Craft, dub and ingest failures are recoverable: the scheduler reverts the
//! segment (craft) or leaves it for retry (dub) and requeues the chain.

use mfab_common::models::SegmentState;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for mfab-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Content snapshot lacks what a craft phase requires
    #[error("Ingest error: {0}")]
    Ingest(String),

    /// A craft phase could not complete
    #[error("Craft error: {0}")]
    Craft(String),

    /// Picking or shipping failed
    #[error("Dub error: {0}")]
    Dub(String),

    /// Entity rejected at construction
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Lifecycle move not permitted by the segment state machine
    #[error("Invalid transition of segment {segment_id}: {from} -> {to}")]
    InvalidTransition {
        segment_id: Uuid,
        from: SegmentState,
        to: SegmentState,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Work stopped by shutdown; not a failure
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Common(mfab_common::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Failures handled by revert-and-requeue rather than surfaced as faults
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Ingest(_) | Error::Craft(_) | Error::Dub(_) | Error::Timeout(_)
        )
    }
}

impl From<mfab_common::Error> for Error {
    fn from(err: mfab_common::Error) -> Self {
        match err {
            mfab_common::Error::Validation(msg) => Error::Validation(msg),
            mfab_common::Error::NotFound(msg) => Error::NotFound(msg),
            other => Error::Common(other),
        }
    }
}

/// Convenience Result type using mfab-engine Error
pub type Result<T> = std::result::Result<T, Error>;
