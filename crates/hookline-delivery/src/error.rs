//! Error types for the delivery pipeline.
//!
//! Transport-level failures are not errors here; the dispatcher reports
//! them as data (`DispatchOutcome`) because a refused connection is a
//! normal delivery result. `DeliveryError` covers the failures of the
//! pipeline itself.

use hookline_core::error::CoreError;
use thiserror::Error;

/// Result type alias using `DeliveryError`.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failures of the delivery pipeline machinery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Storage operation failed.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// Webhook URL failed validation at enqueue time.
    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),

    /// Component configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The job queue refused a submission, typically during shutdown.
    #[error("job queue closed")]
    QueueClosed,
}

impl DeliveryError {
    /// Creates an invalid URL error.
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl(message.into())
    }
}
