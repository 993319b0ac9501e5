//! PolyVox Error Definitions
//!
//! Defines error types used throughout the orchestration core.

use thiserror::Error;

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Service Outcomes
    // =========================================================================
    #[error("Service not configured: {0}")]
    NotConfigured(String),

    #[error("Transient service error: {0}")]
    TransientService(String),

    #[error("Permanent service error: {0}")]
    PermanentService(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Review Errors
    // =========================================================================
    #[error("Review cancelled: {0}")]
    ReviewCancelled(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Whether a retry can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::TransientService(_) | CoreError::Timeout(_)
        )
    }
}
