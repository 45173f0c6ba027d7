//! Error types for Slidegate.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Slidegate operations.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Window is zero, below millisecond resolution, or too large
    #[error("Invalid window {0:?}: must be between 1ms and i64::MAX ms")]
    InvalidWindow(Duration),

    /// Limit must allow at least one permit
    #[error("Invalid limit {0}: must be at least 1")]
    InvalidLimit(u64),

    /// Permit count must be at least one
    #[error("Invalid permit count {0}: must be at least 1")]
    InvalidPermitCount(u32),

    /// No rule with this name and no default rule configured
    #[error("Unknown limit rule: {0}")]
    UnknownRule(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlidegateError {
    /// Whether this error is a local caller contract violation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SlidegateError::InvalidWindow(_)
                | SlidegateError::InvalidLimit(_)
                | SlidegateError::InvalidPermitCount(_)
                | SlidegateError::UnknownRule(_)
        )
    }
}

/// Result type alias for Slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;
