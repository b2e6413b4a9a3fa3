//! Storage errors.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`ChatStore`](crate::ChatStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected or failed a statement.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored JSON column could not be decoded.
    #[error("corrupt attributes: {0}")]
    Json(#[from] serde_json::Error),

    /// The call did not finish before its deadline.
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether this error was a deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

/// Result alias for storage calls.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
