//! Structured error types for cladecast.

use thiserror::Error;

/// Unified error type for all cladecast operations.
#[derive(Debug, Error)]
pub enum CladecastError {
    /// Invalid input (non-monophyletic tip sets, bad indices, empty forests)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation not supported on this tree layer
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Internal consistency violation (a logic bug, not a runtime condition)
    #[error("internal consistency error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout cladecast.
pub type Result<T> = std::result::Result<T, CladecastError>;
