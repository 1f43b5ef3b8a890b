//! Errors raised by the grouping engine.

use thiserror::Error;

/// Grouping errors.
///
/// Partial infeasibility inside a solve is never an error; it is reported as
/// `None` by the flow solvers and handled by relaxation or fallback.
#[derive(Debug, Error)]
pub enum FilamentGroupError {
    /// Match mode was requested but no material is loaded in the printer.
    #[error("No filament is loaded in the printer; cannot group in match mode")]
    EmptyAmsFilaments,

    /// Unprintable limits contradict each other.
    #[error("Conflicting unprintable limits: {0}")]
    ConflictLimits(String),

    /// The context is dimensionally inconsistent.
    #[error("Invalid grouping context: {0}")]
    InvalidContext(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for grouping operations.
pub type FilamentGroupResult<T> = Result<T, FilamentGroupError>;
