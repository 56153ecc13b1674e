//! Automation Engine Error Types

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, MacroError>;

/// Automation engine errors
#[derive(Debug, Error)]
pub enum MacroError {
    /// Macro or execution not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid macro configuration (malformed trigger/action, unresolved variable)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Execution error
    #[error("Execution error: {0}")]
    Execution(String),

    /// Action execution error
    #[error("Action error: {0}")]
    Action(String),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Permission denied for the requesting user
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Rate limit exhausted for (macro, origin)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// No suspended execution for the given resume token
    #[error("No suspended execution: {0}")]
    NotSuspended(String),
}

impl From<sqlx::Error> for MacroError {
    fn from(err: sqlx::Error) -> Self {
        MacroError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for MacroError {
    fn from(err: serde_json::Error) -> Self {
        MacroError::Serialization(err.to_string())
    }
}
