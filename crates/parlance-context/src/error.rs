//! Error types for context management

use thiserror::Error;

/// Context management error type
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid context limits: {0}")]
    InvalidLimits(String),

    #[error("Invalid history: {0}")]
    InvalidHistory(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;
