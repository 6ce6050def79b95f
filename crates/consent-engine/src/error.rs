use std::fmt;

/// Unified error type for the consent engine.
#[derive(Debug, Clone)]
pub enum ConsentError {
    /// Invalid input provided by the caller.
    InvalidInput(String),
    /// Persistent storage failure.
    Storage(String),
    /// Remote endpoint failure.
    Remote(String),
}

impl fmt::Display for ConsentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsentError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ConsentError::Storage(msg) => write!(f, "storage error: {msg}"),
            ConsentError::Remote(msg) => write!(f, "remote error: {msg}"),
        }
    }
}

impl std::error::Error for ConsentError {}

/// Result type alias using [`ConsentError`].
pub type ConsentResult<T> = Result<T, ConsentError>;
