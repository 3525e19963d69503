//! Common error types for the readout host
//!
//! # Design Principles (KISS)
//! - Provide common error variants used across multiple components
//! - Each component can wrap these or define additional variants
//! - Use thiserror for ergonomic error handling

use thiserror::Error;

/// Common errors shared across the readout pipeline
///
/// These represent common failure modes of the data path. Components can
/// either use these directly or wrap them in component-specific types.
#[derive(Error, Debug)]
pub enum DaqError {
    /// I/O error (file operations, sink writes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Component not in expected state
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Timeout waiting for operation
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl DaqError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Result type alias using DaqError
pub type DaqResult<T> = Result<T, DaqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error() {
        let err = DaqError::config("missing required field");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("missing required field"));
    }

    #[test]
    fn test_invalid_state_error() {
        let err = DaqError::invalid_state("Running", "Idle");
        let msg = err.to_string();
        assert!(msg.contains("Running"));
        assert!(msg.contains("Idle"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DaqError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_timeout_error() {
        let err = DaqError::timeout("waiting for boards to stop");
        assert!(err.to_string().contains("timed out"));
    }
}
