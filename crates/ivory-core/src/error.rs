//! Error types for ivory-core
//!
//! Every public operation returns `Result<T, CoreError>`. The error is `Clone`
//! because a single in-flight computation hands the same result to every
//! caller waiting on it.

use thiserror::Error;

/// Core error type for ivory operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    // ===================
    // Input Errors
    // ===================
    /// Malformed request parameter, rejected before any aggregation runs
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    // ===================
    // Compute Errors
    // ===================
    /// Arithmetic or invariant violation inside an aggregation
    #[error("Computation failed: {message}")]
    Compute { message: String },

    // ===================
    // Store Errors
    // ===================
    #[error("Event store query {operation} failed: {message}")]
    StoreQuery {
        operation: &'static str,
        message: String,
    },

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl CoreError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute {
            message: message.into(),
        }
    }

    /// Wrap an adapter failure, keeping the full `anyhow` context chain
    pub fn store(operation: &'static str, error: anyhow::Error) -> Self {
        Self::StoreQuery {
            operation,
            message: format!("{:#}", error),
        }
    }

    /// Returns true for errors caused by the caller's input
    pub fn is_validation(&self) -> bool {
        matches!(self, CoreError::Validation { .. })
    }
}
