//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing an opaque ID from a wire value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The integer value is not a valid ID (must be positive).
    #[error("invalid ID value: {0} (must be a positive integer)")]
    NotPositive(i64),

    /// The string could not be parsed as an integer.
    #[error("invalid ID format: {0}")]
    InvalidFormat(String),
}
