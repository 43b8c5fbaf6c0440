//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the dash separator.
    #[error("ID missing '-' separator")]
    MissingSeparator,

    /// The suffix contains characters outside lowercase hex.
    #[error("invalid hex suffix: {0}")]
    InvalidHex(String),

    /// The suffix has an unsupported length.
    #[error("invalid hex suffix length {actual}, expected 8 or 17")]
    InvalidLength { actual: usize },
}
