//! Error types for the signature engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SignatureError>;

#[derive(Debug, Error)]
pub enum SignatureError {
    /// Store open failure. Fatal at engine construction.
    #[error("Failed to open signature store: {0}")]
    Open(sqlx::Error),

    /// Store read/write failure at run time. Surfaces to the caller as the
    /// lookup error status; never downgraded to a clean verdict.
    #[error("Signature store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Invalid content hash '{value}': {reason}")]
    InvalidHash { value: String, reason: &'static str },

    /// A stored row that no longer parses (bad severity, truncated hash).
    #[error("Corrupt signature record: {field} = '{value}'")]
    Corrupt { field: &'static str, value: String },
}
