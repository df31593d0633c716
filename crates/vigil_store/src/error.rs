//! Store error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// XREADGROUP against a stream or group that no longer exists. The
    /// consumer treats this as a self-heal trigger, not a failure.
    #[error("no such consumer group '{group}' on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("state store connection error: {0}")]
    Connection(String),

    #[error("state store error: {0}")]
    Backend(String),

    #[error("unsupported store url: '{0}' (expected redis://... or memory:)")]
    InvalidUrl(String),

    #[error("state payload serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_no_group(&self) -> bool {
        matches!(self, StoreError::NoGroup { .. })
    }
}
