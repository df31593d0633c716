//! Error taxonomy for fetch and scan operations.
//!
//! A `ScanError` is always local to one scanner: the runner records it and
//! the other scanners proceed. Only `FetchError`s (and validation failures
//! before them) fail the whole task.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vigil_protocol::UriError;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Uri(#[from] UriError),

    #[error("object fetch failed: {0}")]
    Object(String),

    #[error("artifact checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("archive extraction failed for {path}: {reason}")]
    Archive { path: PathBuf, reason: String },

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanner binary not found: {0}")]
    BinaryMissing(String),

    #[error("scanner not configured: {0}")]
    NotConfigured(&'static str),

    #[error("scan cancelled")]
    Cancelled,

    #[error("scan deadline exceeded after {0:?}")]
    Timeout(Duration),

    #[error("scanner process failed: {0}")]
    Process(String),

    #[error("scanner output unparseable: {0}")]
    Parse(String),

    #[error("scan I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("signature engine error: {0}")]
    Signatures(#[from] vigil_signatures::SignatureError),

    #[error("vulnerability cache error: {0}")]
    Cache(#[from] vigil_cache::CacheError),

    #[error("vulnerability provider error: {0}")]
    Provider(String),

    #[error("required data source not ready: {0}")]
    SourceNotReady(String),
}

impl ScanError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanError::Cancelled)
    }
}
