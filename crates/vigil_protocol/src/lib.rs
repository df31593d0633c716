//! Canonical types for the Vigil scan pipeline.
//!
//! Everything that crosses a process boundary is defined here: the task
//! message read off the task stream, the completion payload appended to the
//! completion stream, scanner/job status enums, artifact URIs, and the key
//! composition rules for the shared state store.
//!
//! Crates must not invent their own copies of these shapes - the orchestrator,
//! the updater, and external producers all deserialize against this crate.

pub mod config;
pub mod defaults;
pub mod keys;
pub mod types;
pub mod uri;

// Re-export the canonical types for convenience
pub use config::SystemConfig;
pub use types::{
    CompletionPayload, OverallStatus, PackageRef, ScanStatus, ScannerKind, Severity, TaskError,
    TaskMessage, Vulnerability,
};
pub use uri::{ArtifactUri, UriError};
