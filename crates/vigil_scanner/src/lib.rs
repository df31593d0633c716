//! Scan-task orchestration.
//!
//! The orchestrator's worker pool consumes the task stream, and for each
//! task: initializes job state, validates tenant ownership, fetches and
//! extracts the artifact, fans out to the requested scanners in parallel,
//! records per-scanner results as independent state writes, and publishes
//! exactly one completion signal per processing run.

pub mod archive;
pub mod cancel;
pub mod error;
pub mod fetch;
pub mod object_store;
pub mod orchestrator;
pub mod runner;
pub mod scanners;

pub use cancel::CancelWatcher;
pub use error::{FetchError, ScanError};
pub use fetch::{ArtifactFetcher, FetchedArtifact};
pub use object_store::{FsObjectStore, HttpObjectStore, ObjectMeta, ObjectStore};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use runner::{RunOutcome, ScanRunner};
pub use scanners::{
    AvReport, AvScanner, ClamAv, DependencyReport, DependencyScanAdapter, DependencyScanner,
    OsvClient, OsvScannerBinary, ScanContext, ScannerSet, VulnProvider,
};
