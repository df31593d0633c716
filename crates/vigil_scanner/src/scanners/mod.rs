//! Scanner adapters.
//!
//! Adapters are opaque wrappers over external scanner binaries or services,
//! defined by small traits the runner consumes. Implementations are selected
//! by configuration and injected; nothing above this module knows which
//! binary is behind a trait object.

pub mod clamav;
pub mod dependency;
pub mod osv;
pub mod osv_binary;

pub use clamav::ClamAv;
pub use dependency::{DependencyScanAdapter, PackageCollector};
pub use osv::OsvClient;
pub use osv_binary::OsvScannerBinary;

use crate::error::ScanError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vigil_protocol::{PackageRef, ScannerKind, Vulnerability};

/// Context shared by every scanner in one task: the task's cancellation
/// token. All long operations select against it.
#[derive(Clone)]
pub struct ScanContext {
    cancel: CancellationToken,
}

impl ScanContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// A context with its own never-fired token (CLI one-shots, tests).
    pub fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn check_cancelled(&self) -> Result<(), ScanError> {
        if self.cancel.is_cancelled() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Antivirus family
// ============================================================================

/// Outcome of scanning one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvFileResult {
    pub path: String,
    /// Detection name when infected, `None` when clean.
    pub detection: Option<String>,
}

/// Aggregated antivirus outcome for one artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AvReport {
    pub infected_count: usize,
    pub scanned_count: usize,
    pub detections: Vec<String>,
    /// Infected path -> detection name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub infected_files: HashMap<String, String>,
}

#[async_trait]
pub trait AvScanner: Send + Sync {
    fn name(&self) -> &str;

    /// Availability check (binary present, daemon answering).
    async fn ping(&self) -> Result<(), ScanError>;

    async fn scan_file(&self, ctx: &ScanContext, path: &Path) -> Result<AvFileResult, ScanError>;

    async fn scan_dir(
        &self,
        ctx: &ScanContext,
        path: &Path,
        recursive: bool,
    ) -> Result<AvReport, ScanError>;
}

// ============================================================================
// Dependency family
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DependencyScanOptions {
    /// Skip the per-package cache entirely (forced re-query).
    pub bypass_cache: bool,
}

/// Aggregated dependency-scan outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DependencyReport {
    pub vulnerabilities: Vec<Vulnerability>,
    pub packages_scanned: usize,
    pub cache_hits: usize,
}

#[async_trait]
pub trait DependencyScanner: Send + Sync {
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<(), ScanError>;

    /// Collect packages under `path` and scan them.
    async fn scan_path(
        &self,
        ctx: &ScanContext,
        path: &Path,
        opts: &DependencyScanOptions,
    ) -> Result<DependencyReport, ScanError>;

    /// Scan an explicit package list.
    async fn scan_packages(
        &self,
        ctx: &ScanContext,
        packages: &[PackageRef],
        opts: &DependencyScanOptions,
    ) -> Result<DependencyReport, ScanError>;
}

/// Remote vulnerability source queried for cache misses.
#[async_trait]
pub trait VulnProvider: Send + Sync {
    async fn ping(&self) -> Result<(), ScanError> {
        Ok(())
    }

    /// Vulnerabilities per queried package. Packages absent from the result
    /// map are "known clean".
    async fn query(
        &self,
        packages: &[PackageRef],
    ) -> Result<HashMap<PackageRef, Vec<Vulnerability>>, ScanError>;
}

// ============================================================================
// Configured scanner set
// ============================================================================

/// The scanners this deployment actually runs, selected by configuration.
#[derive(Default, Clone)]
pub struct ScannerSet {
    antivirus: Option<Arc<dyn AvScanner>>,
    dependency: Option<Arc<dyn DependencyScanner>>,
}

impl ScannerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_antivirus(mut self, scanner: Arc<dyn AvScanner>) -> Self {
        self.antivirus = Some(scanner);
        self
    }

    pub fn with_dependency(mut self, scanner: Arc<dyn DependencyScanner>) -> Self {
        self.dependency = Some(scanner);
        self
    }

    pub fn antivirus(&self) -> Option<&Arc<dyn AvScanner>> {
        self.antivirus.as_ref()
    }

    pub fn dependency(&self) -> Option<&Arc<dyn DependencyScanner>> {
        self.dependency.as_ref()
    }

    pub fn is_configured(&self, kind: ScannerKind) -> bool {
        match kind {
            ScannerKind::Antivirus => self.antivirus.is_some(),
            ScannerKind::Dependency => self.dependency.is_some(),
        }
    }
}
