//! Parallel scanner fan-out for one artifact.
//!
//! Each requested scanner runs in its own task; a failure in one never
//! cancels the others, and the runner returns only when every scanner has
//! finished (succeeded or failed). The outcome always carries an error map,
//! so partial success is distinguishable from total success.

use crate::error::ScanError;
use crate::scanners::{DependencyScanOptions, ScanContext, ScannerSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vigil_protocol::ScannerKind;

/// Composite outcome: per-scanner results plus a shared error map.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub results: HashMap<ScannerKind, serde_json::Value>,
    pub errors: HashMap<ScannerKind, ScanError>,
}

impl RunOutcome {
    pub fn error_strings(&self) -> HashMap<ScannerKind, String> {
        self.errors
            .iter()
            .map(|(kind, err)| (*kind, err.to_string()))
            .collect()
    }

    /// Scanners whose error was a cancellation rather than a failure.
    pub fn cancelled_scanners(&self) -> Vec<ScannerKind> {
        self.errors
            .iter()
            .filter(|(_, err)| err.is_cancelled())
            .map(|(kind, _)| *kind)
            .collect()
    }
}

#[derive(Clone)]
pub struct ScanRunner {
    scanners: ScannerSet,
}

impl ScanRunner {
    pub fn new(scanners: ScannerSet) -> Self {
        Self { scanners }
    }

    pub fn scanners(&self) -> &ScannerSet {
        &self.scanners
    }

    /// Run every requested scanner against `scan_path` concurrently and
    /// collect all outcomes. Every scanner gets the same context; a context
    /// cancellation propagates to all of them.
    pub async fn run(
        &self,
        ctx: &ScanContext,
        scan_path: &Path,
        requested: &[ScannerKind],
    ) -> RunOutcome {
        let mut handles = Vec::with_capacity(requested.len());
        for kind in requested {
            let kind = *kind;
            let ctx = ctx.clone();
            let path = scan_path.to_path_buf();
            let scanners = self.scanners.clone();
            handles.push((
                kind,
                tokio::spawn(async move { run_one(scanners, ctx, path, kind).await }),
            ));
        }

        let mut outcome = RunOutcome::default();
        for (kind, handle) in handles {
            match handle.await {
                Ok(Ok(value)) => {
                    debug!("Scanner {} finished", kind);
                    outcome.results.insert(kind, value);
                }
                Ok(Err(err)) => {
                    warn!("Scanner {} failed: {}", kind, err);
                    outcome.errors.insert(kind, err);
                }
                Err(join_err) => {
                    warn!("Scanner {} task died: {}", kind, join_err);
                    outcome.errors.insert(
                        kind,
                        ScanError::Process(format!("scanner task panicked: {}", join_err)),
                    );
                }
            }
        }
        outcome
    }
}

async fn run_one(
    scanners: ScannerSet,
    ctx: ScanContext,
    path: PathBuf,
    kind: ScannerKind,
) -> Result<serde_json::Value, ScanError> {
    match kind {
        ScannerKind::Antivirus => {
            let scanner = scanners
                .antivirus()
                .ok_or(ScanError::NotConfigured("antivirus"))?;
            let report = if path.is_file() {
                let file = scanner.scan_file(&ctx, &path).await?;
                let infected = file.detection.is_some();
                crate::scanners::AvReport {
                    infected_count: usize::from(infected),
                    scanned_count: 1,
                    detections: file.detection.clone().into_iter().collect(),
                    infected_files: file
                        .detection
                        .map(|name| HashMap::from([(file.path, name)]))
                        .unwrap_or_default(),
                }
            } else {
                scanner.scan_dir(&ctx, &path, true).await?
            };
            serde_json::to_value(report)
                .map_err(|err| ScanError::Parse(format!("report serialization: {}", err)))
        }
        ScannerKind::Dependency => {
            let scanner = scanners
                .dependency()
                .ok_or(ScanError::NotConfigured("dependency"))?;
            let report = scanner
                .scan_path(&ctx, &path, &DependencyScanOptions::default())
                .await?;
            serde_json::to_value(report)
                .map_err(|err| ScanError::Parse(format!("report serialization: {}", err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanners::{
        AvFileResult, AvReport, AvScanner, DependencyReport, DependencyScanner,
    };
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use vigil_protocol::PackageRef;

    struct StubAv {
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl AvScanner for StubAv {
        fn name(&self) -> &str {
            "stub-av"
        }

        async fn ping(&self) -> Result<(), ScanError> {
            Ok(())
        }

        async fn scan_file(
            &self,
            _ctx: &ScanContext,
            path: &Path,
        ) -> Result<AvFileResult, ScanError> {
            Ok(AvFileResult {
                path: path.display().to_string(),
                detection: None,
            })
        }

        async fn scan_dir(
            &self,
            ctx: &ScanContext,
            _path: &Path,
            _recursive: bool,
        ) -> Result<AvReport, ScanError> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancel_token().cancelled() => return Err(ScanError::Cancelled),
            }
            if self.fail {
                return Err(ScanError::Process("stub av failure".to_string()));
            }
            Ok(AvReport {
                infected_count: 0,
                scanned_count: 3,
                detections: vec![],
                infected_files: HashMap::new(),
            })
        }
    }

    struct StubDep;

    #[async_trait]
    impl DependencyScanner for StubDep {
        fn name(&self) -> &str {
            "stub-dep"
        }

        async fn ping(&self) -> Result<(), ScanError> {
            Ok(())
        }

        async fn scan_path(
            &self,
            _ctx: &ScanContext,
            _path: &Path,
            _opts: &DependencyScanOptions,
        ) -> Result<DependencyReport, ScanError> {
            Ok(DependencyReport {
                vulnerabilities: vec![],
                packages_scanned: 1,
                cache_hits: 0,
            })
        }

        async fn scan_packages(
            &self,
            _ctx: &ScanContext,
            packages: &[PackageRef],
            _opts: &DependencyScanOptions,
        ) -> Result<DependencyReport, ScanError> {
            Ok(DependencyReport {
                vulnerabilities: vec![],
                packages_scanned: packages.len(),
                cache_hits: 0,
            })
        }
    }

    fn both(fail_av: bool) -> ScanRunner {
        ScanRunner::new(
            ScannerSet::new()
                .with_antivirus(Arc::new(StubAv {
                    fail: fail_av,
                    delay: Duration::from_millis(10),
                }))
                .with_dependency(Arc::new(StubDep)),
        )
    }

    #[tokio::test]
    async fn all_scanners_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = both(false);
        let outcome = runner
            .run(
                &ScanContext::detached(),
                dir.path(),
                &[ScannerKind::Antivirus, ScannerKind::Dependency],
            )
            .await;
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.results[&ScannerKind::Antivirus]["scanned_count"], 3);
    }

    #[tokio::test]
    async fn one_failure_does_not_cancel_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let runner = both(true);
        let outcome = runner
            .run(
                &ScanContext::detached(),
                dir.path(),
                &[ScannerKind::Antivirus, ScannerKind::Dependency],
            )
            .await;
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results.contains_key(&ScannerKind::Dependency));
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors.contains_key(&ScannerKind::Antivirus));
        assert!(outcome.error_strings()[&ScannerKind::Antivirus].contains("stub av failure"));
    }

    #[tokio::test]
    async fn unconfigured_scanner_errors_locally() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScanRunner::new(ScannerSet::new().with_dependency(Arc::new(StubDep)));
        let outcome = runner
            .run(
                &ScanContext::detached(),
                dir.path(),
                &[ScannerKind::Antivirus, ScannerKind::Dependency],
            )
            .await;
        assert!(outcome.results.contains_key(&ScannerKind::Dependency));
        assert!(matches!(
            outcome.errors[&ScannerKind::Antivirus],
            ScanError::NotConfigured(_)
        ));
    }

    #[tokio::test]
    async fn cancellation_propagates_to_all() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScanRunner::new(ScannerSet::new().with_antivirus(Arc::new(StubAv {
            fail: false,
            delay: Duration::from_secs(30),
        })));
        let token = tokio_util::sync::CancellationToken::new();
        let ctx = ScanContext::new(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let outcome = runner
            .run(&ctx, dir.path(), &[ScannerKind::Antivirus])
            .await;
        assert_eq!(outcome.cancelled_scanners(), vec![ScannerKind::Antivirus]);
        canceller.await.unwrap();
    }
}
