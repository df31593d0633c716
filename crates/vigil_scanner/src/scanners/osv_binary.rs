//! Local dependency scanner binary (`osv-scanner`).
//!
//! The second form of the dependency family: instead of collecting packages
//! and querying a remote service, the vendor binary walks the tree itself
//! and reports findings as JSON on stdout. Exit-code disposition follows the
//! tool's convention: 0 = no findings, 1 = findings present (not a
//! failure), anything else = scanner failure.

use super::{
    DependencyReport, DependencyScanOptions, DependencyScanner, ScanContext,
};
use crate::error::ScanError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use vigil_protocol::{PackageRef, Vulnerability};

const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const PING_TIMEOUT: Duration = Duration::from_secs(10);

// The slice of the tool's JSON output the pipeline consumes.

#[derive(Deserialize, Default)]
struct BinaryOutput {
    #[serde(default)]
    results: Vec<BinaryResult>,
}

#[derive(Deserialize, Default)]
struct BinaryResult {
    #[serde(default)]
    packages: Vec<BinaryPackage>,
}

#[derive(Deserialize)]
struct BinaryPackage {
    package: BinaryPackageId,
    #[serde(default)]
    vulnerabilities: Vec<BinaryVuln>,
}

#[derive(Deserialize)]
struct BinaryPackageId {
    name: String,
    version: String,
    #[serde(default)]
    ecosystem: String,
}

#[derive(Deserialize)]
struct BinaryVuln {
    id: String,
    #[serde(default)]
    summary: Option<String>,
}

/// Map the tool's ecosystem labels back onto the pipeline's.
fn local_ecosystem(ecosystem: &str) -> String {
    match ecosystem {
        "PyPI" => "pip".to_string(),
        "crates.io" => "cargo".to_string(),
        other => other.to_string(),
    }
}

pub struct OsvScannerBinary {
    binary: PathBuf,
    timeout: Duration,
}

impl OsvScannerBinary {
    pub fn discover() -> Result<Self, ScanError> {
        let binary = which::which("osv-scanner")
            .map_err(|_| ScanError::BinaryMissing("osv-scanner".to_string()))?;
        Ok(Self::from_binary(binary))
    }

    pub fn from_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_binary(
        &self,
        ctx: &ScanContext,
        args: &[&str],
        timeout: Duration,
    ) -> Result<(i32, String, String), ScanError> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ScanError::BinaryMissing(self.binary.display().to_string())
            } else {
                ScanError::Io(err)
            }
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = ctx.cancel_token().cancelled() => return Err(ScanError::Cancelled),
            _ = tokio::time::sleep(timeout) => return Err(ScanError::Timeout(timeout)),
        };

        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

fn parse_output(stdout: &str) -> Result<DependencyReport, ScanError> {
    let output: BinaryOutput = serde_json::from_str(stdout)
        .map_err(|err| ScanError::Parse(format!("scanner JSON: {}", err)))?;

    let mut vulnerabilities = Vec::new();
    let mut packages: HashSet<(String, String, String)> = HashSet::new();
    for result in output.results {
        for package in result.packages {
            let ecosystem = local_ecosystem(&package.package.ecosystem);
            packages.insert((
                ecosystem.clone(),
                package.package.name.clone(),
                package.package.version.clone(),
            ));
            for vuln in package.vulnerabilities {
                vulnerabilities.push(Vulnerability {
                    id: vuln.id,
                    package: package.package.name.clone(),
                    version: package.package.version.clone(),
                    ecosystem: ecosystem.clone(),
                    severity: None,
                    summary: vuln.summary,
                    fixed_version: None,
                });
            }
        }
    }

    Ok(DependencyReport {
        vulnerabilities,
        // The binary only reports packages it flagged; clean ones are not
        // enumerated in its output
        packages_scanned: packages.len(),
        cache_hits: 0,
    })
}

#[async_trait]
impl DependencyScanner for OsvScannerBinary {
    fn name(&self) -> &str {
        "osv-scanner"
    }

    async fn ping(&self) -> Result<(), ScanError> {
        let ctx = ScanContext::detached();
        let (code, _, stderr) = self.run_binary(&ctx, &["--version"], PING_TIMEOUT).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(ScanError::Process(format!(
                "{} --version exited {}: {}",
                self.binary.display(),
                code,
                stderr.trim()
            )))
        }
    }

    async fn scan_path(
        &self,
        ctx: &ScanContext,
        path: &Path,
        _opts: &DependencyScanOptions,
    ) -> Result<DependencyReport, ScanError> {
        ctx.check_cancelled()?;

        let target = path.display().to_string();
        let args = ["--format", "json", "--recursive", target.as_str()];
        let (code, stdout, stderr) = self.run_binary(ctx, &args, self.timeout).await?;

        match code {
            // 0 = clean, 1 = findings present; both carry a JSON body
            0 | 1 => {
                let report = parse_output(&stdout)?;
                info!(
                    "Dependency binary scan of {}: {} vulnerabilities",
                    path.display(),
                    report.vulnerabilities.len()
                );
                Ok(report)
            }
            _ => Err(ScanError::Process(format!(
                "{} exited {}: {}",
                self.binary.display(),
                code,
                stderr.trim()
            ))),
        }
    }

    async fn scan_packages(
        &self,
        ctx: &ScanContext,
        packages: &[PackageRef],
        opts: &DependencyScanOptions,
    ) -> Result<DependencyReport, ScanError> {
        ctx.check_cancelled()?;
        if packages.is_empty() {
            return Ok(DependencyReport::default());
        }

        // The binary scans manifests, not package lists; synthesize one in a
        // scratch directory for the pip entries it can express
        let staging = tempfile::tempdir()?;
        let mut manifest = String::new();
        for package in packages {
            if package.ecosystem == "pip" {
                manifest.push_str(&format!("{}=={}\n", package.name, package.version));
            } else {
                debug!("Skipping {} (unsupported ecosystem for manifest synthesis)", package);
            }
        }
        std::fs::write(staging.path().join("requirements.txt"), manifest)?;

        let mut report = self
            .scan_path(ctx, staging.path(), opts)
            .await?;
        report.packages_scanned = packages.len();
        Ok(report)
    }
}
