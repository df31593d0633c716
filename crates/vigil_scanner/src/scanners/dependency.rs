//! Dependency scanner adapter.
//!
//! The adapter collects pinned packages from the artifact, answers as much
//! as it can from the per-package cache, and queries the remote provider
//! only for the misses. Query results - including empty ones, which mean
//! "scanned and clean" - go back into the cache, so the next run of the
//! same project never leaves the process.

use super::{
    DependencyReport, DependencyScanOptions, DependencyScanner, ScanContext, VulnProvider,
};
use crate::error::ScanError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vigil_cache::VulnCache;
use vigil_protocol::{PackageRef, Vulnerability};
use walkdir::WalkDir;

/// Manifest files the collector recognizes. Full manifest-format coverage is
/// an external concern; pinned `requirements.txt` entries are the contract
/// the pipeline itself exercises.
const REQUIREMENTS_FILE: &str = "requirements.txt";
/// Don't descend forever into pathological trees.
const MAX_COLLECT_DEPTH: usize = 16;

/// Collects pinned package references from a directory tree or single file.
pub struct PackageCollector;

impl PackageCollector {
    pub fn collect(path: &Path) -> Result<Vec<PackageRef>, ScanError> {
        let mut packages = Vec::new();
        let mut seen = HashSet::new();

        if path.is_file() {
            collect_from_file(path, &mut packages, &mut seen)?;
            return Ok(packages);
        }

        for entry in WalkDir::new(path)
            .max_depth(MAX_COLLECT_DEPTH)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            if entry.file_name() == REQUIREMENTS_FILE {
                collect_from_file(entry.path(), &mut packages, &mut seen)?;
            }
        }
        Ok(packages)
    }
}

fn collect_from_file(
    path: &Path,
    packages: &mut Vec<PackageRef>,
    seen: &mut HashSet<PackageRef>,
) -> Result<(), ScanError> {
    let contents = std::fs::read_to_string(path)?;
    for line in contents.lines() {
        if let Some(package) = parse_requirement_line(line) {
            if seen.insert(package.clone()) {
                packages.push(package);
            }
        }
    }
    Ok(())
}

/// Parse one `requirements.txt` line into a pinned package, if it is one.
/// Unpinned specifiers (`>=`, `~=`, bare names) are skipped: without an
/// exact version there is nothing deterministic to cache or query.
fn parse_requirement_line(line: &str) -> Option<PackageRef> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() || line.starts_with('-') {
        return None;
    }
    let (name, version) = line.split_once("==")?;
    // Strip extras: `requests[socks]==2.31.0`
    let name = name.split('[').next().unwrap_or(name).trim();
    let version = version
        .split(';')
        .next()
        .unwrap_or(version)
        .trim()
        .trim_end_matches(|c: char| c.is_whitespace());
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some(PackageRef::new("pip", name, version))
}

pub struct DependencyScanAdapter {
    cache: VulnCache,
    provider: Arc<dyn VulnProvider>,
}

impl DependencyScanAdapter {
    pub fn new(cache: VulnCache, provider: Arc<dyn VulnProvider>) -> Self {
        Self { cache, provider }
    }
}

#[async_trait]
impl DependencyScanner for DependencyScanAdapter {
    fn name(&self) -> &str {
        "dependency"
    }

    async fn ping(&self) -> Result<(), ScanError> {
        self.provider.ping().await
    }

    async fn scan_path(
        &self,
        ctx: &ScanContext,
        path: &Path,
        opts: &DependencyScanOptions,
    ) -> Result<DependencyReport, ScanError> {
        ctx.check_cancelled()?;
        let packages = PackageCollector::collect(path)?;
        debug!(
            "Collected {} pinned packages under {}",
            packages.len(),
            path.display()
        );
        self.scan_packages(ctx, &packages, opts).await
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

        let (hits, misses) = if opts.bypass_cache {
            (Default::default(), packages.to_vec())
        } else {
            self.cache.get_multiple(packages).await
        };

        let mut vulnerabilities: Vec<Vulnerability> =
            hits.values().flatten().cloned().collect();
        let cache_hits = hits.len();

        if !misses.is_empty() {
            ctx.check_cancelled()?;
            let fresh = tokio::select! {
                result = self.provider.query(&misses) => result?,
                _ = ctx.cancel_token().cancelled() => return Err(ScanError::Cancelled),
            };

            for package in &misses {
                let vulns = fresh.get(package).cloned().unwrap_or_default();
                // Empty is a real answer ("known clean") and is cached too
                if let Err(err) = self.cache.set(package, &vulns).await {
                    warn!("Failed to cache result for {}: {}", package, err);
                }
                vulnerabilities.extend(vulns);
            }
        }

        let report = DependencyReport {
            vulnerabilities,
            packages_scanned: packages.len(),
            cache_hits,
        };
        info!(
            "Dependency scan: {} packages, {} cache hits, {} vulnerabilities",
            report.packages_scanned,
            report.cache_hits,
            report.vulnerabilities.len()
        );
        Ok(report)
    }
}
