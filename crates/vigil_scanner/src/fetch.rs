//! Artifact fetcher: pull, verify, extract.
//!
//! Each task gets its own directory under the work root; the task that
//! created it removes it (best-effort) after completion. Nothing is shared
//! across tasks.

use crate::archive;
use crate::error::FetchError;
use crate::object_store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_protocol::ArtifactUri;

/// A fetched (and possibly extracted) artifact, ready to scan.
#[derive(Debug)]
pub struct FetchedArtifact {
    /// Task-owned scratch directory; everything below it dies with the task.
    pub job_dir: PathBuf,
    /// The downloaded object.
    pub download_path: PathBuf,
    /// What the scanners should look at: the extraction root for archives,
    /// the downloaded file otherwise.
    pub scan_path: PathBuf,
    /// Hex SHA-256 of the downloaded bytes, computed in stream.
    pub sha256: String,
    pub size: u64,
    pub extracted: bool,
}

pub struct ArtifactFetcher {
    store: Arc<dyn ObjectStore>,
    work_root: PathBuf,
}

impl ArtifactFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            work_root: work_root.into(),
        }
    }

    /// Fetch the artifact for one job. `object` must be the tenant-validated
    /// normalized object path; the fetcher does not re-run that check.
    ///
    /// `expected_sha256`, when present, is verified against the streamed
    /// digest before anything is extracted or scanned.
    pub async fn fetch(
        &self,
        job_id: &str,
        uri: &ArtifactUri,
        object: &str,
        expected_sha256: Option<&str>,
    ) -> Result<FetchedArtifact, FetchError> {
        // Reprocessing the same job id must not collide with a prior run's
        // leftovers, so the directory name carries a fresh suffix.
        let job_dir = self.work_root.join(format!(
            "{}-{}",
            sanitize_component(job_id),
            Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&job_dir).await?;

        let download_path = job_dir.join(sanitize_component(uri.file_name()));
        let meta = match self.store.fetch(&uri.bucket, object, &download_path).await {
            Ok(meta) => meta,
            Err(err) => {
                remove_dir_best_effort(&job_dir).await;
                return Err(err);
            }
        };

        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&meta.sha256) {
                remove_dir_best_effort(&job_dir).await;
                return Err(FetchError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: meta.sha256,
                });
            }
        }

        let (scan_path, extracted) = if archive::is_archive(&download_path) {
            let extract_root = job_dir.join("extracted");
            let archive_path = download_path.clone();
            let extract_dest = extract_root.clone();
            let result = tokio::task::spawn_blocking(move || {
                archive::extract(&archive_path, &extract_dest)
            })
            .await
            .map_err(|err| FetchError::Archive {
                path: download_path.clone(),
                reason: format!("extraction task panicked: {}", err),
            })?;

            match result {
                Ok(count) => {
                    debug!("Job {}: extracted {} entries", job_id, count);
                    (extract_root, true)
                }
                Err(err) => {
                    remove_dir_best_effort(&job_dir).await;
                    return Err(err);
                }
            }
        } else {
            (download_path.clone(), false)
        };

        info!(
            "Job {}: fetched {} ({} bytes, sha256 {})",
            job_id, uri, meta.size, meta.sha256
        );
        Ok(FetchedArtifact {
            job_dir,
            download_path,
            scan_path,
            sha256: meta.sha256,
            size: meta.size,
            extracted,
        })
    }

    /// Remove the task's scratch directory. Best-effort: a failure here is
    /// logged, never propagated.
    pub async fn cleanup(&self, artifact: &FetchedArtifact) {
        remove_dir_best_effort(&artifact.job_dir).await;
    }
}

async fn remove_dir_best_effort(dir: &PathBuf) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove job directory {}: {}", dir.display(), err);
        }
    }
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}
