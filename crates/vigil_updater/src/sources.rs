//! Update sources: the independently refreshed data feeds scanners consume.
//!
//! Each source knows how to refresh itself and what version is currently
//! installed. The supervisor owns scheduling, retry, and status; sources
//! stay thin.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vigil_protocol::{ScannerKind, Severity};
use vigil_signatures::{Signature, SignatureEngine};

pub const SOURCE_SIGNATURE_FEED: &str = "signature-feed";
pub const SOURCE_VIRUS_DB: &str = "virus-db";
pub const SOURCE_VULN_DB: &str = "vulnerability-db";

/// Sources a scanner must see ready before it may run (unless the system is
/// configured to skip database updates).
pub fn required_sources(kind: ScannerKind) -> &'static [&'static str] {
    match kind {
        ScannerKind::Antivirus => &[SOURCE_VIRUS_DB],
        ScannerKind::Dependency => &[SOURCE_VULN_DB],
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("update I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("signature ingestion failed: {0}")]
    Signatures(#[from] vigil_signatures::SignatureError),
    #[error("updater process failed: {0}")]
    Process(String),
    #[error("feed entry unparseable: {0}")]
    Parse(String),
    #[error("update cancelled")]
    Cancelled,
}

/// One refreshable data source.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    fn name(&self) -> &str;

    /// Refresh the source; returns the installed version on success.
    async fn update(&self, cancel: &CancellationToken) -> Result<String, UpdateError>;

    /// Version of the data currently installed, if any.
    fn current_version(&self) -> Option<String>;
}

// ============================================================================
// Signature hash feed
// ============================================================================

/// Downloads the hash feed and batch-ingests it into the signature engine.
///
/// Feed format: one record per line, `sha256,detection_name,family,severity`,
/// `#` starts a comment. The whole feed is ingested as one batch followed by
/// a bloom rebuild, so lookups racing the ingest stay consistent.
pub struct SignatureFeedSource {
    engine: Arc<SignatureEngine>,
    feed_url: String,
    client: reqwest::Client,
    version: Mutex<Option<String>>,
}

impl SignatureFeedSource {
    pub fn new(engine: Arc<SignatureEngine>, feed_url: impl Into<String>) -> Self {
        Self {
            engine,
            feed_url: feed_url.into(),
            client: reqwest::Client::new(),
            version: Mutex::new(None),
        }
    }

    fn parse_feed(&self, body: &str) -> Result<Vec<Signature>, UpdateError> {
        let mut signatures = Vec::new();
        for (line_no, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split(',');
            let sha256_hex = parts.next().unwrap_or_default();
            let detection_name = parts.next().unwrap_or_default();
            let family = parts.next().unwrap_or("unknown");
            let severity = parts
                .next()
                .unwrap_or("medium")
                .parse::<Severity>()
                .unwrap_or_default();

            let sha256: [u8; 32] = hex::decode(sha256_hex)
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| {
                    UpdateError::Parse(format!("line {}: bad sha256 '{}'", line_no + 1, sha256_hex))
                })?;
            if detection_name.is_empty() {
                return Err(UpdateError::Parse(format!(
                    "line {}: missing detection name",
                    line_no + 1
                )));
            }
            signatures.push(Signature::new(
                sha256,
                detection_name,
                family,
                severity,
                SOURCE_SIGNATURE_FEED,
            ));
        }
        Ok(signatures)
    }
}

#[async_trait]
impl UpdateSource for SignatureFeedSource {
    fn name(&self) -> &str {
        SOURCE_SIGNATURE_FEED
    }

    async fn update(&self, cancel: &CancellationToken) -> Result<String, UpdateError> {
        let body = tokio::select! {
            response = self.client.get(&self.feed_url).send() => {
                response?.error_for_status()?.text().await?
            }
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
        };

        let signatures = self.parse_feed(&body)?;
        let count = signatures.len();
        self.engine.add_signatures(&signatures).await?;
        self.engine.rebuild_bloom().await?;

        // Version the feed by its content digest
        let digest = Sha256::digest(body.as_bytes());
        let version = hex::encode(&digest[..6]);
        *lock(&self.version) = Some(version.clone());
        info!("Signature feed ingested: {} records, version {}", count, version);
        Ok(version)
    }

    fn current_version(&self) -> Option<String> {
        lock(&self.version).clone()
    }
}

// ============================================================================
// Virus database (external updater binary)
// ============================================================================

/// Refreshes the antivirus database by driving the scanner vendor's own
/// updater (`freshclam`). This is the scan-sensitive source: the database
/// files are swapped on disk, so the supervisor defers it while scans are in
/// flight.
pub struct VirusDatabaseSource {
    updater_binary: String,
    database_dir: Option<PathBuf>,
    timeout: Duration,
    version: Mutex<Option<String>>,
}

impl VirusDatabaseSource {
    pub fn new(database_dir: Option<PathBuf>) -> Self {
        let version = database_dir
            .as_deref()
            .and_then(installed_database_version);
        Self {
            updater_binary: "freshclam".to_string(),
            database_dir,
            timeout: Duration::from_secs(10 * 60),
            version: Mutex::new(version),
        }
    }

    pub fn with_updater_binary(mut self, binary: impl Into<String>) -> Self {
        self.updater_binary = binary.into();
        self
    }
}

/// Derive a version stamp from the newest database file already on disk, so
/// a host with a populated database is ready before the first refresh.
fn installed_database_version(dir: &std::path::Path) -> Option<String> {
    let newest = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()?;
    let stamp: chrono::DateTime<chrono::Utc> = newest.into();
    Some(stamp.format("%Y%m%d%H%M%S").to_string())
}

#[async_trait]
impl UpdateSource for VirusDatabaseSource {
    fn name(&self) -> &str {
        SOURCE_VIRUS_DB
    }

    async fn update(&self, cancel: &CancellationToken) -> Result<String, UpdateError> {
        let binary = which::which(&self.updater_binary)
            .map_err(|_| UpdateError::Process(format!("{} not found", self.updater_binary)))?;

        let mut command = tokio::process::Command::new(&binary);
        if let Some(dir) = &self.database_dir {
            command.arg("--datadir").arg(dir);
        }
        command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => {
                return Err(UpdateError::Process(format!(
                    "{} exceeded {:?}", self.updater_binary, self.timeout
                )));
            }
        };

        // freshclam exits 0 on "updated" and on "already up to date"
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpdateError::Process(format!(
                "{} exited {}: {}",
                self.updater_binary,
                output.status,
                stderr.trim()
            )));
        }

        let version = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
        *lock(&self.version) = Some(version.clone());
        info!("Virus database refreshed, version {}", version);
        Ok(version)
    }

    fn current_version(&self) -> Option<String> {
        lock(&self.version).clone()
    }
}

// ============================================================================
// Vulnerability database snapshot
// ============================================================================

#[derive(serde::Deserialize)]
struct SnapshotManifest {
    version: String,
    url: String,
}

/// Downloads a versioned vulnerability snapshot. The manifest is fetched
/// first; when its version matches what is installed the download is
/// skipped.
pub struct VulnDatabaseSource {
    manifest_url: String,
    dest: PathBuf,
    client: reqwest::Client,
    version: Mutex<Option<String>>,
}

impl VulnDatabaseSource {
    pub fn new(manifest_url: impl Into<String>, dest: PathBuf) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            dest,
            client: reqwest::Client::new(),
            version: Mutex::new(None),
        }
    }
}

#[async_trait]
impl UpdateSource for VulnDatabaseSource {
    fn name(&self) -> &str {
        SOURCE_VULN_DB
    }

    async fn update(&self, cancel: &CancellationToken) -> Result<String, UpdateError> {
        let manifest: SnapshotManifest = tokio::select! {
            response = self.client.get(&self.manifest_url).send() => {
                response?.error_for_status()?.json().await?
            }
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
        };

        if lock(&self.version).as_deref() == Some(manifest.version.as_str()) {
            return Ok(manifest.version);
        }

        let bytes = tokio::select! {
            response = self.client.get(&manifest.url).send() => {
                response?.error_for_status()?.bytes().await?
            }
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
        };

        if let Some(parent) = self.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a sibling temp file and rename, so a scan never reads a
        // half-written snapshot.
        let staging = self.dest.with_extension("tmp");
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &self.dest).await?;

        *lock(&self.version) = Some(manifest.version.clone());
        info!(
            "Vulnerability snapshot {} installed ({} bytes)",
            manifest.version,
            bytes.len()
        );
        Ok(manifest.version)
    }

    fn current_version(&self) -> Option<String> {
        lock(&self.version).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_sources_per_scanner() {
        assert_eq!(required_sources(ScannerKind::Antivirus), &[SOURCE_VIRUS_DB]);
        assert_eq!(required_sources(ScannerKind::Dependency), &[SOURCE_VULN_DB]);
    }

    #[tokio::test]
    async fn feed_parser_accepts_records_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(
            SignatureEngine::open(&dir.path().join("sigs.db"), Default::default())
                .await
                .unwrap(),
        );
        let source = SignatureFeedSource::new(engine, "http://unused.invalid/feed");

        let body = format!(
            "# comment\n{},Eicar-Test-Signature,eicar,high\n\n{},Trojan.Generic,trojan,critical\n",
            "aa".repeat(32),
            "bb".repeat(32)
        );
        let signatures = source.parse_feed(&body).unwrap();
        assert_eq!(signatures.len(), 2);
        assert_eq!(signatures[0].detection_name, "Eicar-Test-Signature");
        assert_eq!(signatures[1].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn feed_parser_rejects_bad_hash() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(
            SignatureEngine::open(&dir.path().join("sigs.db"), Default::default())
                .await
                .unwrap(),
        );
        let source = SignatureFeedSource::new(engine, "http://unused.invalid/feed");
        let err = source.parse_feed("nothex,Name,fam,low\n").unwrap_err();
        assert!(matches!(err, UpdateError::Parse(_)));
    }

    #[test]
    fn installed_version_from_populated_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("daily.cvd"), b"stub").unwrap();
        let source = VirusDatabaseSource::new(Some(dir.path().to_path_buf()));
        assert!(source.current_version().is_some());

        let empty = tempfile::tempdir().unwrap();
        let source = VirusDatabaseSource::new(Some(empty.path().to_path_buf()));
        assert!(source.current_version().is_none());
    }
}
