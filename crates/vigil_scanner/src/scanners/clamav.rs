//! ClamAV adapter.
//!
//! Wraps the `clamscan`/`clamdscan` binary. Before the subprocess runs, each
//! file's SHA-256 is checked against the signature engine - the two-tier
//! lookup answers the common "never seen" case without forking anything.
//! Detections confirmed by the binary are persisted back into the engine, so
//! the next encounter with the same content short-circuits.
//!
//! Exit-code disposition: 0 = clean, 1 = findings present (not a failure),
//! anything else = scanner failure.

use super::{AvFileResult, AvReport, AvScanner, ScanContext};
use crate::error::ScanError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use vigil_protocol::Severity;
use vigil_signatures::{ContentHash, Signature, SignatureEngine, Verdict};
use walkdir::WalkDir;

/// Standard EICAR test payload; every compliant product detects it.
pub const EICAR_TEST_STRING: &str =
    r"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Hash pre-filter skips files larger than this; the binary still sees them.
const MAX_HASH_FILE_SIZE: u64 = 512 * 1024 * 1024;

pub struct ClamAv {
    binary: PathBuf,
    timeout: Duration,
    engine: Option<Arc<SignatureEngine>>,
}

impl ClamAv {
    /// Locate `clamdscan` (daemon, fast) or fall back to `clamscan`.
    pub fn discover() -> Result<Self, ScanError> {
        let binary = which::which("clamdscan")
            .or_else(|_| which::which("clamscan"))
            .map_err(|_| ScanError::BinaryMissing("clamdscan/clamscan".to_string()))?;
        Ok(Self::from_binary(binary))
    }

    pub fn from_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_SCAN_TIMEOUT,
            engine: None,
        }
    }

    pub fn with_engine(mut self, engine: Arc<SignatureEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Signature-engine pass over one file. Returns the detection name on a
    /// store-confirmed hit.
    async fn engine_verdict(&self, path: &Path) -> Result<Option<String>, ScanError> {
        let Some(engine) = &self.engine else {
            return Ok(None);
        };
        let Some(hash) = hash_file(path).await? else {
            return Ok(None);
        };
        let lookup = engine.lookup(&hash).await?;
        if lookup.verdict == Verdict::Malware {
            let name = lookup
                .signature
                .map(|sig| sig.detection_name)
                .unwrap_or_else(|| "Known.Malware".to_string());
            debug!("Signature engine hit for {}: {}", path.display(), name);
            return Ok(Some(name));
        }
        Ok(None)
    }

    /// Persist a binary-confirmed detection so the engine answers next time.
    async fn persist_detection(&self, path: &Path, detection: &str) {
        let Some(engine) = &self.engine else {
            return;
        };
        let sha256 = match hash_file(path).await {
            Ok(Some(ContentHash::Sha256(sha256))) => sha256,
            Ok(_) => return,
            Err(err) => {
                warn!("Could not hash {} for persistence: {}", path.display(), err);
                return;
            }
        };
        let family = detection.split('.').next().unwrap_or("unknown").to_string();
        let signature = Signature::new(sha256, detection, family, Severity::High, "antivirus");
        if let Err(err) = engine.add_signature(&signature).await {
            warn!("Failed to persist detection for {}: {}", path.display(), err);
        }
    }

    async fn run_binary(
        &self,
        ctx: &ScanContext,
        target: &Path,
        recursive: bool,
    ) -> Result<(i32, String, String), ScanError> {
        let mut command = Command::new(&self.binary);
        command.arg("--no-summary");
        if recursive {
            command.arg("-r");
        }
        command
            .arg(target)
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
            _ = tokio::time::sleep(self.timeout) => return Err(ScanError::Timeout(self.timeout)),
        };

        let code = output.status.code().unwrap_or(-1);
        Ok((
            code,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

#[async_trait]
impl AvScanner for ClamAv {
    fn name(&self) -> &str {
        "clamav"
    }

    async fn ping(&self) -> Result<(), ScanError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--version")
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
            _ = tokio::time::sleep(PING_TIMEOUT) => return Err(ScanError::Timeout(PING_TIMEOUT)),
        };
        if output.status.success() {
            Ok(())
        } else {
            Err(ScanError::Process(format!(
                "{} --version exited {}",
                self.binary.display(),
                output.status
            )))
        }
    }

    async fn scan_file(&self, ctx: &ScanContext, path: &Path) -> Result<AvFileResult, ScanError> {
        ctx.check_cancelled()?;

        // Engine fast path
        if let Some(detection) = self.engine_verdict(path).await? {
            return Ok(AvFileResult {
                path: path.display().to_string(),
                detection: Some(detection),
            });
        }

        let (code, stdout, stderr) = self.run_binary(ctx, path, false).await?;
        match code {
            0 => Ok(AvFileResult {
                path: path.display().to_string(),
                detection: None,
            }),
            1 => {
                let detections = parse_detections(&stdout);
                let detection = detections
                    .into_iter()
                    .next()
                    .map(|(_, name)| name)
                    .ok_or_else(|| {
                        ScanError::Parse(format!("exit 1 but no detection line: {}", stdout))
                    })?;
                self.persist_detection(path, &detection).await;
                Ok(AvFileResult {
                    path: path.display().to_string(),
                    detection: Some(detection),
                })
            }
            _ => Err(ScanError::Process(format!(
                "{} exited {}: {}",
                self.binary.display(),
                code,
                stderr.trim()
            ))),
        }
    }

    async fn scan_dir(
        &self,
        ctx: &ScanContext,
        path: &Path,
        recursive: bool,
    ) -> Result<AvReport, ScanError> {
        ctx.check_cancelled()?;

        let files = collect_files(path, recursive);
        let mut infected: HashMap<String, String> = HashMap::new();

        // Tier one: hash lookups against the signature engine
        for file in &files {
            ctx.check_cancelled()?;
            if let Some(detection) = self.engine_verdict(file).await? {
                infected.insert(file.display().to_string(), detection);
            }
        }

        // Tier two: the external binary over the whole tree
        let (code, stdout, stderr) = self.run_binary(ctx, path, recursive).await?;
        match code {
            0 => {}
            1 => {
                for (file, detection) in parse_detections(&stdout) {
                    if !infected.contains_key(&file) {
                        self.persist_detection(Path::new(&file), &detection).await;
                        infected.insert(file, detection);
                    }
                }
            }
            _ => {
                return Err(ScanError::Process(format!(
                    "{} exited {}: {}",
                    self.binary.display(),
                    code,
                    stderr.trim()
                )))
            }
        }

        let mut detections: Vec<String> = infected.values().cloned().collect();
        detections.sort();
        detections.dedup();

        let report = AvReport {
            infected_count: infected.len(),
            scanned_count: files.len(),
            detections,
            infected_files: infected,
        };
        info!(
            "Antivirus scan of {}: {}/{} infected",
            path.display(),
            report.infected_count,
            report.scanned_count
        );
        Ok(report)
    }
}

fn collect_files(path: &Path, recursive: bool) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let max_depth = if recursive { usize::MAX } else { 1 };
    WalkDir::new(path)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// Parse `path: Name FOUND` lines from clamscan output.
fn parse_detections(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let stripped = line.strip_suffix(" FOUND")?;
            let (path, name) = stripped.rsplit_once(": ")?;
            Some((path.to_string(), name.to_string()))
        })
        .collect()
}

/// SHA-256 of a file, streamed. `None` when the file is too large for the
/// pre-filter or vanished mid-walk.
async fn hash_file(path: &Path) -> Result<Option<ContentHash>, ScanError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(_) => return Ok(None),
    };
    if metadata.len() > MAX_HASH_FILE_SIZE {
        return Ok(None);
    }

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(_) => return Ok(None),
    };
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(Some(ContentHash::Sha256(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clamscan_output() {
        let stdout = "/tmp/x/eicar.com: Eicar-Test-Signature FOUND\n\
                      /tmp/x/clean.txt: OK\n\
                      /tmp/x/other.bin: Win.Trojan.Agent-123 FOUND\n";
        let detections = parse_detections(stdout);
        assert_eq!(detections.len(), 2);
        assert_eq!(
            detections[0],
            ("/tmp/x/eicar.com".to_string(), "Eicar-Test-Signature".to_string())
        );
    }

    #[test]
    fn paths_with_colons_parse() {
        let stdout = "/tmp/a: b/file.bin: Some.Name FOUND\n";
        let detections = parse_detections(stdout);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].0, "/tmp/a: b/file.bin");
        assert_eq!(detections[0].1, "Some.Name");
    }

    #[tokio::test]
    async fn hash_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"vigil").unwrap();

        let hash = hash_file(&path).await.unwrap().unwrap();
        let expected: [u8; 32] = Sha256::digest(b"vigil").into();
        assert_eq!(hash, ContentHash::Sha256(expected));
    }

    #[cfg(unix)]
    mod with_stub_binary {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable shell stub standing in for clamscan.
        fn write_stub(dir: &Path, script: &str) -> PathBuf {
            let path = dir.join("clamscan-stub");
            std::fs::write(&path, script).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[tokio::test]
        async fn clean_tree_reports_zero_infections() {
            let dir = tempfile::tempdir().unwrap();
            let stub = write_stub(dir.path(), "#!/bin/sh\nexit 0\n");
            std::fs::write(dir.path().join("a.txt"), b"clean").unwrap();

            let scanner = ClamAv::from_binary(stub);
            let report = scanner
                .scan_dir(&ScanContext::detached(), dir.path(), true)
                .await
                .unwrap();
            assert_eq!(report.infected_count, 0);
            assert!(report.scanned_count >= 1);
        }

        #[tokio::test]
        async fn exit_one_with_detection_is_findings() {
            let dir = tempfile::tempdir().unwrap();
            let infected = dir.path().join("eicar.com");
            std::fs::write(&infected, EICAR_TEST_STRING).unwrap();
            let script = format!(
                "#!/bin/sh\necho '{}: Eicar-Test-Signature FOUND'\nexit 1\n",
                infected.display()
            );
            let stub = write_stub(dir.path(), &script);

            let scanner = ClamAv::from_binary(stub);
            let report = scanner
                .scan_dir(&ScanContext::detached(), dir.path(), true)
                .await
                .unwrap();
            assert_eq!(report.infected_count, 1);
            assert_eq!(report.detections, vec!["Eicar-Test-Signature".to_string()]);
        }

        #[tokio::test]
        async fn nonzero_exit_without_findings_is_failure() {
            let dir = tempfile::tempdir().unwrap();
            let stub = write_stub(dir.path(), "#!/bin/sh\necho 'boom' >&2\nexit 2\n");

            let scanner = ClamAv::from_binary(stub);
            let err = scanner
                .scan_dir(&ScanContext::detached(), dir.path(), true)
                .await
                .unwrap_err();
            assert!(matches!(err, ScanError::Process(_)));
        }

        #[tokio::test]
        async fn cancellation_kills_a_hung_scan() {
            let dir = tempfile::tempdir().unwrap();
            let stub = write_stub(dir.path(), "#!/bin/sh\nsleep 30\n");

            let token = tokio_util::sync::CancellationToken::new();
            let ctx = ScanContext::new(token.clone());
            let scanner = ClamAv::from_binary(stub);

            let cancel = tokio::spawn({
                let token = token.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    token.cancel();
                }
            });

            let err = scanner
                .scan_dir(&ctx, dir.path(), true)
                .await
                .unwrap_err();
            assert!(err.is_cancelled());
            cancel.await.unwrap();
        }
    }
}
