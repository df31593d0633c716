//! End-to-end pipeline tests against the in-memory backend.
//!
//! These drive the orchestrator exactly the way production does: tasks are
//! appended to the task stream, and assertions read the completion stream
//! and the job state hash.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vigil_protocol::{
    defaults, keys, CompletionPayload, OverallStatus, ScannerKind, TaskMessage,
};
use vigil_scanner::{
    ArtifactFetcher, AvReport, AvScanner, DependencyReport, DependencyScanner, FsObjectStore,
    ObjectMeta, ObjectStore, Orchestrator, OrchestratorConfig, ScanContext, ScanError,
    ScanRunner, ScannerSet,
};
use vigil_scanner::scanners::{AvFileResult, DependencyScanOptions};
use vigil_store::{
    CompletionPublisher, ConsumerConfig, MemoryBackend, StateBackend, StateManager,
    StreamConsumer,
};
use vigil_updater::{NoopReadiness, ScanCounter, ScanGate};

const TASK_STREAM: &str = "vigil:tasks";
const COMPLETION_PREFIX: &str = "vigil:done";

// ============================================================================
// Stub scanners
// ============================================================================

#[derive(Clone, Copy, PartialEq)]
enum AvMode {
    Clean,
    FindEicar,
    Hang,
}

struct StubAv {
    mode: AvMode,
}

#[async_trait]
impl AvScanner for StubAv {
    fn name(&self) -> &str {
        "stub-av"
    }

    async fn ping(&self) -> Result<(), ScanError> {
        Ok(())
    }

    async fn scan_file(&self, _ctx: &ScanContext, path: &Path) -> Result<AvFileResult, ScanError> {
        Ok(AvFileResult {
            path: path.display().to_string(),
            detection: None,
        })
    }

    async fn scan_dir(
        &self,
        ctx: &ScanContext,
        path: &Path,
        _recursive: bool,
    ) -> Result<AvReport, ScanError> {
        match self.mode {
            AvMode::Hang => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => unreachable!(),
                    _ = ctx.cancel_token().cancelled() => Err(ScanError::Cancelled),
                }
            }
            AvMode::Clean => Ok(AvReport {
                infected_count: 0,
                scanned_count: count_files(path),
                detections: vec![],
                infected_files: HashMap::new(),
            }),
            AvMode::FindEicar => Ok(AvReport {
                infected_count: 1,
                scanned_count: count_files(path),
                detections: vec!["Eicar-Test-Signature".to_string()],
                infected_files: HashMap::from([(
                    "eicar.com".to_string(),
                    "Eicar-Test-Signature".to_string(),
                )]),
            }),
        }
    }
}

fn count_files(path: &Path) -> usize {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

struct StubDep {
    fail: bool,
}

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
        if self.fail {
            return Err(ScanError::BinaryMissing("dep-scanner".to_string()));
        }
        Ok(DependencyReport {
            vulnerabilities: vec![],
            packages_scanned: 1,
            cache_hits: 0,
        })
    }

    async fn scan_packages(
        &self,
        _ctx: &ScanContext,
        packages: &[vigil_protocol::PackageRef],
        _opts: &DependencyScanOptions,
    ) -> Result<DependencyReport, ScanError> {
        Ok(DependencyReport {
            vulnerabilities: vec![],
            packages_scanned: packages.len(),
            cache_hits: 0,
        })
    }
}

/// Object store wrapper counting fetch attempts (tenant tests assert zero).
struct CountingStore {
    inner: FsObjectStore,
    fetches: AtomicUsize,
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn fetch(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> Result<ObjectMeta, vigil_scanner::FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(bucket, object, dest).await
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    backend: Arc<dyn StateBackend>,
    state: StateManager,
    store_counter: Arc<CountingStore>,
    stop: CancellationToken,
    _bucket_root: tempfile::TempDir,
    _work_root: tempfile::TempDir,
    orchestrator_task: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(scanners: ScannerSet, objects: &[(&str, &[u8])]) -> Self {
        let bucket_root = tempfile::tempdir().unwrap();
        for (object, contents) in objects {
            let path = bucket_root.path().join("bkt").join(object);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        let work_root = tempfile::tempdir().unwrap();

        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let state = StateManager::new(
            Arc::clone(&backend),
            "vigil:",
            "jobs:",
            Duration::from_secs(3600),
        );
        let completions = CompletionPublisher::new(Arc::clone(&backend), COMPLETION_PREFIX);
        let consumer = StreamConsumer::new(
            Arc::clone(&backend),
            ConsumerConfig::new(TASK_STREAM, "vigil-workers", "test-consumer")
                .with_block(Duration::from_millis(50)),
        );
        let store_counter = Arc::new(CountingStore {
            inner: FsObjectStore::new(bucket_root.path()),
            fetches: AtomicUsize::new(0),
        });
        let fetcher = ArtifactFetcher::new(
            Arc::clone(&store_counter) as Arc<dyn ObjectStore>,
            work_root.path(),
        );

        let orchestrator = Orchestrator::new(
            Arc::clone(&backend),
            consumer,
            state.clone(),
            completions,
            fetcher,
            ScanRunner::new(scanners),
            Arc::new(NoopReadiness),
            ScanGate::new() as Arc<dyn ScanCounter>,
            OrchestratorConfig {
                workers: 2,
                default_timeout: Duration::from_secs(10),
                shutdown_timeout: Duration::from_secs(1),
                cancel_prefix: defaults::DEFAULT_CANCEL_PREFIX.to_string(),
                skip_db_update: false,
            },
        );

        let stop = CancellationToken::new();
        let run_stop = stop.clone();
        let orchestrator_task = tokio::spawn(async move {
            orchestrator.run(run_stop).await.unwrap();
        });
        // Give the workers a moment to create the consumer group
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            backend,
            state,
            store_counter,
            stop,
            _bucket_root: bucket_root,
            _work_root: work_root,
            orchestrator_task,
        }
    }

    async fn enqueue(&self, task: &TaskMessage) {
        self.backend
            .stream_add(
                TASK_STREAM,
                &[("data".to_string(), task.to_json().unwrap())],
            )
            .await
            .unwrap();
    }

    async fn enqueue_raw(&self, raw: &str) {
        self.backend
            .stream_add(TASK_STREAM, &[("data".to_string(), raw.to_string())])
            .await
            .unwrap();
    }

    /// Wait for the next completion on a job's stream.
    async fn await_completion(&self, job_id: &str, timeout: Duration) -> CompletionPayload {
        let key = keys::completion_stream_key(COMPLETION_PREFIX, job_id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.backend.group_ensure(&key, "observer", "0").await.unwrap();
            let entries = self
                .backend
                .group_read(&key, "observer", "obs", 10, Duration::from_millis(50))
                .await
                .unwrap_or_default();
            if let Some(entry) = entries.first() {
                return serde_json::from_str(entry.fields.get("data").unwrap()).unwrap();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no completion for {} within {:?}",
                job_id,
                timeout
            );
        }
    }

    async fn completion_count(&self, job_id: &str) -> usize {
        // Fresh group per call so repeated polls re-count from the start
        let group = format!("counter-{}", uuid::Uuid::new_v4().simple());
        let key = keys::completion_stream_key(COMPLETION_PREFIX, job_id);
        self.backend.group_ensure(&key, &group, "0").await.unwrap();
        self.backend
            .group_read(&key, &group, "obs", 100, Duration::from_millis(20))
            .await
            .unwrap_or_default()
            .len()
    }

    async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.orchestrator_task.await;
    }
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.zip");
    vigil_scanner::archive::write_zip(&path, entries).unwrap();
    std::fs::read(&path).unwrap()
}

fn task(job_id: &str, uri: &str, scanners: Vec<ScannerKind>) -> TaskMessage {
    TaskMessage {
        job_id: job_id.to_string(),
        tenant_id: "org-A".to_string(),
        artifact_uri: uri.to_string(),
        scanners,
        timeout_seconds: Some(300),
        ttl_seconds: None,
        retry_count: 0,
        created_at: None,
    }
}

fn both_scanners(av_mode: AvMode, dep_fails: bool) -> ScannerSet {
    ScannerSet::new()
        .with_antivirus(Arc::new(StubAv { mode: av_mode }))
        .with_dependency(Arc::new(StubDep { fail: dep_fails }))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn clean_archive_two_scanners_completes() {
    let archive = zip_bytes(&[("requirements.txt", b"requests==2.31.0\n")]);
    let harness = Harness::start(
        both_scanners(AvMode::Clean, false),
        &[("org-A/clean.zip", archive.as_slice())],
    )
    .await;

    harness
        .enqueue(&task(
            "j1",
            "gs://bkt/org-A/clean.zip",
            vec![ScannerKind::Dependency, ScannerKind::Antivirus],
        ))
        .await;

    let completion = harness.await_completion("j1", Duration::from_secs(5)).await;
    assert_eq!(completion.status, OverallStatus::Completed);
    assert!(completion.errors.is_none());
    let results = completion.results.unwrap();
    assert_eq!(results[&ScannerKind::Dependency]["packages_scanned"], 1);
    assert_eq!(results[&ScannerKind::Dependency]["vulnerabilities"], serde_json::json!([]));
    assert_eq!(results[&ScannerKind::Antivirus]["infected_count"], 0);

    // State reflects the terminal statuses
    let fields = harness.state.get_all_fields("j1").await.unwrap();
    assert_eq!(fields["status:antivirus"], "completed");
    assert_eq!(fields["status:dependency"], "completed");
    assert!(fields.contains_key("started_at"));
    assert!(fields.contains_key("completed_at"));

    // Exactly one completion per processing run
    assert_eq!(harness.completion_count("j1").await, 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn tenant_path_violation_fails_without_fetch() {
    let harness = Harness::start(both_scanners(AvMode::Clean, false), &[]).await;

    harness
        .enqueue(&task(
            "j2",
            "gs://bkt/org-B/x.zip",
            vec![ScannerKind::Antivirus],
        ))
        .await;

    let completion = harness.await_completion("j2", Duration::from_secs(2)).await;
    assert_eq!(completion.status, OverallStatus::Failed);

    let error = harness
        .state
        .get_field("j2", defaults::FIELD_ERROR)
        .await
        .unwrap()
        .unwrap();
    assert!(error.contains("invalid path for tenant"), "error: {}", error);

    // No fetch attempt occurred
    assert_eq!(harness.store_counter.fetches.load(Ordering::SeqCst), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn one_scanner_failing_yields_partial() {
    let archive = zip_bytes(&[("eicar.com", b"test-payload".as_slice())]);
    let harness = Harness::start(
        both_scanners(AvMode::FindEicar, true),
        &[("org-A/x.zip", archive.as_slice())],
    )
    .await;

    harness
        .enqueue(&task(
            "j3",
            "gs://bkt/org-A/x.zip",
            vec![ScannerKind::Dependency, ScannerKind::Antivirus],
        ))
        .await;

    let completion = harness.await_completion("j3", Duration::from_secs(5)).await;
    assert_eq!(completion.status, OverallStatus::Partial);

    let errors = completion.errors.unwrap();
    assert!(errors[&ScannerKind::Dependency].contains("binary not found"));

    let results = completion.results.unwrap();
    assert_eq!(results[&ScannerKind::Antivirus]["infected_count"], 1);
    assert_eq!(
        results[&ScannerKind::Antivirus]["detections"],
        serde_json::json!(["Eicar-Test-Signature"])
    );

    let fields = harness.state.get_all_fields("j3").await.unwrap();
    assert_eq!(fields["status:antivirus"], "completed");
    assert_eq!(fields["status:dependency"], "failed");
    harness.shutdown().await;
}

#[tokio::test]
async fn cancellation_mid_scan_publishes_cancelled() {
    let archive = zip_bytes(&[("big.bin", b"payload".as_slice())]);
    let harness = Harness::start(
        ScannerSet::new().with_antivirus(Arc::new(StubAv { mode: AvMode::Hang })),
        &[("org-A/slow.zip", archive.as_slice())],
    )
    .await;

    harness
        .enqueue(&task(
            "j5",
            "gs://bkt/org-A/slow.zip",
            vec![ScannerKind::Antivirus],
        ))
        .await;

    // Wait for the scan to be marked running
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let status = harness
            .state
            .get_field("j5", "status:antivirus")
            .await
            .unwrap();
        if status.as_deref() == Some("running") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "scan never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Any payload on the cancel channel cancels the job
    harness
        .backend
        .publish(
            &keys::cancel_channel(defaults::DEFAULT_CANCEL_PREFIX, "j5"),
            "stop",
        )
        .await
        .unwrap();

    let completion = harness.await_completion("j5", Duration::from_secs(5)).await;
    assert_eq!(completion.status, OverallStatus::Cancelled);

    let fields = harness.state.get_all_fields("j5").await.unwrap();
    assert_eq!(fields["status:antivirus"], "cancelled");
    assert!(fields.contains_key(defaults::FIELD_CANCELLED_AT));
    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_scanner_is_dropped_with_failed_completion() {
    let harness = Harness::start(both_scanners(AvMode::Clean, false), &[]).await;

    harness
        .enqueue_raw(
            r#"{"job_id":"j6","tenant_id":"org-A","artifact_uri":"gs://bkt/org-A/x.zip","scanners":["quantum"]}"#,
        )
        .await;

    let completion = harness.await_completion("j6", Duration::from_secs(2)).await;
    assert_eq!(completion.status, OverallStatus::Failed);
    // Validation failed before any fetch
    assert_eq!(harness.store_counter.fetches.load(Ordering::SeqCst), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn reprocessing_the_same_job_is_idempotent() {
    let archive = zip_bytes(&[("requirements.txt", b"requests==2.31.0\n")]);
    let harness = Harness::start(
        both_scanners(AvMode::Clean, false),
        &[("org-A/clean.zip", archive.as_slice())],
    )
    .await;

    let message = task("j7", "gs://bkt/org-A/clean.zip", vec![ScannerKind::Antivirus]);
    harness.enqueue(&message).await;
    let first = harness.await_completion("j7", Duration::from_secs(5)).await;
    assert_eq!(first.status, OverallStatus::Completed);
    let first_fields = harness.state.get_all_fields("j7").await.unwrap();

    harness.enqueue(&message).await;
    // Redelivery appends a second completion; consumers dedupe
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if harness.completion_count("j7").await == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "second run never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let second_fields = harness.state.get_all_fields("j7").await.unwrap();
    assert_eq!(
        first_fields["status:antivirus"],
        second_fields["status:antivirus"]
    );
    assert_eq!(first_fields["tenant_id"], second_fields["tenant_id"]);
    harness.shutdown().await;
}
