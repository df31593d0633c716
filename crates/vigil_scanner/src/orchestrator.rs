//! Orchestrator: a pool of worker loops over one shared task consumer.
//!
//! Delivery is at-least-once with ack-on-receipt: scans run for minutes,
//! far past any practical pending-entry timeout, so a message is
//! acknowledged the moment it is read and the producer relies on completion
//! polling for ground truth. The cost is that a worker crash mid-scan drops
//! that task; producers re-enqueue under a fresh job id.
//!
//! Every processing run publishes exactly one completion signal. All state
//! writes are blind overwrites, so reprocessing a job id is safe.

use crate::cancel::CancelWatcher;
use crate::fetch::{ArtifactFetcher, FetchedArtifact};
use crate::runner::{RunOutcome, ScanRunner};
use crate::scanners::ScanContext;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_protocol::{
    defaults, keys, CompletionPayload, OverallStatus, ScanStatus, ScannerKind, SystemConfig,
    TaskMessage,
};
use vigil_protocol::{ArtifactUri, UriError};
use vigil_store::{CompletionPublisher, StateBackend, StateManager, StreamConsumer, StreamEntry};
use vigil_updater::{required_sources, ReadinessProvider, ScanCounter};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub default_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub cancel_prefix: String,
    /// Air-gapped mode: skip source readiness checks entirely.
    pub skip_db_update: bool,
}

impl OrchestratorConfig {
    pub fn from_system(config: &SystemConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            default_timeout: config.default_task_timeout,
            shutdown_timeout: config.shutdown_timeout,
            cancel_prefix: config.cancel_prefix.clone(),
            skip_db_update: config.skip_db_update,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: defaults::DEFAULT_WORKERS,
            default_timeout: Duration::from_secs(defaults::DEFAULT_TASK_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(defaults::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            cancel_prefix: defaults::DEFAULT_CANCEL_PREFIX.to_string(),
            skip_db_update: false,
        }
    }
}

pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn StateBackend>,
    consumer: StreamConsumer,
    state: StateManager,
    completions: CompletionPublisher,
    fetcher: ArtifactFetcher,
    runner: ScanRunner,
    readiness: Arc<dyn ReadinessProvider>,
    gate: Arc<dyn ScanCounter>,
    config: OrchestratorConfig,
    /// Fired when the shutdown grace period expires; parents every job token.
    force_cancel: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn StateBackend>,
        consumer: StreamConsumer,
        state: StateManager,
        completions: CompletionPublisher,
        fetcher: ArtifactFetcher,
        runner: ScanRunner,
        readiness: Arc<dyn ReadinessProvider>,
        gate: Arc<dyn ScanCounter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                consumer,
                state,
                completions,
                fetcher,
                runner,
                readiness,
                gate,
                config,
                force_cancel: CancellationToken::new(),
            }),
        }
    }

    /// Run the worker pool until `stop` fires, then drain in-flight tasks
    /// under the shutdown timeout and force-cancel whatever remains.
    pub async fn run(&self, stop: CancellationToken) -> anyhow::Result<()> {
        self.inner.consumer.ensure_group().await?;

        let workers = self.inner.config.workers;
        info!("Orchestrator starting {} workers", workers);

        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                let inner = Arc::clone(&self.inner);
                let stop = stop.clone();
                tokio::spawn(async move {
                    worker_loop(inner, worker_id, stop).await;
                })
            })
            .collect();

        let drain = futures::future::join_all(handles);
        tokio::pin!(drain);

        tokio::select! {
            _ = &mut drain => {
                // All workers exited on their own (stop fired and loops drained)
                info!("Orchestrator workers stopped");
                return Ok(());
            }
            _ = stop.cancelled() => {}
        }

        // Stop observed: give in-flight tasks the grace period, then cut them
        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, &mut drain).await.is_err() {
            warn!(
                "Shutdown grace period {:?} expired; force-cancelling in-flight tasks",
                timeout
            );
            self.inner.force_cancel.cancel();
            let _ = drain.await;
        }
        info!("Orchestrator stopped");
        Ok(())
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize, stop: CancellationToken) {
    info!("Worker {} entering read loop", worker_id);
    loop {
        if stop.is_cancelled() {
            break;
        }

        let entries = tokio::select! {
            result = inner.consumer.read(1) => match result {
                Ok(entries) => entries,
                Err(err) => {
                    error!("Worker {}: stream read failed: {}", worker_id, err);
                    // Transient infrastructure error; don't spin
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = stop.cancelled() => break,
                    }
                }
            },
            _ = stop.cancelled() => break,
        };

        for entry in entries {
            handle_entry(&inner, entry).await;
        }
    }
    info!("Worker {} stopped", worker_id);
}

async fn handle_entry(inner: &Arc<Inner>, entry: StreamEntry) {
    // Ack on receipt, before processing (at-least-once, see module docs)
    if let Err(err) = inner.consumer.ack(&entry.id).await {
        warn!("Failed to ack entry {}: {}", entry.id, err);
    }

    let Some(raw) = entry.data() else {
        warn!("Dropping stream entry {} without a data field", entry.id);
        return;
    };

    match TaskMessage::from_json(raw) {
        Ok(task) => process_task(inner, task).await,
        Err(err) => {
            error!("Dropping invalid task in entry {}: {}", entry.id, err);
            // Validation failures still yield a completion when the payload
            // carries a recoverable job id
            if let Some(job_id) = extract_job_id(raw) {
                let _ = inner
                    .state
                    .set_field(&job_id, defaults::FIELD_ERROR, &err.to_string())
                    .await;
                let payload = CompletionPayload::new(job_id, OverallStatus::Failed);
                if let Err(publish_err) = inner.completions.publish(&payload).await {
                    error!("Failed to publish failed completion: {}", publish_err);
                }
            }
        }
    }
}

/// Best-effort job id recovery from a payload that failed validation.
fn extract_job_id(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let job_id = value.get("job_id")?.as_str()?.trim();
    if job_id.is_empty() {
        None
    } else {
        Some(job_id.to_string())
    }
}

async fn process_task(inner: &Arc<Inner>, task: TaskMessage) {
    let job_id = task.job_id.clone();
    info!(
        "Processing job {} for tenant {} ({} scanners)",
        job_id,
        task.tenant_id,
        task.scanners.len()
    );

    // Seed the state hash: every requested scanner starts pending
    let mut fields = vec![
        (
            defaults::FIELD_TENANT_ID.to_string(),
            task.tenant_id.clone(),
        ),
        (
            defaults::FIELD_ARTIFACT_URI.to_string(),
            task.artifact_uri.clone(),
        ),
        (
            defaults::FIELD_STARTED_AT.to_string(),
            Utc::now().to_rfc3339(),
        ),
    ];
    for kind in &task.scanners {
        fields.push((keys::status_field(*kind), ScanStatus::Pending.to_string()));
    }
    if let Err(err) = inner.state.init_state(&job_id, &fields).await {
        error!("Job {}: state init failed: {}", job_id, err);
        publish_completion(inner, CompletionPayload::new(&job_id, OverallStatus::Failed)).await;
        return;
    }
    if let Some(ttl) = task.ttl_seconds {
        let _ = inner
            .state
            .set_ttl(&job_id, Duration::from_secs(ttl.max(1)))
            .await;
    }

    // Tenant ownership gate: no fetch is attempted past a violation
    let (uri, object) = match validate_artifact(&task) {
        Ok(parsed) => parsed,
        Err(err) => {
            fail_task(inner, &task, &err.to_string()).await;
            return;
        }
    };

    // Per-job cancellation: channel -> token; force-cancel parents all jobs
    let job_token = inner.force_cancel.child_token();
    let cancel_channel = keys::cancel_channel(&inner.config.cancel_prefix, &job_id);
    let watcher = match CancelWatcher::spawn(&inner.backend, cancel_channel, job_token.clone()).await
    {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!("Job {}: cancel watcher unavailable: {}", job_id, err);
            None
        }
    };

    let outcome = run_job(inner, &task, &uri, &object, &job_token).await;

    let cancel_requested = watcher.map(CancelWatcher::stop).unwrap_or(false);

    finish_job(inner, &task, outcome, cancel_requested).await;
}

/// Everything between validation and result write-back for one job.
struct JobOutcome {
    run: Option<RunOutcome>,
    setup_error: Option<String>,
    deadline_hit: bool,
    artifact: Option<FetchedArtifact>,
}

async fn run_job(
    inner: &Arc<Inner>,
    task: &TaskMessage,
    uri: &ArtifactUri,
    object: &str,
    job_token: &CancellationToken,
) -> JobOutcome {
    let job_id = &task.job_id;

    // Fetch and extract under cancellation
    let artifact = tokio::select! {
        result = inner.fetcher.fetch(job_id, uri, object, None) => match result {
            Ok(artifact) => artifact,
            Err(err) => {
                return JobOutcome {
                    run: None,
                    setup_error: Some(err.to_string()),
                    deadline_hit: false,
                    artifact: None,
                };
            }
        },
        _ = job_token.cancelled() => {
            return JobOutcome {
                run: None,
                setup_error: None,
                deadline_hit: false,
                artifact: None,
            };
        }
    };

    // Source readiness gates each scanner individually; a not-ready scanner
    // fails locally while the others proceed
    let mut pre_failed: HashMap<ScannerKind, String> = HashMap::new();
    let mut to_run = Vec::new();
    for kind in &task.scanners {
        match unready_source(inner, *kind) {
            Some(source) => {
                pre_failed.insert(
                    *kind,
                    format!("required data source not ready: {}", source),
                );
            }
            None => to_run.push(*kind),
        }
    }

    // Mark what will actually run
    for kind in &to_run {
        let _ = inner
            .state
            .set_field(job_id, &keys::status_field(*kind), ScanStatus::Running.as_str())
            .await;
    }

    let timeout = task
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(inner.config.default_timeout);

    inner.gate.begin_scan();
    let ctx = ScanContext::new(job_token.clone());
    let scan_path = artifact.scan_path.clone();
    let run_future = inner.runner.run(&ctx, &scan_path, &to_run);
    tokio::pin!(run_future);

    let mut deadline_hit = false;
    let mut outcome = tokio::select! {
        outcome = &mut run_future => outcome,
        _ = tokio::time::sleep(timeout) => {
            warn!("Job {}: deadline {:?} exceeded, cancelling scanners", job_id, timeout);
            deadline_hit = true;
            job_token.cancel();
            // Adapters observe the token and return promptly
            run_future.await
        }
    };
    inner.gate.end_scan();

    for (kind, reason) in pre_failed {
        outcome
            .errors
            .insert(kind, crate::error::ScanError::SourceNotReady(reason));
    }

    JobOutcome {
        run: Some(outcome),
        setup_error: None,
        deadline_hit,
        artifact: Some(artifact),
    }
}

async fn finish_job(
    inner: &Arc<Inner>,
    task: &TaskMessage,
    outcome: JobOutcome,
    cancel_requested: bool,
) {
    let job_id = &task.job_id;

    // Setup failure before any scanner ran
    if let Some(reason) = &outcome.setup_error {
        fail_task(inner, task, reason).await;
        if let Some(artifact) = &outcome.artifact {
            inner.fetcher.cleanup(artifact).await;
        }
        return;
    }

    // Cancelled before the runner started
    let Some(run) = outcome.run else {
        cancel_task(inner, task).await;
        if let Some(artifact) = &outcome.artifact {
            inner.fetcher.cleanup(artifact).await;
        }
        return;
    };

    let mut results: HashMap<ScannerKind, serde_json::Value> = HashMap::new();
    let mut errors: HashMap<ScannerKind, String> = HashMap::new();
    let mut any_cancelled = false;

    for kind in &task.scanners {
        if let Some(value) = run.results.get(kind) {
            let _ = inner
                .state
                .set_field(job_id, &keys::status_field(*kind), ScanStatus::Completed.as_str())
                .await;
            let _ = inner
                .state
                .set_json(job_id, &keys::result_field(*kind), value)
                .await;
            results.insert(*kind, value.clone());
            continue;
        }

        match run.errors.get(kind) {
            Some(err) if err.is_cancelled() && cancel_requested => {
                // Partial output from a cancelled scanner is discarded
                any_cancelled = true;
                let _ = inner
                    .state
                    .set_field(job_id, &keys::status_field(*kind), ScanStatus::Cancelled.as_str())
                    .await;
            }
            Some(err) => {
                let message = if err.is_cancelled() && outcome.deadline_hit {
                    format!("task deadline exceeded: {}", err)
                } else {
                    err.to_string()
                };
                let _ = inner
                    .state
                    .set_field(job_id, &keys::status_field(*kind), ScanStatus::Failed.as_str())
                    .await;
                errors.insert(*kind, message);
            }
            None => {
                // Scanner neither succeeded nor errored: cancelled before start
                if cancel_requested {
                    any_cancelled = true;
                    let _ = inner
                        .state
                        .set_field(job_id, &keys::status_field(*kind), ScanStatus::Cancelled.as_str())
                        .await;
                } else {
                    let _ = inner
                        .state
                        .set_field(job_id, &keys::status_field(*kind), ScanStatus::Failed.as_str())
                        .await;
                    errors.insert(*kind, "scanner did not run".to_string());
                }
            }
        }
    }

    let status = if cancel_requested && any_cancelled {
        let _ = inner
            .state
            .set_field(job_id, defaults::FIELD_CANCELLED_AT, &Utc::now().to_rfc3339())
            .await;
        OverallStatus::Cancelled
    } else if errors.is_empty() && !results.is_empty() {
        OverallStatus::Completed
    } else if !results.is_empty() {
        OverallStatus::Partial
    } else {
        OverallStatus::Failed
    };

    if status == OverallStatus::Failed && !errors.is_empty() {
        // Surface the first scanner error in the task-level field too
        if let Some(message) = errors.values().next() {
            let _ = inner
                .state
                .set_field(job_id, defaults::FIELD_ERROR, message)
                .await;
        }
    }

    let _ = inner
        .state
        .set_field(job_id, defaults::FIELD_COMPLETED_AT, &Utc::now().to_rfc3339())
        .await;

    let payload = CompletionPayload::new(job_id, status)
        .with_results(results)
        .with_errors(errors);
    publish_completion(inner, payload).await;

    if let Some(artifact) = &outcome.artifact {
        inner.fetcher.cleanup(artifact).await;
    }
    info!("Job {} finished: {}", job_id, status);
}

/// Validation + tenant enforcement. Returns the parsed URI and the
/// normalized, tenant-checked object path.
fn validate_artifact(task: &TaskMessage) -> Result<(ArtifactUri, String), UriError> {
    let uri = ArtifactUri::parse(&task.artifact_uri)?;
    let object = uri.enforce_tenant(&task.tenant_id)?;
    Ok((uri, object))
}

fn unready_source(inner: &Arc<Inner>, kind: ScannerKind) -> Option<&'static str> {
    if inner.config.skip_db_update {
        return None;
    }
    required_sources(kind)
        .iter()
        .find(|source| !inner.readiness.is_ready(source))
        .copied()
}

/// Pre-scan failure: error field, per-scanner failed status, one `failed`
/// completion.
async fn fail_task(inner: &Arc<Inner>, task: &TaskMessage, reason: &str) {
    let job_id = &task.job_id;
    error!("Job {} failed: {}", job_id, reason);

    let mut fields = vec![
        (defaults::FIELD_ERROR.to_string(), reason.to_string()),
        (
            defaults::FIELD_COMPLETED_AT.to_string(),
            Utc::now().to_rfc3339(),
        ),
    ];
    for kind in &task.scanners {
        fields.push((keys::status_field(*kind), ScanStatus::Failed.to_string()));
    }
    if let Err(err) = inner.state.set_fields(job_id, &fields).await {
        error!("Job {}: failure state write failed: {}", job_id, err);
    }

    publish_completion(inner, CompletionPayload::new(job_id, OverallStatus::Failed)).await;
}

/// Cancellation observed before any scanner produced output.
async fn cancel_task(inner: &Arc<Inner>, task: &TaskMessage) {
    let job_id = &task.job_id;
    info!("Job {} cancelled", job_id);

    let mut fields = vec![(
        defaults::FIELD_CANCELLED_AT.to_string(),
        Utc::now().to_rfc3339(),
    )];
    for kind in &task.scanners {
        fields.push((keys::status_field(*kind), ScanStatus::Cancelled.to_string()));
    }
    if let Err(err) = inner.state.set_fields(job_id, &fields).await {
        error!("Job {}: cancel state write failed: {}", job_id, err);
    }

    publish_completion(
        inner,
        CompletionPayload::new(job_id, OverallStatus::Cancelled),
    )
    .await;
}

async fn publish_completion(inner: &Arc<Inner>, payload: CompletionPayload) {
    if let Err(err) = inner.completions.publish(&payload).await {
        error!(
            "Failed to publish completion for job {}: {}",
            payload.job_id, err
        );
    }
}
