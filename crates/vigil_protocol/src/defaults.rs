//! Canonical default values shared across the pipeline.

/// Task stream read by the orchestrator's consumer group.
pub const DEFAULT_TASK_STREAM: &str = "vigil:tasks";
/// Consumer group name shared by all orchestrator workers.
pub const DEFAULT_TASK_GROUP: &str = "vigil-workers";
/// Process-wide key prefix for everything written to the state store.
pub const DEFAULT_KEY_PREFIX: &str = "vigil:";
/// Per-manager prefix for job state hashes (composed after the key prefix).
pub const DEFAULT_STATE_PREFIX: &str = "jobs:";
/// Completion stream prefix; full key is `{prefix}:{job_id}`.
pub const DEFAULT_COMPLETION_PREFIX: &str = "vigil:done";
/// Cancellation channel prefix; full channel is `{prefix}:{job_id}`.
pub const DEFAULT_CANCEL_PREFIX: &str = "vigil:cancel";
/// Vulnerability cache key prefix.
pub const DEFAULT_CACHE_PREFIX: &str = "vigil:vuln";

/// Job state retention (7 days).
pub const DEFAULT_JOB_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// Per-task processing deadline when the message carries none (15 min).
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 15 * 60;
/// Vulnerability cache entry lifetime (24 hours).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
/// How long a stream read blocks waiting for new tasks.
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 5_000;
/// Orchestrator worker count.
pub const DEFAULT_WORKERS: usize = 4;
/// Grace period for in-flight tasks on shutdown before force-cancel.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Bloom filter sizing: expected signature population.
pub const DEFAULT_BLOOM_EXPECTED_ITEMS: usize = 10_000_000;
/// Bloom filter sizing: target false-positive rate.
pub const DEFAULT_BLOOM_FP_RATE: f64 = 0.001;

// Job state hash fields. Per-scanner fields are composed with a scanner
// suffix: `status:{scanner}`, `result:{scanner}`.
pub const FIELD_STATUS_PREFIX: &str = "status:";
pub const FIELD_RESULT_PREFIX: &str = "result:";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_TENANT_ID: &str = "tenant_id";
pub const FIELD_ARTIFACT_URI: &str = "artifact_uri";
pub const FIELD_STARTED_AT: &str = "started_at";
pub const FIELD_COMPLETED_AT: &str = "completed_at";
pub const FIELD_CANCELLED_AT: &str = "cancelled_at";

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
