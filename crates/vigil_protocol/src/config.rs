//! System configuration shared across the pipeline.

use crate::defaults;
use std::path::PathBuf;
use std::time::Duration;

/// Canonical system configuration used by the launcher, orchestrator, and
/// updater. Populated from CLI flags / environment by the binary; file-based
/// configuration is an external concern.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// State store URL (redis://... | memory:)
    pub store_url: String,
    /// Local signature database path (sqlite)
    pub signature_db_path: PathBuf,
    /// Scratch root for per-job downloads and extraction
    pub work_root: PathBuf,
    /// Task stream name
    pub task_stream: String,
    /// Consumer group name
    pub task_group: String,
    /// Orchestrator worker count
    pub workers: usize,
    /// Per-task deadline when the message carries none
    pub default_task_timeout: Duration,
    /// Grace period for in-flight tasks on shutdown
    pub shutdown_timeout: Duration,
    /// Job state retention
    pub job_ttl: Duration,
    /// Stream read block timeout
    pub block_timeout: Duration,
    /// Vulnerability cache entry lifetime
    pub cache_ttl: Duration,
    /// Bloom sizing: expected signature population
    pub bloom_expected_items: usize,
    /// Bloom sizing: target false-positive rate
    pub bloom_fp_rate: f64,
    /// Rebuild the bloom filter from the store at startup
    pub rebuild_bloom_on_start: bool,
    /// Air-gapped mode: scanners start without waiting for source readiness
    pub skip_db_update: bool,
    /// Process-wide key prefix
    pub key_prefix: String,
    /// Per-manager prefix for job state hashes
    pub state_prefix: String,
    /// Completion stream prefix
    pub completion_prefix: String,
    /// Cancellation channel prefix
    pub cancel_prefix: String,
    /// Vulnerability cache key prefix
    pub cache_prefix: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            store_url: "redis://127.0.0.1:6379".to_string(),
            signature_db_path: PathBuf::from("signatures.db"),
            work_root: std::env::temp_dir().join("vigil"),
            task_stream: defaults::DEFAULT_TASK_STREAM.to_string(),
            task_group: defaults::DEFAULT_TASK_GROUP.to_string(),
            workers: defaults::DEFAULT_WORKERS,
            default_task_timeout: Duration::from_secs(defaults::DEFAULT_TASK_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(defaults::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            job_ttl: Duration::from_secs(defaults::DEFAULT_JOB_TTL_SECS),
            block_timeout: Duration::from_millis(defaults::DEFAULT_BLOCK_TIMEOUT_MS),
            cache_ttl: Duration::from_secs(defaults::DEFAULT_CACHE_TTL_SECS),
            bloom_expected_items: defaults::DEFAULT_BLOOM_EXPECTED_ITEMS,
            bloom_fp_rate: defaults::DEFAULT_BLOOM_FP_RATE,
            rebuild_bloom_on_start: true,
            skip_db_update: false,
            key_prefix: defaults::DEFAULT_KEY_PREFIX.to_string(),
            state_prefix: defaults::DEFAULT_STATE_PREFIX.to_string(),
            completion_prefix: defaults::DEFAULT_COMPLETION_PREFIX.to_string(),
            cancel_prefix: defaults::DEFAULT_CANCEL_PREFIX.to_string(),
            cache_prefix: defaults::DEFAULT_CACHE_PREFIX.to_string(),
        }
    }
}
