//! Key composition for the shared state store.
//!
//! Every key the pipeline writes is composed here so the layout stays
//! greppable in one place: job state hashes, completion streams, cancel
//! channels, and vulnerability cache entries.

use crate::types::{PackageRef, ScannerKind};

/// Job state hash key: `{key_prefix}{state_prefix}{job_id}`.
pub fn job_state_key(key_prefix: &str, state_prefix: &str, job_id: &str) -> String {
    format!("{}{}{}", key_prefix, state_prefix, job_id)
}

/// Completion stream key: `{completion_prefix}:{job_id}`.
pub fn completion_stream_key(completion_prefix: &str, job_id: &str) -> String {
    format!("{}:{}", completion_prefix, job_id)
}

/// Cancellation pub/sub channel: `{cancel_prefix}:{job_id}`.
pub fn cancel_channel(cancel_prefix: &str, job_id: &str) -> String {
    format!("{}:{}", cancel_prefix, job_id)
}

/// Vulnerability cache key: `{cache_prefix}:{ecosystem}:{name}:{version}`.
pub fn cache_key(cache_prefix: &str, package: &PackageRef) -> String {
    format!("{}:{}", cache_prefix, package.cache_key())
}

/// Per-scanner status field inside a job state hash.
pub fn status_field(scanner: ScannerKind) -> String {
    format!("{}{}", crate::defaults::FIELD_STATUS_PREFIX, scanner)
}

/// Per-scanner result field inside a job state hash.
pub fn result_field(scanner: ScannerKind) -> String {
    format!("{}{}", crate::defaults::FIELD_RESULT_PREFIX, scanner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(job_state_key("vigil:", "jobs:", "j1"), "vigil:jobs:j1");
        assert_eq!(completion_stream_key("vigil:done", "j1"), "vigil:done:j1");
        assert_eq!(cancel_channel("vigil:cancel", "j1"), "vigil:cancel:j1");
        assert_eq!(
            cache_key("vigil:vuln", &PackageRef::new("pip", "requests", "2.31.0")),
            "vigil:vuln:pip:requests:2.31.0"
        );
        assert_eq!(status_field(ScannerKind::Antivirus), "status:antivirus");
        assert_eq!(result_field(ScannerKind::Dependency), "result:dependency");
    }
}
