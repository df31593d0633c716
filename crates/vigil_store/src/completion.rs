//! Completion signal publisher.
//!
//! The completion stream is the only user-visible surface of the pipeline:
//! one entry per processing run, keyed `{completion_prefix}:{job_id}`, with
//! a single `data` field holding the JSON payload. Redeliveries append
//! additional entries; consumers dedupe by job id and status monotonicity.

use crate::backend::StateBackend;
use crate::error::StoreError;
use std::sync::Arc;
use tracing::info;
use vigil_protocol::keys;
use vigil_protocol::CompletionPayload;

#[derive(Clone)]
pub struct CompletionPublisher {
    backend: Arc<dyn StateBackend>,
    completion_prefix: String,
}

impl CompletionPublisher {
    pub fn new(backend: Arc<dyn StateBackend>, completion_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            completion_prefix: completion_prefix.into(),
        }
    }

    pub fn stream_key(&self, job_id: &str) -> String {
        keys::completion_stream_key(&self.completion_prefix, job_id)
    }

    /// Append the completion entry; returns the stream entry id.
    pub async fn publish(&self, payload: &CompletionPayload) -> Result<String, StoreError> {
        let data = serde_json::to_string(payload)?;
        let key = self.stream_key(&payload.job_id);
        let id = self
            .backend
            .stream_add(&key, &[("data".to_string(), data)])
            .await?;
        info!(
            "Published completion for job {}: {}",
            payload.job_id, payload.status
        );
        Ok(id)
    }
}
