//! Consumer-group reader over the task stream.
//!
//! At-least-once delivery. The consumer never acknowledges on its own; the
//! orchestrator acks explicitly (on receipt, before processing - see the
//! orchestrator for why). If the stream is deleted or purged externally the
//! group vanishes with it; `read` detects the NOGROUP condition, recreates
//! the group, and keeps going. Entries from before the purge are lost, which
//! is acceptable: the task producer owns durability.

use crate::backend::{StateBackend, StreamEntry};
use crate::error::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    /// Unique per process instance (e.g. `worker-{uuid}`).
    pub consumer: String,
    /// How long a read blocks waiting for entries.
    pub block: Duration,
    /// Where a newly created group starts reading. `"$"` = only new entries.
    pub start_id: String,
}

impl ConsumerConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            block: Duration::from_millis(vigil_protocol::defaults::DEFAULT_BLOCK_TIMEOUT_MS),
            start_id: "$".to_string(),
        }
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_start_id(mut self, start_id: impl Into<String>) -> Self {
        self.start_id = start_id.into();
        self
    }
}

pub struct StreamConsumer {
    backend: Arc<dyn StateBackend>,
    config: ConsumerConfig,
}

impl StreamConsumer {
    pub fn new(backend: Arc<dyn StateBackend>, config: ConsumerConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Idempotently create the group (and the stream if missing).
    pub async fn ensure_group(&self) -> Result<(), StoreError> {
        self.backend
            .group_ensure(&self.config.stream, &self.config.group, &self.config.start_id)
            .await
    }

    /// Read up to `max` entries, blocking up to the configured timeout.
    /// Returns an empty vec on timeout. Self-heals a vanished group: the
    /// group is recreated at stream start (everything in the recreated
    /// stream is post-purge) and the read retried once, so a message
    /// published between purge and heal is still observed.
    pub async fn read(&self, max: usize) -> Result<Vec<StreamEntry>, StoreError> {
        match self.read_once(max).await {
            Ok(entries) => Ok(entries),
            Err(err) if err.is_no_group() => {
                warn!(
                    "Consumer group '{}' missing on '{}' (stream purged?); recreating",
                    self.config.group, self.config.stream
                );
                // Entries from before the purge died with the old stream;
                // position 0 of the recreated stream loses nothing.
                self.backend
                    .group_ensure(&self.config.stream, &self.config.group, "0")
                    .await?;
                info!(
                    "Recreated consumer group '{}' on '{}'",
                    self.config.group, self.config.stream
                );
                self.read_once(max).await
            }
            Err(err) => Err(err),
        }
    }

    async fn read_once(&self, max: usize) -> Result<Vec<StreamEntry>, StoreError> {
        self.backend
            .group_read(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                max,
                self.config.block,
            )
            .await
    }

    pub async fn ack(&self, id: &str) -> Result<usize, StoreError> {
        self.ack_many(&[id.to_string()]).await
    }

    pub async fn ack_many(&self, ids: &[String]) -> Result<usize, StoreError> {
        self.backend
            .ack(&self.config.stream, &self.config.group, ids)
            .await
    }

    /// Append an entry to the task stream (producer side; used by tests and
    /// the CLI's enqueue path).
    pub async fn publish(&self, fields: &[(String, String)]) -> Result<String, StoreError> {
        self.backend.stream_add(&self.config.stream, fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use std::time::Instant;

    fn data(value: &str) -> Vec<(String, String)> {
        vec![("data".to_string(), value.to_string())]
    }

    fn consumer(backend: Arc<MemoryBackend>) -> StreamConsumer {
        StreamConsumer::new(
            backend,
            ConsumerConfig::new("tasks", "workers", "c1").with_block(Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn read_returns_published_entries() {
        let backend = Arc::new(MemoryBackend::new());
        let consumer = consumer(Arc::clone(&backend));
        consumer.ensure_group().await.unwrap();

        consumer.publish(&data("t1")).await.unwrap();
        consumer.publish(&data("t2")).await.unwrap();

        let entries = consumer.read(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].data(), Some("t1"));

        let acked = consumer
            .ack_many(&entries.iter().map(|e| e.id.clone()).collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(acked, 2);
    }

    #[tokio::test]
    async fn empty_read_after_block_timeout_is_ok() {
        let backend = Arc::new(MemoryBackend::new());
        let consumer = consumer(backend);
        consumer.ensure_group().await.unwrap();

        let started = Instant::now();
        let entries = consumer.read(1).await.unwrap();
        assert!(entries.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn self_heals_after_external_stream_delete() {
        let backend = Arc::new(MemoryBackend::new());
        let consumer = consumer(Arc::clone(&backend));
        consumer.ensure_group().await.unwrap();
        consumer.publish(&data("before")).await.unwrap();

        // External purge of the stream key, then a fresh message
        backend.delete("tasks").await.unwrap();
        consumer.publish(&data("after")).await.unwrap();

        // The next read heals the group instead of erroring and already
        // observes the post-purge message
        let entries = consumer.read(1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data(), Some("after"));
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let consumer = consumer(backend);
        consumer.ensure_group().await.unwrap();
        consumer.publish(&data("t1")).await.unwrap();
        // Re-ensuring must not reset the group's position
        consumer.ensure_group().await.unwrap();
        let entries = consumer.read(1).await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
