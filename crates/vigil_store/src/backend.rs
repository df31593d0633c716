//! The `StateBackend` trait: the pipeline's contract with its shared store.
//!
//! Keys are flat strings; hash fields, plain strings, pub/sub channels, and
//! streams share one key space (Redis semantics). All operations are atomic
//! per call - nothing here requires a read-modify-write transaction.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// One entry read from a stream: the entry id plus its field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// The conventional single `data` field carried by task and completion
    /// entries.
    pub fn data(&self) -> Option<&str> {
        self.fields.get("data").map(String::as_str)
    }
}

/// A live pub/sub subscription. Dropping it unsubscribes.
pub struct Subscription {
    inner: SubscriptionInner,
}

enum SubscriptionInner {
    Broadcast(broadcast::Receiver<String>),
    Channel(mpsc::Receiver<String>),
}

impl Subscription {
    pub(crate) fn from_broadcast(rx: broadcast::Receiver<String>) -> Self {
        Self {
            inner: SubscriptionInner::Broadcast(rx),
        }
    }

    pub(crate) fn from_channel(rx: mpsc::Receiver<String>) -> Self {
        Self {
            inner: SubscriptionInner::Channel(rx),
        }
    }

    /// Wait for the next message. `None` means the channel is gone
    /// (publisher side closed or backend shut down).
    pub async fn recv(&mut self) -> Option<String> {
        match &mut self.inner {
            SubscriptionInner::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(payload) => return Some(payload),
                    // A lagged subscriber only cares that *a* message fired;
                    // skip to the most recent.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            SubscriptionInner::Channel(rx) => rx.recv().await,
        }
    }
}

/// Everything the pipeline needs from its shared state store.
#[async_trait]
pub trait StateBackend: Send + Sync {
    // ---- hash fields (job state) ----

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Atomic multi-field write.
    async fn hash_set_multi(&self, key: &str, fields: &[(String, String)])
        -> Result<(), StoreError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    // ---- plain strings (cache entries) ----

    async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn string_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    // ---- key lifecycle ----

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Apply a TTL to an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Keys matching `{prefix}*`. Used by cache sweeps; not a hot path.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    // ---- pub/sub (cancellation) ----

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    // ---- streams with consumer groups (task intake, completions) ----

    /// Append an entry; returns the generated entry id.
    async fn stream_add(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, StoreError>;

    /// Idempotently create the group (and the stream if missing).
    /// `start_id` follows stream semantics: `"$"` = only new entries.
    async fn group_ensure(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError>;

    /// Read up to `count` undelivered entries for this consumer, blocking up
    /// to `block`. An empty result after the block timeout is not an error.
    /// A missing stream or group surfaces as `StoreError::NoGroup`.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledge delivered entries; returns how many were still pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, StoreError>;
}

/// Open a backend from a store URL: `redis://...` or `memory:`.
pub async fn connect(url: &str) -> Result<Arc<dyn StateBackend>, StoreError> {
    if url == "memory:" || url == "memory://" {
        return Ok(Arc::new(crate::memory::MemoryBackend::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let backend = crate::redis_backend::RedisBackend::connect(url).await?;
        return Ok(Arc::new(backend));
    }
    Err(StoreError::InvalidUrl(url.to_string()))
}
