//! In-process backend: a faithful stand-in for the Redis semantics the
//! pipeline relies on. Used by tests and standalone mode.
//!
//! TTLs are enforced lazily on access. One `Notify` wakes all blocked stream
//! readers; spurious wakeups re-check and go back to sleep.

use crate::backend::{StateBackend, StreamEntry, Subscription};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct GroupState {
    /// Index into the entry log: everything before it has been delivered.
    cursor: usize,
    /// Delivered but not yet acknowledged.
    pending: HashSet<String>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    streams: HashMap<String, StreamState>,
    expiries: HashMap<String, Instant>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    /// Lazy TTL enforcement for a single key.
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.expiries.remove(key);
                self.hashes.remove(key);
                self.strings.remove(key);
                self.streams.remove(key);
            }
        }
    }

    fn purge_all_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.expiries.remove(&key);
            self.hashes.remove(&key);
            self.strings.remove(&key);
            self.streams.remove(&key);
        }
    }

    fn key_exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
            || self.strings.contains_key(key)
            || self.streams.contains_key(key)
    }
}

/// In-memory `StateBackend`.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-write; tests want the panic, not
        // a hang.
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.purge_if_expired(key);
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_set_multi(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.purge_if_expired(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        inner.purge_if_expired(key);
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut inner = self.lock();
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        inner.purge_if_expired(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn string_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.strings.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => {
                inner.expiries.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                inner.expiries.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.expiries.remove(key);
        let existed = inner.hashes.remove(key).is_some()
            | inner.strings.remove(key).is_some()
            | inner.streams.remove(key).is_some();
        drop(inner);
        // Wake blocked readers so a deleted stream surfaces promptly.
        self.notify.notify_waiters();
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge_if_expired(key);
        Ok(inner.key_exists(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge_if_expired(key);
        if !inner.key_exists(key) {
            return Ok(false);
        }
        inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        inner.purge_all_expired();
        let mut keys: Vec<String> = inner
            .hashes
            .keys()
            .chain(inner.strings.keys())
            .chain(inner.streams.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let sender = {
            let inner = self.lock();
            inner.channels.get(channel).cloned()
        };
        match sender {
            Some(sender) => Ok(sender.send(payload.to_string()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        let sender = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(Subscription::from_broadcast(sender.subscribe()))
    }

    async fn stream_add(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, StoreError> {
        let id = {
            let mut inner = self.lock();
            inner.purge_if_expired(stream);
            let state = inner.streams.entry(stream.to_string()).or_default();
            state.next_seq += 1;
            let id = format!("{}-0", state.next_seq);
            state.entries.push(StreamEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn group_ensure(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.purge_if_expired(stream);
        let state = inner.streams.entry(stream.to_string()).or_default();
        let start_cursor = if start_id == "$" {
            state.entries.len()
        } else {
            0
        };
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                cursor: start_cursor,
                pending: HashSet::new(),
            });
        Ok(())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an add racing with the
            // check is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);

            {
                let mut inner = self.lock();
                inner.purge_if_expired(stream);
                let state = inner
                    .streams
                    .get_mut(stream)
                    .ok_or_else(|| StoreError::NoGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    })?;
                let group_state =
                    state
                        .groups
                        .get_mut(group)
                        .ok_or_else(|| StoreError::NoGroup {
                            stream: stream.to_string(),
                            group: group.to_string(),
                        })?;

                if group_state.cursor < state.entries.len() {
                    let end = (group_state.cursor + count.max(1)).min(state.entries.len());
                    let batch: Vec<StreamEntry> =
                        state.entries[group_state.cursor..end].to_vec();
                    group_state.cursor = end;
                    for entry in &batch {
                        group_state.pending.insert(entry.id.clone());
                    }
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let remaining = deadline - now;
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(id) {
                acked += 1;
            }
        }
        Ok(acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn hash_fields_roundtrip() {
        let backend = MemoryBackend::new();
        backend.hash_set("k", "a", "1").await.unwrap();
        backend
            .hash_set_multi("k", &pairs(&[("b", "2"), ("c", "3")]))
            .await
            .unwrap();

        assert_eq!(backend.hash_get("k", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(backend.hash_get("k", "missing").await.unwrap(), None);
        assert_eq!(backend.hash_get_all("k").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ttl_expires_keys() {
        let backend = MemoryBackend::new();
        backend.hash_set("k", "a", "1").await.unwrap();
        assert!(backend.expire("k", Duration::from_millis(20)).await.unwrap());
        assert!(backend.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!backend.exists("k").await.unwrap());
        assert_eq!(backend.hash_get("k", "a").await.unwrap(), None);

        // Expire on a missing key reports false
        assert!(!backend.expire("gone", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn blocked_read_returns_empty_after_timeout() {
        let backend = MemoryBackend::new();
        backend.group_ensure("s", "g", "$").await.unwrap();

        let started = Instant::now();
        let entries = backend
            .group_read("s", "g", "c1", 1, Duration::from_millis(60))
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_add() {
        let backend = Arc::new(MemoryBackend::new());
        backend.group_ensure("s", "g", "$").await.unwrap();

        let reader = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                backend
                    .group_read("s", "g", "c1", 4, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend
            .stream_add("s", &pairs(&[("data", "hello")]))
            .await
            .unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data(), Some("hello"));
    }

    #[tokio::test]
    async fn group_start_dollar_skips_history() {
        let backend = MemoryBackend::new();
        backend
            .stream_add("s", &pairs(&[("data", "old")]))
            .await
            .unwrap();
        backend.group_ensure("s", "g", "$").await.unwrap();
        backend
            .stream_add("s", &pairs(&[("data", "new")]))
            .await
            .unwrap();

        let entries = backend
            .group_read("s", "g", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data(), Some("new"));
    }

    #[tokio::test]
    async fn missing_group_is_no_group_error() {
        let backend = MemoryBackend::new();
        let err = backend
            .group_read("nope", "g", "c1", 1, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_no_group());
    }

    #[tokio::test]
    async fn ack_clears_pending() {
        let backend = MemoryBackend::new();
        backend.group_ensure("s", "g", "0").await.unwrap();
        backend
            .stream_add("s", &pairs(&[("data", "x")]))
            .await
            .unwrap();

        let entries = backend
            .group_read("s", "g", "c1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);

        let acked = backend
            .ack("s", "g", &[entries[0].id.clone()])
            .await
            .unwrap();
        assert_eq!(acked, 1);

        // Second ack is a no-op
        let acked = backend
            .ack("s", "g", &[entries[0].id.clone()])
            .await
            .unwrap();
        assert_eq!(acked, 0);
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscribers() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe("chan").await.unwrap();

        let receivers = backend.publish("chan", "stop").await.unwrap();
        assert_eq!(receivers, 1);
        assert_eq!(sub.recv().await.as_deref(), Some("stop"));

        // No subscribers on an unknown channel
        assert_eq!(backend.publish("other", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn string_ttl_and_scan() {
        let backend = MemoryBackend::new();
        backend
            .string_set("cache:a", "1", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        backend.string_set("cache:b", "2", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let keys = backend.scan_keys("cache:").await.unwrap();
        assert_eq!(keys, vec!["cache:b".to_string()]);
    }
}
