//! Job state manager: one hash per job id in the shared store.
//!
//! Progress is encoded as independent field writes. Workers touching the
//! same job id interleave safely because every write is atomic on its own
//! field; nothing here reads-modifies-writes.

use crate::backend::StateBackend;
use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use vigil_protocol::keys;

#[derive(Clone)]
pub struct StateManager {
    backend: Arc<dyn StateBackend>,
    key_prefix: String,
    state_prefix: String,
    default_ttl: Duration,
}

impl StateManager {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        key_prefix: impl Into<String>,
        state_prefix: impl Into<String>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            key_prefix: key_prefix.into(),
            state_prefix: state_prefix.into(),
            default_ttl,
        }
    }

    /// Full store key for a job id.
    pub fn key(&self, job_id: &str) -> String {
        keys::job_state_key(&self.key_prefix, &self.state_prefix, job_id)
    }

    pub async fn set_field(&self, job_id: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.backend.hash_set(&self.key(job_id), field, value).await
    }

    /// Atomic multi-field write.
    pub async fn set_fields(
        &self,
        job_id: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        self.backend.hash_set_multi(&self.key(job_id), fields).await
    }

    pub async fn set_json<T: Serialize>(
        &self,
        job_id: &str,
        field: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.set_field(job_id, field, &raw).await
    }

    pub async fn get_field(&self, job_id: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.backend.hash_get(&self.key(job_id), field).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        job_id: &str,
        field: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get_field(job_id, field).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all_fields(
        &self,
        job_id: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        self.backend.hash_get_all(&self.key(job_id)).await
    }

    pub async fn delete(&self, job_id: &str) -> Result<bool, StoreError> {
        self.backend.delete(&self.key(job_id)).await
    }

    pub async fn exists(&self, job_id: &str) -> Result<bool, StoreError> {
        self.backend.exists(&self.key(job_id)).await
    }

    /// First write for a job: seed the field map and apply the default
    /// retention in one go.
    pub async fn init_state(
        &self,
        job_id: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        self.set_fields(job_id, fields).await?;
        self.set_ttl(job_id, self.default_ttl).await?;
        Ok(())
    }

    pub async fn set_ttl(&self, job_id: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.backend.expire(&self.key(job_id), ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde::{Deserialize, Serialize};

    fn manager() -> StateManager {
        StateManager::new(
            Arc::new(MemoryBackend::new()),
            "vigil:",
            "jobs:",
            Duration::from_secs(60),
        )
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        count: u32,
        detections: Vec<String>,
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let mgr = manager();
        mgr.set_field("j1", "status:antivirus", "running")
            .await
            .unwrap();
        assert_eq!(
            mgr.get_field("j1", "status:antivirus").await.unwrap().as_deref(),
            Some("running")
        );
        assert_eq!(mgr.key("j1"), "vigil:jobs:j1");
    }

    #[tokio::test]
    async fn json_fields_roundtrip() {
        let mgr = manager();
        let payload = Payload {
            count: 2,
            detections: vec!["Eicar-Test-Signature".to_string()],
        };
        mgr.set_json("j1", "result:antivirus", &payload).await.unwrap();
        let read: Payload = mgr
            .get_json("j1", "result:antivirus")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn init_state_applies_ttl() {
        let mgr = StateManager::new(
            Arc::new(MemoryBackend::new()),
            "vigil:",
            "jobs:",
            Duration::from_millis(30),
        );
        mgr.init_state("j1", &pairs(&[("started_at", "now")]))
            .await
            .unwrap();
        assert!(mgr.exists("j1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!mgr.exists("j1").await.unwrap());
    }

    #[tokio::test]
    async fn blind_overwrite_is_idempotent() {
        let mgr = manager();
        let fields = pairs(&[("status:antivirus", "completed"), ("error", "")]);
        mgr.set_fields("j1", &fields).await.unwrap();
        mgr.set_fields("j1", &fields).await.unwrap();

        let all = mgr.get_all_fields("j1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("status:antivirus").map(String::as_str), Some("completed"));
    }
}
